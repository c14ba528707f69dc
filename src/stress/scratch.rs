use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::stress::constants::SCRATCH_DIR_PREFIX;
use crate::stress::error::{IoResultExt, StressError, StressResult};

const SCRATCH_CREATE_ATTEMPTS: usize = 16;

/// Private working directory for one scheme run, removed on drop unless
/// retention was requested.
#[derive(Debug)]
pub struct ScratchArea {
    path: PathBuf,
    keep: bool,
}

impl ScratchArea {
    /// Creates `<base>/idsift-<scheme>-<suffix>`, retrying on name clashes.
    pub fn create(base: &Path, scheme: &str, keep: bool) -> StressResult<Self> {
        std::fs::create_dir_all(base).with_path(base)?;

        let label = scratch_label(scheme);
        let mut rng = rand::thread_rng();
        for _ in 0..SCRATCH_CREATE_ATTEMPTS {
            let suffix: u32 = rng.gen();
            let path = base.join(format!("{}{}-{:08x}", SCRATCH_DIR_PREFIX, label, suffix));
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    debug!("scratch area for {} at {}", scheme, path.display());
                    return Ok(Self { path, keep });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StressError::io(path, e)),
            }
        }

        Err(StressError::io(
            base,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "could not find a free scratch directory name",
            ),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_retained(&self) -> bool {
        self.keep
    }
}

impl Drop for ScratchArea {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!("failed to remove scratch area {}: {}", self.path.display(), e);
        }
    }
}

/// File-name-safe form of a scheme name: anything outside `[A-Za-z0-9_]`
/// becomes `_`, so the result never carries a separator or `..`.
pub(crate) fn scratch_label(scheme: &str) -> String {
    scheme
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_removed_on_drop() {
        let base = tempdir().unwrap();
        let scratch = ScratchArea::create(base.path(), "ulid", false).unwrap();
        let path = scratch.path().to_path_buf();
        std::fs::write(path.join("x.dat"), b"x\n").unwrap();

        assert!(path.starts_with(base.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("idsift-ulid-"));

        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_retained_when_requested() {
        let base = tempdir().unwrap();
        let scratch = ScratchArea::create(base.path(), "my/scheme", true).unwrap();
        let path = scratch.path().to_path_buf();
        assert!(scratch.is_retained());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("idsift-my_scheme-"));

        drop(scratch);
        assert!(path.exists());
    }

    #[test]
    fn test_label_cannot_leave_directory() {
        assert_eq!(scratch_label("../evil/x"), "___evil_x");
        assert_eq!(scratch_label("nanoid16"), "nanoid16");
        assert_eq!(scratch_label("C:\\tmp"), "C__tmp");
    }

    #[test]
    fn test_runs_are_isolated() {
        let base = tempdir().unwrap();
        let a = ScratchArea::create(base.path(), "ksuid", false).unwrap();
        let b = ScratchArea::create(base.path(), "ksuid", false).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
