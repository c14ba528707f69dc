use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::stress::constants::*;
use crate::stress::error::{IoResultExt, StressError, StressResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub index: usize,
    pub path: PathBuf,
    pub unique_count: u64,
    pub original_count: u64,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub scheme: String,
    pub scale: u64,
    pub chunk_size: u64,
    pub approx_bytes_per_id: u64,
    pub created_at: DateTime<Utc>,
    pub chunks: Vec<ChunkMeta>,
}

impl Manifest {
    pub fn new(scheme: &str, scale: u64, chunk_size: u64, approx_bytes_per_id: u64) -> Self {
        Self {
            scheme: scheme.to_string(),
            scale,
            chunk_size,
            approx_bytes_per_id,
            created_at: Utc::now(),
            chunks: Vec::new(),
        }
    }

    pub fn chunk_unique_sum(&self) -> u64 {
        self.chunks.iter().map(|c| c.unique_count).sum()
    }

    pub fn generated_total(&self) -> u64 {
        self.chunks.iter().map(|c| c.original_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size_bytes).sum()
    }

    /// Chunk list order must equal index order, starting at zero.
    pub fn check_order(&self) -> StressResult<()> {
        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != position {
                return Err(StressError::manifest(format!(
                    "chunk at position {} carries index {}",
                    position, chunk.index
                )));
            }
        }
        Ok(())
    }
}

/// Owns one run's manifest and rewrites it in full after every append.
pub struct ManifestStore {
    directory: PathBuf,
    manifest: Manifest,
}

impl ManifestStore {
    /// Starts a manifest for a fresh run and persists the empty version.
    pub fn create(directory: &Path, manifest: Manifest) -> StressResult<Self> {
        std::fs::create_dir_all(directory).with_path(directory)?;
        let store = Self {
            directory: directory.to_path_buf(),
            manifest,
        };
        store.save()?;
        Ok(store)
    }

    /// Reads a manifest back and checks it against its sidecar checksum.
    pub fn load_verified(directory: &Path) -> StressResult<Manifest> {
        let manifest_path = directory.join(MANIFEST_FILE_NAME);
        let checksum_path = directory.join(MANIFEST_CHECKSUM_FILE_NAME);

        let data = std::fs::read(&manifest_path).with_path(&manifest_path)?;
        let recorded = std::fs::read_to_string(&checksum_path).with_path(&checksum_path)?;
        let actual = hex::encode(Sha256::digest(&data));
        if recorded.trim() != actual {
            return Err(StressError::manifest(format!(
                "checksum mismatch for {}: sidecar={} actual={}",
                manifest_path.display(),
                recorded.trim(),
                actual
            )));
        }

        let manifest: Manifest = serde_json::from_slice(&data).map_err(|e| {
            StressError::manifest(format!("cannot parse {}: {}", manifest_path.display(), e))
        })?;
        manifest.check_order()?;
        Ok(manifest)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(MANIFEST_FILE_NAME)
    }

    pub fn checksum_path(&self) -> PathBuf {
        self.directory.join(MANIFEST_CHECKSUM_FILE_NAME)
    }

    /// Records a committed chunk and atomically replaces the manifest.
    pub fn append(&mut self, meta: ChunkMeta) -> StressResult<()> {
        let expected = self.manifest.chunks.len();
        if meta.index != expected {
            return Err(StressError::manifest(format!(
                "chunk index {} appended where {} was expected",
                meta.index, expected
            )));
        }

        self.manifest.chunks.push(meta);
        if let Err(e) = self.save() {
            self.manifest.chunks.pop();
            return Err(e);
        }
        Ok(())
    }

    fn save(&self) -> StressResult<()> {
        let data = serde_json::to_vec_pretty(&self.manifest)
            .map_err(|e| StressError::manifest(format!("cannot serialize manifest: {}", e)))?;

        replace_atomically(
            &self.directory.join(MANIFEST_TEMP_FILE_NAME),
            &self.manifest_path(),
            &data,
        )?;

        let checksum = hex::encode(Sha256::digest(&data));
        replace_atomically(
            &self.directory.join(MANIFEST_CHECKSUM_TEMP_FILE_NAME),
            &self.checksum_path(),
            checksum.as_bytes(),
        )?;

        debug!(
            "manifest for {} saved with {} chunks",
            self.manifest.scheme,
            self.manifest.chunks.len()
        );
        Ok(())
    }
}

/// Write to `temp`, fsync, rename over `target`, then fsync the directory so
/// the rename itself is durable.
fn replace_atomically(temp: &Path, target: &Path, data: &[u8]) -> StressResult<()> {
    {
        let mut file = File::create(temp).with_path(temp)?;
        file.write_all(data).with_path(temp)?;
        file.sync_all().with_path(temp)?;
    }

    std::fs::rename(temp, target).with_path(target)?;

    if let Some(parent) = target.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> StressResult<()> {
    File::open(dir).and_then(|d| d.sync_all()).with_path(dir)
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> StressResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(dir: &Path, index: usize, unique: u64) -> ChunkMeta {
        ChunkMeta {
            index,
            path: dir.join(format!("test-chunk-{:05}.dat", index)),
            unique_count: unique,
            original_count: unique + 1,
            hash: "ab".repeat(32),
            size_bytes: unique * 10,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_writes_empty_manifest() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::create(dir.path(), Manifest::new("ulid", 10, 4, 64)).unwrap();

        assert!(store.manifest_path().exists());
        assert!(store.checksum_path().exists());
        assert!(!dir.path().join(MANIFEST_TEMP_FILE_NAME).exists());

        let loaded = ManifestStore::load_verified(dir.path()).unwrap();
        assert_eq!(loaded.scheme, "ulid");
        assert!(loaded.chunks.is_empty());
    }

    #[test]
    fn test_append_rewrites_full_manifest() {
        let dir = tempdir().unwrap();
        let mut store =
            ManifestStore::create(dir.path(), Manifest::new("ksuid", 10, 4, 64)).unwrap();

        store.append(meta(dir.path(), 0, 3)).unwrap();
        store.append(meta(dir.path(), 1, 4)).unwrap();

        let loaded = ManifestStore::load_verified(dir.path()).unwrap();
        assert_eq!(loaded.chunks.len(), 2);
        assert_eq!(loaded.chunk_unique_sum(), 7);
        assert_eq!(loaded.generated_total(), 9);
        assert_eq!(&loaded, store.manifest());
    }

    #[test]
    fn test_append_rejects_out_of_order_index() {
        let dir = tempdir().unwrap();
        let mut store =
            ManifestStore::create(dir.path(), Manifest::new("ksuid", 10, 4, 64)).unwrap();

        let err = store.append(meta(dir.path(), 1, 3)).unwrap_err();
        assert!(matches!(err, StressError::Manifest { .. }));
        assert!(store.manifest().chunks.is_empty());
    }

    #[test]
    fn test_sidecar_detects_tampering() {
        let dir = tempdir().unwrap();
        let mut store =
            ManifestStore::create(dir.path(), Manifest::new("ulid", 10, 4, 64)).unwrap();
        store.append(meta(dir.path(), 0, 3)).unwrap();

        let path = store.manifest_path();
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"unique_count\": 3", "\"unique_count\": 4");
        std::fs::write(&path, tampered).unwrap();

        let err = ManifestStore::load_verified(dir.path()).unwrap_err();
        assert!(matches!(err, StressError::Manifest { .. }));
    }
}
