use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::constants::BYTES_PER_KB;
use crate::stress::constants::*;
use crate::stress::error::{IoResultExt, StressError, StressResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub schemes: Vec<String>,
    pub scale: u64,
    pub chunk_size: u64,
    pub workers: usize,
    pub temp_directory: Option<PathBuf>,
    pub keep_temp_data: bool,
    pub log_interval: u64,
    pub verbose: bool,
    pub approx_bytes_per_id: u64,
    pub mem_guard_mb: f64,
    pub disk_safety_factor: f64,
    /// Generate the next chunk while the previous one is written and verified.
    pub overlap_persistence: bool,
    pub max_parallel_schemes: usize,
    pub io_buffer_size_kb: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            schemes: DEFAULT_SCHEMES.iter().map(|s| s.to_string()).collect(),
            scale: DEFAULT_SCALE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 0,
            temp_directory: None,
            keep_temp_data: false,
            log_interval: DEFAULT_LOG_INTERVAL,
            verbose: false,
            approx_bytes_per_id: DEFAULT_APPROX_BYTES_PER_ID,
            mem_guard_mb: DEFAULT_MEM_GUARD_MB,
            disk_safety_factor: DEFAULT_DISK_SAFETY_FACTOR,
            overlap_persistence: true,
            max_parallel_schemes: DEFAULT_MAX_PARALLEL_SCHEMES,
            io_buffer_size_kb: DEFAULT_IO_BUFFER_SIZE_KB,
        }
    }
}

impl StressConfig {
    pub fn from_file(path: &Path) -> StressResult<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            StressError::config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> StressResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StressError::config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn validate(&self) -> StressResult<()> {
        if self.scale == 0 {
            return Err(StressError::config("scale must be > 0"));
        }

        if self.mem_guard_mb.is_nan() || self.mem_guard_mb < 0.0 {
            return Err(StressError::config("mem_guard_mb must be a non-negative number"));
        }

        if self.disk_safety_factor.is_nan() {
            return Err(StressError::config("disk_safety_factor must be a number"));
        }

        if self.io_buffer_size_kb == 0 {
            return Err(StressError::config("io_buffer_size_kb must be > 0"));
        }

        if self.max_parallel_schemes == 0 {
            return Err(StressError::config("max_parallel_schemes must be > 0"));
        }

        let mut seen = HashSet::new();
        for scheme in &self.schemes {
            let key = scheme.trim().to_lowercase();
            if key.is_empty() {
                return Err(StressError::config("scheme names must not be empty"));
            }
            if !seen.insert(key) {
                return Err(StressError::config(format!(
                    "scheme {:?} listed more than once",
                    scheme
                )));
            }
        }

        Ok(())
    }

    /// Validates, then replaces unset or out-of-range knobs with their defaults.
    pub fn normalized(mut self) -> StressResult<Self> {
        self.schemes = self
            .schemes
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if self.schemes.is_empty() {
            self.schemes = DEFAULT_SCHEMES.iter().map(|s| s.to_string()).collect();
        }

        self.validate()?;

        if self.chunk_size == 0 || self.chunk_size > self.scale {
            self.chunk_size = self.scale.min(DEFAULT_CHUNK_SIZE);
        }
        if self.workers == 0 {
            self.workers = rayon::current_num_threads().max(1);
        }
        if self.approx_bytes_per_id == 0 {
            self.approx_bytes_per_id = DEFAULT_APPROX_BYTES_PER_ID;
        }
        if self.log_interval == 0 {
            self.log_interval = DEFAULT_LOG_INTERVAL;
        }
        if self.disk_safety_factor <= 0.0 {
            self.disk_safety_factor = DEFAULT_DISK_SAFETY_FACTOR;
        }
        if self
            .temp_directory
            .as_ref()
            .map_or(true, |dir| dir.as_os_str().is_empty())
        {
            let cwd = std::env::current_dir().with_path(Path::new("."))?;
            self.temp_directory = Some(cwd.join(DEFAULT_TEMP_DIR_NAME));
        }

        Ok(self)
    }

    pub fn base_directory(&self) -> PathBuf {
        self.temp_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR_NAME))
    }

    pub fn io_buffer_size_bytes(&self) -> usize {
        self.io_buffer_size_kb * BYTES_PER_KB
    }

    pub fn estimated_total_bytes(&self) -> u64 {
        self.scale.saturating_mul(self.approx_bytes_per_id)
    }

    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.scale.div_ceil(self.chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validation() {
        let mut config = StressConfig::default();
        assert!(config.validate().is_ok());

        config.scale = 0;
        assert!(matches!(config.validate(), Err(StressError::Config { .. })));

        config.scale = 10;
        config.mem_guard_mb = -1.0;
        assert!(config.validate().is_err());

        config.mem_guard_mb = 0.0;
        config.schemes = vec!["ulid".into(), "ULID".into()];
        assert!(config.validate().is_err());

        config.schemes = vec!["ulid".into()];
        config.max_parallel_schemes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalization_defaults() {
        let config = StressConfig {
            schemes: vec![" ".into()],
            scale: 10,
            chunk_size: 0,
            approx_bytes_per_id: 0,
            log_interval: 0,
            disk_safety_factor: -3.0,
            temp_directory: Some(PathBuf::from("/scratch")),
            ..StressConfig::default()
        }
        .normalized()
        .unwrap();

        assert_eq!(config.schemes, vec!["nanoid16", "ulid", "ksuid"]);
        assert_eq!(config.chunk_size, 10);
        assert_eq!(config.approx_bytes_per_id, DEFAULT_APPROX_BYTES_PER_ID);
        assert_eq!(config.log_interval, DEFAULT_LOG_INTERVAL);
        assert_eq!(config.disk_safety_factor, DEFAULT_DISK_SAFETY_FACTOR);
        assert!(config.workers >= 1);
        assert_eq!(config.base_directory(), PathBuf::from("/scratch"));
    }

    #[test]
    fn test_chunk_size_clamped_to_scale() {
        let config = StressConfig {
            scale: 2_500_000,
            chunk_size: 5_000_000,
            temp_directory: Some(PathBuf::from("/scratch")),
            ..StressConfig::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.chunk_count(), 3);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idsift.json");

        let config = StressConfig {
            schemes: vec!["ulid".into()],
            scale: 1000,
            chunk_size: 100,
            keep_temp_data: true,
            ..StressConfig::default()
        };
        config.to_file(&path).unwrap();

        let loaded = StressConfig::from_file(&path).unwrap();
        assert_eq!(loaded.schemes, vec!["ulid"]);
        assert_eq!(loaded.scale, 1000);
        assert_eq!(loaded.chunk_size, 100);
        assert!(loaded.keep_temp_data);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "scale": 42 }"#).unwrap();

        let loaded = StressConfig::from_file(&path).unwrap();
        assert_eq!(loaded.scale, 42);
        assert_eq!(loaded.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(loaded.overlap_persistence);
    }
}
