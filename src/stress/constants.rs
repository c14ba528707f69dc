pub const DEFAULT_SCHEMES: &[&str] = &["nanoid16", "ulid", "ksuid"];
pub const DEFAULT_SCALE: u64 = 50_000_000;
pub const DEFAULT_CHUNK_SIZE: u64 = 1_000_000;
pub const DEFAULT_LOG_INTERVAL: u64 = 1_000_000;
pub const DEFAULT_APPROX_BYTES_PER_ID: u64 = 64;
pub const DEFAULT_MEM_GUARD_MB: f64 = 512.0;
pub const DEFAULT_DISK_SAFETY_FACTOR: f64 = 1.25;
pub const DEFAULT_IO_BUFFER_SIZE_KB: usize = 64;
pub const DEFAULT_MAX_PARALLEL_SCHEMES: usize = 1;
pub const DEFAULT_TEMP_DIR_NAME: &str = "tmp";

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const MANIFEST_TEMP_FILE_NAME: &str = "manifest.json.tmp";
pub const MANIFEST_CHECKSUM_FILE_NAME: &str = "manifest.json.sha256";
pub const MANIFEST_CHECKSUM_TEMP_FILE_NAME: &str = "manifest.json.sha256.tmp";
pub const CHUNK_FILE_INFIX: &str = "-chunk-";
pub const CHUNK_FILE_EXTENSION: &str = ".dat";
pub const SCRATCH_DIR_PREFIX: &str = "idsift-";

pub const RECORD_DELIMITER: u8 = b'\n';

/// Generation runs in slices of this many calls so cancellation is observed
/// at a coarse but bounded interval.
pub const GENERATION_SLICE: u64 = 65_536;
pub const HASH_READ_BUFFER_SIZE: usize = 64 * 1024;
pub const MERGE_HEAP_INITIAL_CAPACITY: usize = 1024;
