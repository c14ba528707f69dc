pub const BYTES_PER_KB: usize = 1024;
pub const BYTES_PER_MB: usize = 1_048_576;
pub const MB_AS_F64: f64 = 1_048_576.0;

pub const SECONDS_PER_MINUTE: u64 = 60;
pub const SECONDS_PER_HOUR: u64 = 3600;

pub const VERBOSITY_SILENT: &str = "silent";
pub const VERBOSITY_NORMAL: &str = "normal";
pub const VERBOSITY_VERBOSE: &str = "verbose";

pub const SUMMARY_RULE_WIDTH: usize = 72;
