use anyhow::Result;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::constants::{
    BYTES_PER_KB, SECONDS_PER_HOUR, SECONDS_PER_MINUTE, VERBOSITY_NORMAL, VERBOSITY_SILENT,
    VERBOSITY_VERBOSE,
};

pub fn setup_logging(verbosity: &str) -> Result<()> {
    let level = match verbosity {
        VERBOSITY_SILENT => Level::ERROR,
        VERBOSITY_NORMAL => Level::INFO,
        VERBOSITY_VERBOSE => Level::DEBUG,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("idsift={}", level).parse()?)
        .add_directive(format!("idsift_verify={}", level).parse()?);

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

pub fn verbosity_label(verbose: bool) -> &'static str {
    if verbose {
        VERBOSITY_VERBOSE
    } else {
        VERBOSITY_NORMAL
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= BYTES_PER_KB as f64 && unit_index < UNITS.len() - 1 {
        size /= BYTES_PER_KB as f64;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Formats a duration as `HH:MM:SS.mmm`.
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / SECONDS_PER_HOUR;
    let minutes = (total_seconds % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE;
    let seconds = total_seconds % SECONDS_PER_MINUTE;

    format!(
        "{:02}:{:02}:{:02}.{:03}",
        hours,
        minutes,
        seconds,
        duration.subsec_millis()
    )
}

pub fn ids_per_second(count: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    count as f64 / secs
}
