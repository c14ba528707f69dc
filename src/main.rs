use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use idsift::constants::{SUMMARY_RULE_WIDTH, VERBOSITY_SILENT};
use idsift::stress::{CancelToken, SchemeResult, StressConfig, StressRunner};
use idsift::utils::{format_bytes, format_duration, ids_per_second, setup_logging, verbosity_label};

#[derive(Parser)]
#[command(name = "idsift")]
#[command(about = "Stress-tests identifier schemes for uniqueness with an on-disk external merge")]
#[command(version)]
struct Args {
    #[arg(long, value_delimiter = ',', help = "Comma separated schemes (nanoid16, ulid, ksuid, customuid)")]
    schemes: Option<Vec<String>>,

    #[arg(long, help = "Number of IDs to generate per scheme")]
    scale: Option<u64>,

    #[arg(long, help = "Number of IDs per chunk")]
    chunk: Option<u64>,

    #[arg(long, help = "Base directory for temporary chunk files")]
    tempdir: Option<PathBuf>,

    #[arg(long, help = "Keep temporary data after completion")]
    keep: bool,

    #[arg(long, help = "Progress log interval (IDs)")]
    log_interval: Option<u64>,

    #[arg(long, help = "Free memory (MB) to keep above the estimated chunk usage")]
    mem_guard: Option<f64>,

    #[arg(long, help = "Approximate bytes per ID for resource estimation")]
    bytes_per_id: Option<u64>,

    #[arg(long, help = "Disk safety factor multiplier")]
    disk_factor: Option<f64>,

    #[arg(short, long, help = "Generator threads per scheme (0 = all cores)")]
    workers: Option<usize>,

    #[arg(long, help = "Schemes to run at the same time")]
    parallel_schemes: Option<usize>,

    #[arg(long, help = "Persist each chunk before generating the next one")]
    sequential: bool,

    #[arg(short, long, help = "Optional JSON configuration file; flags override it")]
    config: Option<PathBuf>,

    #[arg(long, help = "Print results as JSON")]
    json: bool,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Only print errors and the summary")]
    quiet: bool,
}

impl Args {
    fn into_config(self) -> Result<(StressConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => StressConfig::from_file(path)?,
            None => StressConfig::default(),
        };

        if let Some(schemes) = self.schemes {
            config.schemes = schemes;
        }
        if let Some(scale) = self.scale {
            config.scale = scale;
        }
        if let Some(chunk) = self.chunk {
            config.chunk_size = chunk;
        }
        if self.tempdir.is_some() {
            config.temp_directory = self.tempdir;
        }
        if self.keep {
            config.keep_temp_data = true;
        }
        if let Some(interval) = self.log_interval {
            config.log_interval = interval;
        }
        if let Some(guard) = self.mem_guard {
            config.mem_guard_mb = guard;
        }
        if let Some(bytes) = self.bytes_per_id {
            config.approx_bytes_per_id = bytes;
        }
        if let Some(factor) = self.disk_factor {
            config.disk_safety_factor = factor;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(parallel) = self.parallel_schemes {
            config.max_parallel_schemes = parallel;
        }
        if self.sequential {
            config.overlap_persistence = false;
        }
        if self.verbose {
            config.verbose = true;
        }

        Ok((config, self.json))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let verbosity = if args.quiet {
        VERBOSITY_SILENT
    } else {
        verbosity_label(args.verbose)
    };
    setup_logging(verbosity)?;

    let (config, json) = args.into_config()?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, stopping");
            shutdown_flag_clone.store(true, Ordering::Relaxed);
        }
    });

    let runner = StressRunner::new(config)?.with_cancel(CancelToken::from_flag(shutdown_flag));
    let effective = runner.config();
    info!(
        "schemes={} scale={} chunk={} workers={} tempdir={}",
        effective.schemes.join(","),
        effective.scale,
        effective.chunk_size,
        effective.workers,
        effective.base_directory().display()
    );

    let results = runner.run().await?;
    let stats = runner.guard_stats();
    info!(
        "resource guard: {} memory checks, {} disk checks, {} rejections",
        stats.memory_checks, stats.disk_checks, stats.rejections
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_summary(&results, runner.config().keep_temp_data);
    }

    Ok(())
}

fn print_summary(results: &[SchemeResult], keep: bool) {
    println!("ID Stress Test Summary");
    println!("{}", "=".repeat(SUMMARY_RULE_WIDTH));
    for result in results {
        println!("Scheme:        {}", result.scheme);
        println!("Duration:      {}", format_duration(result.duration));
        println!("Chunks:        {}", result.chunks);
        println!("Generated:     {}", result.generated);
        println!("Chunk Unique:  {}", result.chunk_unique);
        println!("Unique:        {}", result.unique);
        println!("Duplicates:    {}", result.duplicates);
        println!("Verified:      {}", format_bytes(result.verified_bytes));
        println!(
            "Throughput:    {:.0} ids/sec",
            ids_per_second(result.generated, result.duration)
        );
        if keep {
            println!("Manifest:      {}", result.manifest_path.display());
            println!("Temp Dir:      {}", result.scratch_dir.display());
        }
        println!("{}", "-".repeat(SUMMARY_RULE_WIDTH));
    }
}
