use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use idsift::constants::{BYTES_PER_KB, SUMMARY_RULE_WIDTH};
use idsift::stress::constants::DEFAULT_IO_BUFFER_SIZE_KB;
use idsift::stress::{CancelToken, ChunkVerifier, ManifestStore, MergeEngine};
use idsift::utils::{format_bytes, format_duration, setup_logging, verbosity_label};

/// Re-checks a retained run: manifest sidecar, every chunk hash, then a fresh
/// merge. Never generates or appends.
#[derive(Parser)]
#[command(name = "idsift-verify")]
#[command(about = "Verifies a retained idsift scratch directory and recounts it")]
#[command(version)]
struct Args {
    #[arg(help = "Scratch directory holding manifest.json")]
    directory: PathBuf,

    #[arg(long, default_value_t = DEFAULT_IO_BUFFER_SIZE_KB, help = "Read buffer per chunk (KB)")]
    buffer_kb: usize,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(verbosity_label(args.verbose))?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, stopping");
            shutdown_flag_clone.store(true, Ordering::Relaxed);
        }
    });
    let cancel = CancelToken::from_flag(shutdown_flag);

    let start = Instant::now();
    let directory = args.directory.clone();
    let buffer_size = args.buffer_kb.max(1) * BYTES_PER_KB;

    let (manifest, report, outcome) = tokio::task::spawn_blocking(move || {
        let manifest = ManifestStore::load_verified(&directory)?;
        info!(
            "manifest for {} lists {} chunks",
            manifest.scheme,
            manifest.chunks.len()
        );
        let report = ChunkVerifier::verify_all(&manifest, &cancel)?;
        let outcome = MergeEngine::new(buffer_size, 0).merge(&manifest, &cancel)?;
        Ok::<_, idsift::StressError>((manifest, report, outcome))
    })
    .await??;

    println!("Verified:      {}", args.directory.display());
    println!("{}", "=".repeat(SUMMARY_RULE_WIDTH));
    println!("Scheme:        {}", manifest.scheme);
    println!("Scale:         {}", manifest.scale);
    println!("Chunks:        {}", report.chunks_verified);
    println!("Bytes:         {}", format_bytes(report.bytes_verified));
    println!("Generated:     {}", manifest.generated_total());
    println!("Chunk Unique:  {}", manifest.chunk_unique_sum());
    println!("Unique:        {}", outcome.unique);
    println!("Duplicates:    {}", outcome.duplicates);
    println!("Elapsed:       {}", format_duration(start.elapsed()));

    Ok(())
}
