//! Per-scheme pipeline: disk guard, chunk production and persistence,
//! verification, merge.

use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::schemes::IdGenerator;
use crate::stress::cancel::CancelToken;
use crate::stress::chunk::{ChunkProducer, ChunkStore, ProducedChunk};
use crate::stress::config::StressConfig;
use crate::stress::error::{StressError, StressResult};
use crate::stress::guard::ResourceGuard;
use crate::stress::manifest::{Manifest, ManifestStore};
use crate::stress::merger::MergeEngine;
use crate::stress::scratch::ScratchArea;
use crate::stress::verifier::ChunkVerifier;

/// Summary of one completed scheme run.
#[derive(Debug, Clone, Serialize)]
pub struct SchemeResult {
    pub scheme: String,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub chunks: usize,
    pub generated: u64,
    /// Sum of the per-chunk unique counts.
    pub chunk_unique: u64,
    pub unique: u64,
    /// Cross-chunk collisions found by the merge.
    pub duplicates: u64,
    pub verified_bytes: u64,
    pub manifest_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub retained: bool,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

pub struct SchemeProcessor {
    scheme: String,
    generator: Arc<dyn IdGenerator>,
    config: Arc<StressConfig>,
    guard: ResourceGuard,
    cancel: CancelToken,
}

impl SchemeProcessor {
    /// `config` is expected to be normalized already.
    pub fn new(
        scheme: &str,
        generator: Arc<dyn IdGenerator>,
        config: Arc<StressConfig>,
        guard: ResourceGuard,
        cancel: CancelToken,
    ) -> Self {
        Self {
            scheme: scheme.to_string(),
            generator,
            config,
            guard,
            cancel,
        }
    }

    pub fn run(self) -> StressResult<SchemeResult> {
        let start = Instant::now();
        self.cancel.check()?;

        let config = Arc::clone(&self.config);
        let scratch = ScratchArea::create(
            &config.base_directory(),
            &self.scheme,
            config.keep_temp_data,
        )?;

        self.guard.check_disk(
            scratch.path(),
            config.estimated_total_bytes(),
            config.disk_safety_factor,
        )?;

        let mut manifest = ManifestStore::create(
            scratch.path(),
            Manifest::new(
                &self.scheme,
                config.scale,
                config.chunk_size,
                config.approx_bytes_per_id,
            ),
        )?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("idsift-gen-{}", i))
            .build()
            .map_err(|e| StressError::config(format!("cannot build worker pool: {}", e)))?;
        let producer = ChunkProducer::new(&self.scheme, Arc::clone(&self.generator), Arc::new(pool));
        let store = ChunkStore::new(
            scratch.path().to_path_buf(),
            &self.scheme,
            config.io_buffer_size_bytes(),
        );

        info!(
            "{}: generating {} ids in {} chunks of up to {} ({} workers)",
            self.scheme,
            config.scale,
            config.chunk_count(),
            config.chunk_size,
            config.workers
        );

        let plan = self.chunk_plan();
        if config.overlap_persistence {
            self.produce_overlapped(&producer, &store, &mut manifest, plan)?;
        } else {
            self.produce_sequential(&producer, &store, &mut manifest, plan)?;
        }

        let generated = manifest.manifest().generated_total();
        if generated != config.scale {
            return Err(StressError::consistency(format!(
                "{} generated {} ids, expected {}",
                self.scheme, generated, config.scale
            )));
        }

        let report = ChunkVerifier::verify_all(manifest.manifest(), &self.cancel)?;

        let verbose = config.verbose;
        let scheme = self.scheme.as_str();
        let outcome = MergeEngine::new(config.io_buffer_size_bytes(), config.log_interval)
            .merge_with_progress(manifest.manifest(), &self.cancel, |p| {
                log_progress(
                    verbose,
                    format_args!(
                        "{}: merged {} (unique={} duplicates={})",
                        scheme, p.processed, p.unique, p.duplicates
                    ),
                );
            })?;

        let result = SchemeResult {
            scheme: self.scheme.clone(),
            duration: start.elapsed(),
            chunks: manifest.manifest().chunks.len(),
            generated,
            chunk_unique: manifest.manifest().chunk_unique_sum(),
            unique: outcome.unique,
            duplicates: outcome.duplicates,
            verified_bytes: report.bytes_verified,
            manifest_path: manifest.manifest_path(),
            scratch_dir: scratch.path().to_path_buf(),
            retained: scratch.is_retained(),
        };

        info!(
            "{}: {} unique, {} cross-chunk duplicates over {} chunks in {:?}",
            result.scheme, result.unique, result.duplicates, result.chunks, result.duration
        );
        Ok(result)
    }

    /// `(index, count)` for every chunk; the last one takes the remainder.
    fn chunk_plan(&self) -> Vec<(usize, u64)> {
        let mut plan = Vec::new();
        let mut remaining = self.config.scale;
        while remaining > 0 {
            let count = remaining.min(self.config.chunk_size.max(1));
            plan.push((plan.len(), count));
            remaining -= count;
        }
        plan
    }

    fn produce_sequential(
        &self,
        producer: &ChunkProducer,
        store: &ChunkStore,
        manifest: &mut ManifestStore,
        plan: Vec<(usize, u64)>,
    ) -> StressResult<()> {
        for (index, count) in plan {
            let chunk = self.produce_chunk(producer, index, count, &self.cancel)?;
            self.commit_chunk(store, manifest, chunk)?;
        }
        Ok(())
    }

    fn produce_overlapped(
        &self,
        producer: &ChunkProducer,
        store: &ChunkStore,
        manifest: &mut ManifestStore,
        plan: Vec<(usize, u64)>,
    ) -> StressResult<()> {
        overlapped_pipeline(
            plan,
            &self.cancel,
            |index, count, stop| self.produce_chunk(producer, index, count, stop),
            |chunk| self.commit_chunk(store, manifest, chunk),
        )
    }

    fn produce_chunk(
        &self,
        producer: &ChunkProducer,
        index: usize,
        count: u64,
        cancel: &CancelToken,
    ) -> StressResult<ProducedChunk> {
        cancel.check()?;

        let reservation = self.guard.check_memory(
            count,
            self.config.approx_bytes_per_id,
            self.config.mem_guard_mb,
        )?;

        let counter = producer.generated_counter();
        let before = counter.load(Ordering::Relaxed);
        let mut chunk = producer.produce(index, count, cancel)?;
        chunk.reservation = Some(reservation);
        let after = counter.load(Ordering::Relaxed);

        let interval = self.config.log_interval.max(1);
        if after / interval > before / interval {
            log_progress(
                self.config.verbose,
                format_args!(
                    "{}: generated {}/{} ({} unique in chunk {})",
                    self.scheme,
                    after,
                    self.config.scale,
                    chunk.unique_count(),
                    index
                ),
            );
        }
        Ok(chunk)
    }

    fn commit_chunk(
        &self,
        store: &ChunkStore,
        manifest: &mut ManifestStore,
        chunk: ProducedChunk,
    ) -> StressResult<()> {
        let meta = store.persist(&chunk)?;
        // Buffer and reservation go together, before the manifest write.
        drop(chunk);

        debug!(
            "{}: chunk {} committed ({} unique of {}, {} bytes)",
            self.scheme, meta.index, meta.unique_count, meta.original_count, meta.size_bytes
        );
        manifest.append(meta)
    }
}

/// Produces item N+1 while item N is committed. The rendezvous channel keeps
/// at most two items alive, each holding its own reservation. A failed commit
/// stops the producer through a child of `cancel`, leaving `cancel` itself
/// untouched.
fn overlapped_pipeline<T, P, C>(
    plan: Vec<(usize, u64)>,
    cancel: &CancelToken,
    produce: P,
    mut commit: C,
) -> StressResult<()>
where
    T: Send,
    P: Fn(usize, u64, &CancelToken) -> StressResult<T> + Sync,
    C: FnMut(T) -> StressResult<()>,
{
    let stop = cancel.child();

    std::thread::scope(|scope| {
        let (tx, rx) = mpsc::sync_channel::<T>(0);
        let producer_stop = stop.clone();
        let produce = &produce;

        let producing = scope.spawn(move || -> StressResult<()> {
            for (index, count) in plan {
                let item = produce(index, count, &producer_stop)?;
                if tx.send(item).is_err() {
                    break;
                }
            }
            Ok(())
        });

        let mut persisted = Ok(());
        for item in rx.iter() {
            if let Err(e) = commit(item) {
                stop.cancel();
                persisted = Err(e);
                break;
            }
        }
        drop(rx);

        let produced = match producing.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        };
        // The commit error is the root cause; the producer only saw the stop.
        persisted.and(produced)
    })
}

fn log_progress(verbose: bool, message: std::fmt::Arguments<'_>) {
    if verbose {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[test]
    fn test_commit_failure_stops_producer() {
        let cancel = CancelToken::new();
        let saw_stop = AtomicBool::new(false);

        let err = overlapped_pipeline(
            vec![(0, 1), (1, 1), (2, 1)],
            &cancel,
            |index, _count, stop| {
                if index == 0 {
                    return Ok(index);
                }
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if stop.is_cancelled() {
                        saw_stop.store(true, Ordering::Relaxed);
                        return Err(StressError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(index)
            },
            |_index| Err(StressError::manifest("disk went away")),
        )
        .unwrap_err();

        assert!(matches!(err, StressError::Manifest { .. }));
        assert!(saw_stop.load(Ordering::Relaxed));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_overlapped_commits_in_plan_order() {
        let committed = Mutex::new(Vec::new());

        overlapped_pipeline(
            vec![(0, 3), (1, 3), (2, 1)],
            &CancelToken::new(),
            |index, count, _stop| Ok((index, count)),
            |item| {
                committed.lock().unwrap().push(item);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(committed.into_inner().unwrap(), vec![(0, 3), (1, 3), (2, 1)]);
    }

    #[test]
    fn test_producer_error_reported_when_commits_succeed() {
        let err = overlapped_pipeline(
            vec![(0, 1), (1, 1)],
            &CancelToken::new(),
            |index, _count, _stop| {
                if index == 1 {
                    Err(StressError::config("generator broke"))
                } else {
                    Ok(index)
                }
            },
            |_index| Ok(()),
        )
        .unwrap_err();

        assert!(matches!(err, StressError::Config { .. }));
    }
}
