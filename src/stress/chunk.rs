use chrono::Utc;
use rayon::prelude::*;
use rayon::ThreadPool;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::schemes::IdGenerator;
use crate::stress::cancel::CancelToken;
use crate::stress::constants::*;
use crate::stress::error::{IoResultExt, StressError, StressResult};
use crate::stress::guard::MemoryReservation;
use crate::stress::manifest::ChunkMeta;
use crate::stress::scratch::scratch_label;

/// A sorted, duplicate-free batch that has not been persisted yet.
#[derive(Debug)]
pub struct ProducedChunk {
    pub index: usize,
    pub values: Vec<String>,
    pub requested: u64,
    pub hash: String,
    /// Held until the chunk is persisted so the guard keeps accounting for it.
    pub reservation: Option<MemoryReservation>,
}

impl ProducedChunk {
    pub fn unique_count(&self) -> u64 {
        self.values.len() as u64
    }
}

pub struct ChunkProducer {
    scheme: String,
    generator: Arc<dyn IdGenerator>,
    pool: Arc<ThreadPool>,
    generated: Arc<AtomicU64>,
}

impl ChunkProducer {
    pub fn new(scheme: &str, generator: Arc<dyn IdGenerator>, pool: Arc<ThreadPool>) -> Self {
        Self {
            scheme: scheme.to_string(),
            generator,
            pool,
            generated: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of generator invocations, shared with whoever reports progress.
    pub fn generated_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generated)
    }

    /// Calls the generator exactly `count` times, then sorts, drops adjacent
    /// duplicates and hashes the result. An identifier containing the record
    /// delimiter fails the chunk before it can reach disk.
    pub fn produce(
        &self,
        index: usize,
        count: u64,
        cancel: &CancelToken,
    ) -> StressResult<ProducedChunk> {
        let capacity = usize::try_from(count).map_err(|_| {
            StressError::config(format!(
                "chunk size {} exceeds supported buffer capacity",
                count
            ))
        })?;

        let mut values: Vec<String> = Vec::with_capacity(capacity);
        let mut remaining = count;
        while remaining > 0 {
            cancel.check()?;
            let slice = remaining.min(GENERATION_SLICE);
            let generator = &self.generator;
            self.pool.install(|| {
                values.par_extend(
                    (0..slice as usize)
                        .into_par_iter()
                        .map(|_| generator.generate()),
                );
            });
            self.generated.fetch_add(slice, Ordering::Relaxed);
            remaining -= slice;
        }

        let delimited = self
            .pool
            .install(|| values.par_iter().find_any(|v| holds_delimiter(v)).cloned());
        if let Some(value) = delimited {
            return Err(StressError::InvalidIdentifier {
                scheme: self.scheme.clone(),
                index,
                value,
            });
        }

        self.pool.install(|| values.par_sort_unstable());
        values.dedup();
        values.shrink_to_fit();

        let hash = content_hash(&values);
        Ok(ProducedChunk {
            index,
            values,
            requested: count,
            hash,
            reservation: None,
        })
    }
}

fn holds_delimiter(value: &str) -> bool {
    value.as_bytes().contains(&RECORD_DELIMITER)
}

/// SHA-256 of the values as they are laid out on disk, one per line.
pub fn content_hash(values: &[String]) -> String {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value.as_bytes());
        hasher.update([RECORD_DELIMITER]);
    }
    hex::encode(hasher.finalize())
}

/// Streams a file through SHA-256, returning the hex digest and byte count.
pub fn hash_file(path: &Path) -> StressResult<(String, u64)> {
    let file = File::open(path).with_path(path)?;
    let mut reader = BufReader::with_capacity(HASH_READ_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buffer).with_path(path)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// Writes chunk files into one scratch directory.
pub struct ChunkStore {
    directory: PathBuf,
    scheme: String,
    label: String,
    io_buffer_size: usize,
}

impl ChunkStore {
    pub fn new(directory: PathBuf, scheme: &str, io_buffer_size: usize) -> Self {
        Self {
            directory,
            scheme: scheme.to_string(),
            label: scratch_label(scheme),
            io_buffer_size,
        }
    }

    /// Always a direct child of the store directory, whatever the scheme name.
    pub fn chunk_path(&self, index: usize) -> PathBuf {
        self.directory.join(format!(
            "{}{}{:05}{}",
            self.label, CHUNK_FILE_INFIX, index, CHUNK_FILE_EXTENSION
        ))
    }

    /// Writes the chunk, forces it to stable storage and re-hashes the file.
    /// A hash differing from the in-memory one is an `IntegrityFault`.
    pub fn persist(&self, chunk: &ProducedChunk) -> StressResult<ChunkMeta> {
        if let Some(value) = chunk.values.iter().find(|v| holds_delimiter(v)) {
            return Err(StressError::InvalidIdentifier {
                scheme: self.scheme.clone(),
                index: chunk.index,
                value: value.clone(),
            });
        }

        let path = self.chunk_path(chunk.index);
        write_chunk_file(&path, &chunk.values, self.io_buffer_size)?;

        let (file_hash, size_bytes) = hash_file(&path)?;
        if file_hash != chunk.hash {
            return Err(StressError::IntegrityFault {
                index: chunk.index,
                path,
                expected: chunk.hash.clone(),
                actual: file_hash,
            });
        }

        Ok(ChunkMeta {
            index: chunk.index,
            path,
            unique_count: chunk.unique_count(),
            original_count: chunk.requested,
            hash: file_hash,
            size_bytes,
            created_at: Utc::now(),
        })
    }
}

pub fn write_chunk_file(path: &Path, values: &[String], io_buffer_size: usize) -> StressResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }

    let file = File::create(path).with_path(path)?;
    let mut writer = BufWriter::with_capacity(io_buffer_size, file);
    for value in values {
        writer.write_all(value.as_bytes()).with_path(path)?;
        writer.write_all(&[RECORD_DELIMITER]).with_path(path)?;
    }
    writer.flush().with_path(path)?;

    let file = writer
        .into_inner()
        .map_err(|e| StressError::io(path, e.into_error()))?;
    file.sync_all().with_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn pool() -> Arc<ThreadPool> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        )
    }

    fn sequence(values: &[&str]) -> Arc<dyn IdGenerator> {
        let queue = Mutex::new(
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<std::collections::VecDeque<_>>(),
        );
        Arc::new(move || queue.lock().unwrap().pop_front().unwrap_or_default())
    }

    #[test]
    fn test_produce_sorts_and_dedups() {
        let producer = ChunkProducer::new("seq", sequence(&["5", "3", "5", "1"]), pool());
        let chunk = producer.produce(0, 4, &CancelToken::new()).unwrap();

        assert_eq!(chunk.values, vec!["1", "3", "5"]);
        assert_eq!(chunk.unique_count(), 3);
        assert_eq!(chunk.requested, 4);
        assert_eq!(chunk.hash, content_hash(&chunk.values));
        assert_eq!(producer.generated_counter().load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_produce_observes_cancellation() {
        let producer = ChunkProducer::new("seq", sequence(&["a"]), pool());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = producer.produce(0, 1, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(producer.generated_counter().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_produce_rejects_embedded_delimiter() {
        let producer = ChunkProducer::new("custom", sequence(&["a\nb", "c"]), pool());
        let err = producer.produce(4, 2, &CancelToken::new()).unwrap_err();

        match err {
            StressError::InvalidIdentifier {
                scheme,
                index,
                value,
            } => {
                assert_eq!(scheme, "custom");
                assert_eq!(index, 4);
                assert_eq!(value, "a\nb");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_persist_refuses_embedded_delimiter() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf(), "seq", 4096);
        let values = vec!["a\nb".to_string(), "c".to_string()];
        let chunk = ProducedChunk {
            index: 0,
            hash: content_hash(&values),
            values,
            requested: 2,
            reservation: None,
        };

        let err = store.persist(&chunk).unwrap_err();
        assert!(matches!(err, StressError::InvalidIdentifier { index: 0, .. }));
        assert!(!store.chunk_path(0).exists());
    }

    #[test]
    fn test_chunk_path_stays_in_directory() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf(), "../evil/x", 4096);
        let path = store.chunk_path(0);

        assert_eq!(path, dir.path().join("___evil_x-chunk-00000.dat"));
        assert_eq!(path.parent(), Some(dir.path()));
    }

    #[test]
    fn test_content_hash_matches_file_bytes() {
        let values = vec!["alpha".to_string(), "beta".to_string()];
        let mut hasher = Sha256::new();
        hasher.update(b"alpha\nbeta\n");
        assert_eq!(content_hash(&values), hex::encode(hasher.finalize()));
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf(), "ulid", 4096);
        let values = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let chunk = ProducedChunk {
            index: 7,
            hash: content_hash(&values),
            values,
            requested: 4,
            reservation: None,
        };

        let meta = store.persist(&chunk).unwrap();
        assert_eq!(meta.path, dir.path().join("ulid-chunk-00007.dat"));
        assert_eq!(meta.unique_count, 3);
        assert_eq!(meta.original_count, 4);
        assert_eq!(meta.size_bytes, 6);
        assert_eq!(std::fs::read_to_string(&meta.path).unwrap(), "a\nb\nc\n");

        let (rehash, _) = hash_file(&meta.path).unwrap();
        assert_eq!(rehash, meta.hash);
    }

    #[test]
    fn test_persist_hash_mismatch_is_integrity_fault() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf(), "ulid", 4096);
        let chunk = ProducedChunk {
            index: 0,
            values: vec!["a".to_string()],
            requested: 1,
            hash: "0".repeat(64),
            reservation: None,
        };

        let err = store.persist(&chunk).unwrap_err();
        assert!(matches!(err, StressError::IntegrityFault { index: 0, .. }));
        assert!(err.is_fatal_fault());
    }
}
