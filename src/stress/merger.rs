//! K-way merge over persisted chunks.
//!
//! Each chunk is sorted and free of duplicates, so popping the heap yields the
//! union in non-decreasing order and equal values from different chunks come
//! out back to back. Comparing every popped value with the last emitted one
//! (the low-water mark) therefore counts each cross-chunk duplicate exactly
//! once, whatever order tied cursors are popped in.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use crate::stress::cancel::CancelToken;
use crate::stress::constants::{MERGE_HEAP_INITIAL_CAPACITY, RECORD_DELIMITER};
use crate::stress::error::{IoResultExt, StressError, StressResult};
use crate::stress::manifest::{ChunkMeta, Manifest};

/// Forward-only reader over one persisted chunk. Once exhausted it stays
/// exhausted.
pub struct ChunkCursor {
    index: usize,
    path: PathBuf,
    reader: BufReader<File>,
    line: Vec<u8>,
    current: Option<String>,
    exhausted: bool,
}

impl ChunkCursor {
    /// Opens the chunk and positions the cursor on its first value.
    pub fn open(meta: &ChunkMeta, buffer_size: usize) -> StressResult<Self> {
        let file = File::open(&meta.path).with_path(&meta.path)?;
        let mut cursor = Self {
            index: meta.index,
            path: meta.path.clone(),
            reader: BufReader::with_capacity(buffer_size, file),
            line: Vec::new(),
            current: None,
            exhausted: false,
        };
        cursor.read_next(None)?;
        Ok(cursor)
    }

    pub fn chunk_index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn advance(&mut self) -> StressResult<()> {
        let previous = self.current.take();
        self.read_next(previous.as_deref())
    }

    /// Moves the current value out; the caller hands it back to
    /// [`ChunkCursor::advance_past`] so ordering is still checked.
    fn take_current(&mut self) -> Option<String> {
        self.current.take()
    }

    fn advance_past(&mut self, previous: &str) -> StressResult<()> {
        self.current = None;
        self.read_next(Some(previous))
    }

    fn read_next(&mut self, previous: Option<&str>) -> StressResult<()> {
        if self.exhausted {
            return Ok(());
        }

        self.line.clear();
        let read = self
            .reader
            .read_until(RECORD_DELIMITER, &mut self.line)
            .with_path(&self.path)?;
        if read == 0 {
            self.exhausted = true;
            return Ok(());
        }
        if self.line.last() == Some(&RECORD_DELIMITER) {
            self.line.pop();
        }

        let value = String::from_utf8(std::mem::take(&mut self.line)).map_err(|_| {
            StressError::consistency(format!(
                "chunk {} ({}) holds a record that is not UTF-8",
                self.index,
                self.path.display()
            ))
        })?;

        if let Some(previous) = previous {
            if value.as_str() <= previous {
                return Err(StressError::consistency(format!(
                    "chunk {} ({}) is not strictly ascending: {:?} follows {:?}",
                    self.index,
                    self.path.display(),
                    value,
                    previous
                )));
            }
        }

        self.current = Some(value);
        Ok(())
    }
}

/// Heap entry ordered by value only; ties between cursors are left to the
/// heap.
#[derive(Debug)]
struct MergeEntry {
    value: String,
    cursor: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeProgress {
    pub processed: u64,
    pub unique: u64,
    pub duplicates: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub unique: u64,
    /// Collisions between chunks only; duplicates dropped inside a chunk
    /// never reach the merge.
    pub duplicates: u64,
    pub processed: u64,
    pub cursors: usize,
}

pub struct MergeEngine {
    io_buffer_size: usize,
    progress_interval: u64,
}

impl MergeEngine {
    pub fn new(io_buffer_size: usize, progress_interval: u64) -> Self {
        Self {
            io_buffer_size,
            progress_interval,
        }
    }

    pub fn merge(&self, manifest: &Manifest, cancel: &CancelToken) -> StressResult<MergeOutcome> {
        self.merge_with_progress(manifest, cancel, |_| {})
    }

    /// Runs the merge, calling `on_progress` every `progress_interval` popped
    /// values. Cancellation is checked before every pop.
    pub fn merge_with_progress<F>(
        &self,
        manifest: &Manifest,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> StressResult<MergeOutcome>
    where
        F: FnMut(&MergeProgress),
    {
        if manifest.chunks.is_empty() {
            return Err(StressError::consistency(format!(
                "manifest for {} contains no chunks",
                manifest.scheme
            )));
        }

        let mut cursors = Vec::with_capacity(manifest.chunks.len());
        for meta in &manifest.chunks {
            let cursor = ChunkCursor::open(meta, self.io_buffer_size)?;
            if !cursor.is_exhausted() {
                cursors.push(cursor);
            }
        }

        let mut heap = BinaryHeap::with_capacity(cursors.len().max(MERGE_HEAP_INITIAL_CAPACITY));
        for (slot, cursor) in cursors.iter_mut().enumerate() {
            if let Some(value) = cursor.take_current() {
                heap.push(Reverse(MergeEntry {
                    value,
                    cursor: slot,
                }));
            }
        }

        let mut low_water: Option<String> = None;
        let mut progress = MergeProgress::default();

        while let Some(Reverse(entry)) = heap.pop() {
            // Dropping `cursors` on the early return closes every file.
            cancel.check()?;

            let cursor = &mut cursors[entry.cursor];
            cursor.advance_past(&entry.value)?;
            if let Some(value) = cursor.take_current() {
                heap.push(Reverse(MergeEntry {
                    value,
                    cursor: entry.cursor,
                }));
            }

            if low_water.as_deref() == Some(entry.value.as_str()) {
                progress.duplicates += 1;
            } else {
                progress.unique += 1;
                low_water = Some(entry.value);
            }
            progress.processed += 1;

            if self.progress_interval > 0 && progress.processed % self.progress_interval == 0 {
                on_progress(&progress);
            }
        }

        let outcome = MergeOutcome {
            unique: progress.unique,
            duplicates: progress.duplicates,
            processed: progress.processed,
            cursors: cursors.len(),
        };

        let chunk_unique_sum = manifest.chunk_unique_sum();
        if chunk_unique_sum != outcome.unique + outcome.duplicates {
            return Err(StressError::consistency(format!(
                "chunk unique sum={}, merged unique={}, duplicates={}",
                chunk_unique_sum, outcome.unique, outcome.duplicates
            )));
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stress::chunk::{content_hash, write_chunk_file};
    use chrono::Utc;
    use std::path::Path;
    use tempfile::tempdir;

    fn chunk(dir: &Path, index: usize, values: &[&str]) -> ChunkMeta {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let path = dir.join(format!("t-chunk-{:05}.dat", index));
        write_chunk_file(&path, &values, 1024).unwrap();
        ChunkMeta {
            index,
            size_bytes: std::fs::metadata(&path).unwrap().len(),
            path,
            unique_count: values.len() as u64,
            original_count: values.len() as u64,
            hash: content_hash(&values),
            created_at: Utc::now(),
        }
    }

    fn manifest(chunks: Vec<ChunkMeta>) -> Manifest {
        let mut manifest = Manifest::new("t", 0, 0, 64);
        manifest.chunks = chunks;
        manifest
    }

    #[test]
    fn test_cursor_walks_forward_only() {
        let dir = tempdir().unwrap();
        let meta = chunk(dir.path(), 0, &["a", "b"]);
        let mut cursor = ChunkCursor::open(&meta, 64).unwrap();

        assert_eq!(cursor.chunk_index(), 0);
        assert_eq!(cursor.current(), Some("a"));
        cursor.advance().unwrap();
        assert_eq!(cursor.current(), Some("b"));
        cursor.advance().unwrap();
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.current(), None);
        cursor.advance().unwrap();
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_cursor_rejects_unsorted_chunk() {
        let dir = tempdir().unwrap();
        let meta = chunk(dir.path(), 0, &["b", "a"]);
        let mut cursor = ChunkCursor::open(&meta, 64).unwrap();

        let err = cursor.advance().unwrap_err();
        assert!(matches!(err, StressError::ConsistencyFault { .. }));
    }

    #[test]
    fn test_disjoint_chunks() {
        let dir = tempdir().unwrap();
        let manifest = manifest(vec![
            chunk(dir.path(), 0, &["1", "3", "5"]),
            chunk(dir.path(), 1, &["2", "4", "9"]),
            chunk(dir.path(), 2, &["8"]),
        ]);

        let outcome = MergeEngine::new(1024, 0)
            .merge(&manifest, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.unique, 7);
        assert_eq!(outcome.duplicates, 0);
        assert_eq!(outcome.processed, 7);
        assert_eq!(outcome.cursors, 3);
    }

    #[test]
    fn test_shared_value_counted_once_either_order() {
        let dir = tempdir().unwrap();

        for order in [[0usize, 1], [1, 0]] {
            let a = chunk(dir.path(), order[0], &["W", "X"]);
            let b = chunk(dir.path(), order[1], &["X", "Y"]);
            let mut chunks = vec![a, b];
            chunks.sort_by_key(|c| c.index);

            let outcome = MergeEngine::new(1024, 0)
                .merge(&manifest(chunks), &CancelToken::new())
                .unwrap();
            assert_eq!(outcome.unique, 3);
            assert_eq!(outcome.duplicates, 1);
        }
    }

    #[test]
    fn test_value_present_in_every_chunk() {
        let dir = tempdir().unwrap();
        let manifest = manifest(vec![
            chunk(dir.path(), 0, &["k"]),
            chunk(dir.path(), 1, &["a", "k"]),
            chunk(dir.path(), 2, &["k", "z"]),
            chunk(dir.path(), 3, &["k"]),
        ]);

        let outcome = MergeEngine::new(1024, 0)
            .merge(&manifest, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.unique, 3);
        assert_eq!(outcome.duplicates, 3);
    }

    #[test]
    fn test_empty_and_prefix_values() {
        let dir = tempdir().unwrap();
        let manifest = manifest(vec![
            chunk(dir.path(), 0, &["", "ab", "abc"]),
            chunk(dir.path(), 1, &["", "a", "ab"]),
        ]);

        let outcome = MergeEngine::new(1024, 0)
            .merge(&manifest, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.unique, 4);
        assert_eq!(outcome.duplicates, 2);
    }

    #[test]
    fn test_cancel_mid_merge_stops_within_one_pop() {
        let dir = tempdir().unwrap();
        let manifest = manifest(vec![
            chunk(dir.path(), 0, &["a", "c", "e", "g"]),
            chunk(dir.path(), 1, &["b", "d", "f", "h"]),
        ]);
        let cancel = CancelToken::new();
        let mut seen = Vec::new();

        let err = MergeEngine::new(1024, 1)
            .merge_with_progress(&manifest, &cancel, |p| {
                seen.push(p.processed);
                if p.processed == 3 {
                    cancel.cancel();
                }
            })
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_unique_count_mismatch_is_consistency_fault() {
        let dir = tempdir().unwrap();
        let mut meta = chunk(dir.path(), 0, &["a", "b"]);
        meta.unique_count = 3;

        let err = MergeEngine::new(1024, 0)
            .merge(&manifest(vec![meta]), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StressError::ConsistencyFault { .. }));
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let err = MergeEngine::new(1024, 0)
            .merge(&manifest(Vec::new()), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StressError::ConsistencyFault { .. }));
    }
}
