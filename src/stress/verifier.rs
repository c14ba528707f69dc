use tracing::debug;

use crate::stress::cancel::CancelToken;
use crate::stress::chunk::hash_file;
use crate::stress::error::{StressError, StressResult};
use crate::stress::manifest::Manifest;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerificationReport {
    pub chunks_verified: usize,
    pub bytes_verified: u64,
}

/// Gate between the write phase and the merge: every persisted chunk must
/// still hash to what the manifest recorded.
pub struct ChunkVerifier;

impl ChunkVerifier {
    pub fn verify_all(manifest: &Manifest, cancel: &CancelToken) -> StressResult<VerificationReport> {
        let mut report = VerificationReport::default();

        for chunk in &manifest.chunks {
            cancel.check()?;

            let (actual, size) = hash_file(&chunk.path)?;
            if actual != chunk.hash {
                return Err(StressError::CorruptionDetected {
                    index: chunk.index,
                    path: chunk.path.clone(),
                    expected: chunk.hash.clone(),
                    actual,
                });
            }
            if size != chunk.size_bytes {
                return Err(StressError::CorruptionDetected {
                    index: chunk.index,
                    path: chunk.path.clone(),
                    expected: format!("{} bytes", chunk.size_bytes),
                    actual: format!("{} bytes", size),
                });
            }

            report.chunks_verified += 1;
            report.bytes_verified += size;
        }

        debug!(
            "verified {} chunks ({} bytes) for {}",
            report.chunks_verified, report.bytes_verified, manifest.scheme
        );
        Ok(report)
    }
}
