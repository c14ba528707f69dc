use std::path::{Path, PathBuf};
use thiserror::Error;

pub type StressResult<T> = Result<T, StressError>;

/// Which resource a guard rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Memory,
    Disk,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Memory => write!(f, "memory"),
            Resource::Disk => write!(f, "disk"),
        }
    }
}

/// Failure taxonomy of a stress run. Every variant aborts the scheme it was
/// raised in; nothing is retried.
#[derive(Error, Debug)]
pub enum StressError {
    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("insufficient {resource}: need {required_mb:.2} MB, available {available_mb:.2} MB")]
    ResourceExhausted {
        resource: Resource,
        required_mb: f64,
        available_mb: f64,
    },

    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk {index} ({}) hash mismatch after write: memory={expected} file={actual}", path.display())]
    IntegrityFault {
        index: usize,
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("chunk {index} ({}) corrupted: manifest={expected} file={actual}", path.display())]
    CorruptionDetected {
        index: usize,
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("scheme {scheme} produced an identifier containing the record delimiter in chunk {index}: {value:?}")]
    InvalidIdentifier {
        scheme: String,
        index: usize,
        value: String,
    },

    #[error("inconsistent counts: {message}")]
    ConsistencyFault { message: String },

    #[error("manifest error: {message}")]
    Manifest { message: String },

    #[error("run cancelled")]
    Cancelled,
}

impl StressError {
    pub fn config(message: impl Into<String>) -> Self {
        StressError::Config {
            message: message.into(),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        StressError::ConsistencyFault {
            message: message.into(),
        }
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        StressError::Manifest {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StressError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StressError::Cancelled)
    }

    /// Hash mismatches and broken invariants are never expected to clear up on
    /// their own.
    pub fn is_fatal_fault(&self) -> bool {
        matches!(
            self,
            StressError::IntegrityFault { .. }
                | StressError::CorruptionDetected { .. }
                | StressError::ConsistencyFault { .. }
        )
    }
}

pub(crate) trait IoResultExt<T> {
    fn with_path(self, path: &Path) -> StressResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: &Path) -> StressResult<T> {
        self.map_err(|source| StressError::io(path, source))
    }
}
