pub mod cancel;
pub mod chunk;
pub mod config;
pub mod constants;
pub mod error;
pub mod guard;
pub mod manifest;
pub mod merger;
pub mod processor;
pub mod runner;
pub mod scratch;
pub mod verifier;


pub use cancel::CancelToken;
pub use config::StressConfig;
pub use error::{Resource, StressError, StressResult};
pub use guard::{GuardStats, ResourceGuard, ResourceProbe, SysinfoProbe};
pub use manifest::{ChunkMeta, Manifest, ManifestStore};
pub use merger::{MergeEngine, MergeOutcome};
pub use processor::{SchemeProcessor, SchemeResult};
pub use runner::{run, StressRunner};
pub use verifier::{ChunkVerifier, VerificationReport};
