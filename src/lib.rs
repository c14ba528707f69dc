// Chunked generation, durable chunk store and k-way merge
pub mod stress;

// Identifier schemes under test
pub mod schemes;

pub mod constants;
pub mod utils;

pub use schemes::{IdGenerator, SchemeRegistry};
pub use stress::{CancelToken, SchemeResult, StressConfig, StressError, StressResult, StressRunner};
