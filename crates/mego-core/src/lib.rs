//! Shared building blocks for the mego workspace: tracing setup and byte
//! size units used by the engine and client configuration.

pub mod size;
pub mod tracing;

pub use size::{GB, KB, MB, TB, human_bytes};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
