//! Shared CLI helpers for the preprocessing binaries.

pub mod common;
pub mod logging;

pub use common::{PipelineArgs, ShardOutputArgs};
pub use logging::{env_filter, init_tracing};
