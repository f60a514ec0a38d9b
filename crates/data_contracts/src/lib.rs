//! Shared data contracts for image classification shards.

pub mod proto;
pub mod record;

pub use proto::{Example, Feature, Features};
pub use record::{BoundingBox, ContractError, ImageRecord, MISSING_LABEL};
