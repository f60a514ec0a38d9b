//! Classification task on top of the preprocessing pipeline.
//!
//! - [`Classify`] shifts pipeline labels for the background slot and names predictions
//! - [`metrics`] computes top-k hits, accuracy, and softmax cross-entropy over flat logits
//! - [`predictions`] writes `predictions.yaml`

pub mod metrics;
pub mod predictions;
pub mod task;

pub use metrics::{accuracy, argmax, in_top_k, softmax_cross_entropy, EvalMetrics, Percent};
pub use predictions::{write_predictions, PREDICTIONS_FILE};
pub use task::{load_class_names, Classify, BACKGROUND_NAME};

use std::path::PathBuf;
use thiserror::Error;

pub type ClassifyResult<T> = Result<T, ClassifyError>;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid task setup: {0}")]
    Config(String),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Preprocess(#[from] image_preprocess::PreprocessError),
}
