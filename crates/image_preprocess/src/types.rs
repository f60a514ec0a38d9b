//! Core types and error definitions for image_preprocess.

use data_contracts::ContractError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub type PreprocessResult<T> = Result<T, PreprocessError>;

#[derive(Debug, Error)]
pub enum PreprocessError {
    /// Bad mode, thread count, action program or file list. Raised at construction.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Unsupported channel count for a colour op or channel conversion.
    #[error("invalid image format: {0}")]
    ImageFormat(String),
    #[error("shape error: {0}")]
    Shape(String),
    #[error("record parse error: {0}")]
    Parse(String),
    #[error("record parse error: {0}")]
    Contract(#[from] ContractError),
    #[error("corrupt record in {path} after {records} records: {msg}")]
    CorruptRecord {
        path: PathBuf,
        records: u64,
        msg: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parse error at {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Which per-mode action list and queueing policy a pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Validate,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Validate => "validate",
        }
    }

    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Train)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Mode::Train),
            "validate" => Ok(Mode::Validate),
            other => Err(PreprocessError::Config(format!(
                "unrecognized preprocessing mode {other:?}"
            ))),
        }
    }
}

/// Target `(height, width, channels)` every preprocessed image must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    pub fn elems(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Per-channel moment statistics used by the normalization actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    #[serde(default)]
    pub mean: Option<Vec<f32>>,
    #[serde(default)]
    pub std: Option<Vec<f32>>,
}

/// One decoded record, before the image bytes are decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub encoded: Vec<u8>,
    pub label: i32,
    /// Normalized candidate boxes: `[y_min, x_min, y_max, x_max]`.
    pub bboxes: Vec<[f32; 4]>,
    pub text: String,
}

impl Sample {
    /// Boxes are presented as `[1, num_boxes, 4]`.
    pub fn bbox_shape(&self) -> [usize; 3] {
        [1, self.bboxes.len(), 4]
    }
}
