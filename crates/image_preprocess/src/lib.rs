//! Threaded image preprocessing for classification training.
//!
//! This crate provides:
//! - TFRecord shard reading/writing and `tf.train.Example` record decoding
//! - A per-lane image transform engine driven by configurable action lists
//! - Reader pools with shuffle/FIFO buffering and a shared stop coordinator
//! - Fixed-size batch assembly split across devices
//!
//! Enable the `burn-runtime` feature to turn batches into Burn tensors.

pub mod actions;
pub mod aug;
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod tensor;
pub mod tfrecord;
pub mod types;

pub use actions::{Action, ActionEntry, ActionList, PreprocessActions};
pub use aug::{ColorOp, ColorOrder, ImagePreprocess, ResizeMethod};
pub use batch::{Batch, BatchStream, DeviceBatches};
pub use config::{expand_path, BackgroundClass, DatasetConfig, PreprocessConfig, SystemConfig};
pub use coordinator::{Coordinator, JoinReport};
pub use decode::{decode_image, decode_record};
pub use pipeline::{Preprocess, STOP_GRACE_PERIOD};
pub use tensor::ImageTensor;
pub use tfrecord::{RecordReader, RecordWriter};
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::BurnBatch;
