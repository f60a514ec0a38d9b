//! TOML configuration for a preprocessing pipeline.
//!
//! ```toml
//! [dataset]
//! height = 224
//! width = 224
//! channels = 3
//! files.train = ["~/data/train"]
//! files.validate = ["${DATA}/val-00000.tfrecord"]
//!
//! [dataset.preprocess]
//! train = ["distort_bbox", "random_flip", "distort_color"]
//! validate = [{ type = "central_crop" }, { type = "resize" }]
//! final = "normalize_channels"
//!
//! [system]
//! batch_size = 64
//! num_threads = 8
//! ```

use crate::actions::PreprocessActions;
use crate::types::{ImageShape, Mode, Moment, PreprocessError, PreprocessResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_IMAGES_PER_SHARD: usize = 1024;
pub const DEFAULT_QUEUE_MEMORY_FACTOR: usize = 16;

pub const ENV_BATCH_SIZE: &str = "PREPROCESS_BATCH_SIZE";
pub const ENV_NUM_THREADS: &str = "PREPROCESS_NUM_THREADS";
pub const ENV_NUM_READERS: &str = "PREPROCESS_NUM_READERS";

#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessConfig {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub height: usize,
    pub width: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default)]
    pub moment: Option<Moment>,
    #[serde(default)]
    pub preprocess: PreprocessActions,
    #[serde(default)]
    pub background_class: BackgroundClass,
    /// Added to every decoded label.
    #[serde(default)]
    pub label_offset: i32,
    #[serde(default = "default_images_per_shard")]
    pub images_per_shard: usize,
    #[serde(default)]
    pub files: DataFiles,
}

/// Whether the model wants a background class at label 0 (`use`) and whether
/// the records already carry one (`has`). Consumed by the task layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BackgroundClass {
    #[serde(default, rename = "use")]
    pub use_background: bool,
    #[serde(default)]
    pub has: bool,
}

impl BackgroundClass {
    pub fn label_offset(&self) -> i32 {
        self.use_background as i32 - self.has as i32
    }
}

/// Shard files or directories of shards, per mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataFiles {
    #[serde(default)]
    pub train: Vec<String>,
    #[serde(default)]
    pub validate: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_readers")]
    pub num_readers: usize,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Passes over the file list; unset runs until stopped.
    #[serde(default)]
    pub num_epochs: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_queue_memory_factor")]
    pub queue_memory_factor: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_readers: default_num_readers(),
            num_threads: default_num_threads(),
            num_epochs: None,
            seed: None,
            queue_memory_factor: default_queue_memory_factor(),
        }
    }
}

fn default_channels() -> usize {
    3
}

fn default_images_per_shard() -> usize {
    DEFAULT_IMAGES_PER_SHARD
}

fn default_batch_size() -> usize {
    32
}

fn default_num_readers() -> usize {
    4
}

fn default_num_threads() -> usize {
    4
}

fn default_queue_memory_factor() -> usize {
    DEFAULT_QUEUE_MEMORY_FACTOR
}

impl DatasetConfig {
    pub fn new(shape: ImageShape) -> Self {
        Self {
            height: shape.height,
            width: shape.width,
            channels: shape.channels,
            moment: None,
            preprocess: PreprocessActions::default(),
            background_class: BackgroundClass::default(),
            label_offset: 0,
            images_per_shard: DEFAULT_IMAGES_PER_SHARD,
            files: DataFiles::default(),
        }
    }
}

impl PreprocessConfig {
    pub fn new(shape: ImageShape, batch_size: usize) -> Self {
        Self {
            dataset: DatasetConfig::new(shape),
            system: SystemConfig {
                batch_size,
                ..SystemConfig::default()
            },
        }
    }

    /// Reads a TOML file, applies env overrides and validates.
    pub fn from_path(path: &Path) -> PreprocessResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| PreprocessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: Self = toml::from_str(&raw).map_err(|source| PreprocessError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        debug!(path = %path.display(), shape = %cfg.image_shape(), "loaded preprocess config");
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> PreprocessResult<()> {
        if let Some(v) = env_usize(ENV_BATCH_SIZE)? {
            self.system.batch_size = v;
        }
        if let Some(v) = env_usize(ENV_NUM_THREADS)? {
            self.system.num_threads = v;
        }
        if let Some(v) = env_usize(ENV_NUM_READERS)? {
            self.system.num_readers = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> PreprocessResult<()> {
        let d = &self.dataset;
        if d.height == 0 || d.width == 0 || d.channels == 0 {
            return Err(PreprocessError::Config(format!(
                "image shape must be positive, got {}",
                self.image_shape()
            )));
        }
        let s = &self.system;
        if s.batch_size == 0 {
            return Err(PreprocessError::Config("batch_size must be positive".into()));
        }
        if s.num_threads == 0 || s.num_readers == 0 {
            return Err(PreprocessError::Config(
                "num_threads and num_readers must be positive".into(),
            ));
        }
        if d.images_per_shard == 0 || s.queue_memory_factor == 0 {
            return Err(PreprocessError::Config(
                "images_per_shard and queue_memory_factor must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn image_shape(&self) -> ImageShape {
        ImageShape::new(self.dataset.height, self.dataset.width, self.dataset.channels)
    }

    /// Expanded shard list for `mode`. Directories contribute their regular files, sorted.
    pub fn data_files(&self, mode: Mode) -> PreprocessResult<Vec<PathBuf>> {
        let entries = match mode {
            Mode::Train => &self.dataset.files.train,
            Mode::Validate => &self.dataset.files.validate,
        };
        let mut files = Vec::new();
        for raw in entries {
            let path = expand_path(raw);
            if path.is_dir() {
                let listing = std::fs::read_dir(&path).map_err(|source| PreprocessError::Io {
                    path: path.clone(),
                    source,
                })?;
                let mut found = Vec::new();
                for entry in listing {
                    let entry = entry.map_err(|source| PreprocessError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    let p = entry.path();
                    if p.is_file() {
                        found.push(p);
                    }
                }
                found.sort();
                files.extend(found);
            } else if path.is_file() {
                files.push(path);
            } else {
                return Err(PreprocessError::Config(format!(
                    "{mode} data path {} does not exist",
                    path.display()
                )));
            }
        }
        if files.is_empty() {
            return Err(PreprocessError::Config(format!("no {mode} data files configured")));
        }
        Ok(files)
    }
}

fn env_usize(key: &str) -> PreprocessResult<Option<usize>> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| PreprocessError::Config(format!("{key}={val:?}: {e}"))),
        _ => Ok(None),
    }
}

/// Expands a leading `~` and `${VAR}` references; unknown variables stay verbatim.
pub fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&rest[start..start + end + 3]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;

    #[test]
    fn parses_full_config() {
        let cfg: PreprocessConfig = toml::from_str(
            r#"
            [dataset]
            height = 32
            width = 24
            channels = 1
            label_offset = 2
            background_class = { use = true, has = false }
            moment = { mean = [0.4] }

            [dataset.preprocess]
            validate = "central_crop"

            [system]
            batch_size = 8
            num_epochs = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.image_shape(), ImageShape::new(32, 24, 1));
        assert_eq!(cfg.dataset.label_offset, 2);
        assert_eq!(cfg.dataset.background_class.label_offset(), 1);
        assert_eq!(cfg.system.num_epochs, Some(3));
        assert_eq!(cfg.system.num_threads, 4);
        assert_eq!(cfg.dataset.images_per_shard, 1024);
        assert_eq!(
            cfg.dataset.preprocess.program(Mode::Validate).unwrap(),
            vec![Action::CentralCrop { fraction: 0.875 }]
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn background_offsets() {
        let off = |use_background, has| BackgroundClass { use_background, has }.label_offset();
        assert_eq!(off(true, false), 1);
        assert_eq!(off(false, true), -1);
        assert_eq!(off(true, true), 0);
    }

    #[test]
    fn zero_batch_is_rejected() {
        let cfg = PreprocessConfig::new(ImageShape::new(4, 4, 3), 0);
        assert!(matches!(cfg.validate(), Err(PreprocessError::Config(_))));
    }

    #[test]
    fn expands_home_and_vars() {
        std::env::set_var("IMAGE_PREPROCESS_TEST_ROOT", "/data");
        assert_eq!(
            expand_path("${IMAGE_PREPROCESS_TEST_ROOT}/train"),
            PathBuf::from("/data/train")
        );
        assert_eq!(
            expand_path("${IMAGE_PREPROCESS_UNSET_VAR}/x"),
            PathBuf::from("${IMAGE_PREPROCESS_UNSET_VAR}/x")
        );
        assert_eq!(expand_path("plain/${open"), PathBuf::from("plain/${open"));
    }

    #[test]
    fn directories_expand_to_sorted_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tfrecord", "a.tfrecord"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let mut cfg = PreprocessConfig::new(ImageShape::new(4, 4, 3), 2);
        cfg.dataset.files.train = vec![dir.path().display().to_string()];
        let files = cfg.data_files(Mode::Train).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.tfrecord", "b.tfrecord"]);
        assert!(cfg.data_files(Mode::Validate).is_err());
    }
}
