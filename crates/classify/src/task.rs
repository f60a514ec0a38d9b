use crate::metrics::argmax;
use crate::predictions::write_predictions;
use crate::{ClassifyError, ClassifyResult};
use image_preprocess::{BackgroundClass, Batch, PreprocessResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name given to the reserved slot 0 when the model predicts background.
pub const BACKGROUND_NAME: &str = "background";

/// Reads one class name per non-empty line of a `labels.txt`, prepending
/// [`BACKGROUND_NAME`] when the model reserves slot 0.
pub fn load_class_names(path: &Path, background: BackgroundClass) -> ClassifyResult<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|source| ClassifyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut names = Vec::new();
    if background.use_background {
        names.push(BACKGROUND_NAME.to_string());
    }
    names.extend(
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string),
    );
    Ok(names)
}

/// Image classification over pipeline batches.
///
/// Dataset labels are shifted by `use - has` so that the model's class 0 is
/// background exactly when `use` is set.
#[derive(Debug, Clone)]
pub struct Classify {
    label_offset: i32,
    num_classes: usize,
    class_names: Vec<String>,
}

impl Classify {
    /// `num_classes` counts the dataset's classes; the model sees
    /// `num_classes + label_offset`. `class_names` may be empty, otherwise it
    /// must name every model class.
    pub fn new(
        background_class: BackgroundClass,
        num_classes: usize,
        class_names: Vec<String>,
    ) -> ClassifyResult<Self> {
        let label_offset = background_class.label_offset();
        let model_classes = i64::try_from(num_classes)
            .map_err(|_| ClassifyError::Config(format!("{num_classes} classes is too many")))?
            + i64::from(label_offset);
        let num_classes = usize::try_from(model_classes)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                ClassifyError::Config(format!(
                    "{num_classes} classes with label offset {label_offset} leaves none"
                ))
            })?;
        if !class_names.is_empty() && class_names.len() != num_classes {
            return Err(ClassifyError::Config(format!(
                "{} class names for {num_classes} model classes",
                class_names.len()
            )));
        }
        debug!(label_offset, num_classes, "classify task configured");
        Ok(Self {
            label_offset,
            num_classes,
            class_names,
        })
    }

    /// Builds the task from a `labels.txt` naming the dataset's real classes.
    ///
    /// When the dataset carries background as label 0 (`has`), that label is
    /// a dataset class too, so the count defaults to the listed names plus
    /// one. `num_classes` overrides the count.
    pub fn from_labels_file(
        background_class: BackgroundClass,
        path: &Path,
        num_classes: Option<usize>,
    ) -> ClassifyResult<Self> {
        let names = load_class_names(path, background_class)?;
        let listed = names.len() - usize::from(background_class.use_background);
        let dataset_classes = listed + usize::from(background_class.has);
        Self::new(background_class, num_classes.unwrap_or(dataset_classes), names)
    }

    pub fn label_offset(&self) -> i32 {
        self.label_offset
    }

    /// Output width the model must produce.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Name of model class `index`, or the index itself when names are unknown.
    pub fn class_name(&self, index: usize) -> String {
        self.class_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }

    /// Shifts every batch's labels into model class space.
    pub fn preprocess<I>(&self, batches: I) -> impl Iterator<Item = PreprocessResult<Batch>>
    where
        I: IntoIterator<Item = PreprocessResult<Batch>>,
    {
        let offset = self.label_offset;
        batches.into_iter().map(move |batch| {
            batch.map(|mut b| {
                b.add_label_offset(offset);
                b
            })
        })
    }

    /// Labels each named sample with its argmax class, logs it, and writes
    /// `predictions.yaml` into `output_dir`. Returns the written file.
    pub fn test<S: AsRef<str>>(
        &self,
        names: &[S],
        predictions: &[f32],
        output_dir: &Path,
    ) -> ClassifyResult<PathBuf> {
        if predictions.len() != names.len() * self.num_classes {
            return Err(ClassifyError::Shape(format!(
                "{} prediction values for {} samples of {} classes",
                predictions.len(),
                names.len(),
                self.num_classes
            )));
        }
        let mut results = BTreeMap::new();
        for (name, row) in names.iter().zip(predictions.chunks(self.num_classes)) {
            let name = name.as_ref();
            let label = argmax(row).map_or_else(|| "unknown".to_string(), |i| self.class_name(i));
            info!("{name} labeled as {label}.");
            results.insert(name.to_string(), label);
        }
        write_predictions(&results, output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_preprocess::ImageShape;

    fn bg(use_background: bool, has: bool) -> BackgroundClass {
        BackgroundClass { use_background, has }
    }

    #[test]
    fn background_flags_set_offset_and_width() {
        let cases = [
            (false, false, 0, 10),
            (true, false, 1, 11),
            (false, true, -1, 9),
            (true, true, 0, 10),
        ];
        for (u, h, offset, width) in cases {
            let task = Classify::new(bg(u, h), 10, Vec::new()).unwrap();
            assert_eq!(task.label_offset(), offset);
            assert_eq!(task.num_classes(), width);
        }
        assert!(Classify::new(bg(false, true), 1, Vec::new()).is_err());
    }

    #[test]
    fn class_names_must_cover_model_classes() {
        let names = vec!["a".to_string(), "b".to_string()];
        assert!(Classify::new(bg(true, false), 2, names.clone()).is_err());
        let task = Classify::new(bg(false, false), 2, names).unwrap();
        assert_eq!(task.class_name(1), "b");
        assert_eq!(task.class_name(5), "5");
    }

    #[test]
    fn labels_file_sizes_model_for_every_background_setup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        fs::write(&path, "cat\ndog\n").unwrap();
        let cases = [
            (false, false, vec!["cat", "dog"]),
            (true, false, vec!["background", "cat", "dog"]),
            (false, true, vec!["cat", "dog"]),
            (true, true, vec!["background", "cat", "dog"]),
        ];
        for (u, h, names) in cases {
            let task = Classify::from_labels_file(bg(u, h), &path, None).unwrap();
            assert_eq!(task.num_classes(), names.len(), "use={u} has={h}");
            assert_eq!(task.class_names(), names.as_slice());
        }
        // pack_shards labels start at 1, so the last listed name is the top label
        let task = Classify::from_labels_file(bg(false, true), &path, None).unwrap();
        assert_eq!(task.class_name((2 + task.label_offset()) as usize), "dog");
        assert!(Classify::from_labels_file(bg(true, true), &path, Some(5)).is_err());
    }

    #[test]
    fn preprocess_shifts_labels() {
        let shape = ImageShape::new(1, 1, 1);
        let task = Classify::new(bg(true, false), 3, Vec::new()).unwrap();
        let batches = vec![
            Batch::new(vec![0.0, 0.0], vec![0, 2], shape),
            Batch::new(vec![0.0], vec![1], shape),
        ];
        let labels: Vec<Vec<i32>> = task
            .preprocess(batches)
            .map(|b| b.unwrap().labels)
            .collect();
        assert_eq!(labels, vec![vec![1, 3], vec![2]]);
    }
}
