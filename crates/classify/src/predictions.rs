use crate::{ClassifyError, ClassifyResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const PREDICTIONS_FILE: &str = "predictions.yaml";

/// Writes `{sample name: class name}` as YAML into `output_dir`, creating it if needed.
pub fn write_predictions(
    results: &BTreeMap<String, String>,
    output_dir: &Path,
) -> ClassifyResult<PathBuf> {
    fs::create_dir_all(output_dir).map_err(|source| ClassifyError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let path = output_dir.join(PREDICTIONS_FILE);
    let yaml = serde_yaml::to_string(results)?;
    fs::write(&path, yaml).map_err(|source| ClassifyError::Io {
        path: path.clone(),
        source,
    })?;
    info!(path = %path.display(), predictions = results.len(), "wrote predictions");
    Ok(path)
}
