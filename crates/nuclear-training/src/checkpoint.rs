//! Checkpoint persistence for trainable weights.
//!
//! Payloads are safetensors files written through the model's parameter
//! store. Writes land in a sibling temp file first and are renamed into
//! place, so a reader never observes a partial checkpoint.

use crate::error::{TrainingError, TrainingResult};
use nuclear_models::SequenceClassifier;
use std::path::{Path, PathBuf};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes the model's trainable weights to `path`, creating parent dirs.
pub fn save_checkpoint(model: &dyn SequenceClassifier, path: &Path) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    model.save_trainable(&tmp).map_err(|e| {
        TrainingError::Checkpoint(format!("failed to write {}: {e}", path.display()))
    })?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads weights from `path` into `model`.
///
/// A missing file is [`TrainingError::MissingCheckpoint`]; there is no
/// fallback to another epoch.
pub fn load_checkpoint(model: &mut dyn SequenceClassifier, path: &Path) -> TrainingResult<()> {
    if !path.is_file() {
        return Err(TrainingError::MissingCheckpoint(path.to_path_buf()));
    }
    model
        .load_trainable(path)
        .map_err(|e| TrainingError::Checkpoint(format!("failed to load {}: {e}", path.display())))
}
