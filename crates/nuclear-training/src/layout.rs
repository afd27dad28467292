use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

const CHECKPOINT_PREFIX: &str = "Nuclear_epoch";
const CHECKPOINT_EXTENSION: &str = "pt";

/// Filesystem layout for checkpoints of a run.
///
/// Paths are `<root>/trained_<model_name>/Nuclear_epoch<epoch>.pt` and depend
/// on nothing else, so the test phase can find the final checkpoint without
/// bookkeeping. The default root is the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLayout {
    root: PathBuf,
}

impl Default for CheckpointLayout {
    fn default() -> Self {
        Self::new(PathBuf::from("."))
    }
}

impl CheckpointLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn model_dir(&self, model_name: &str) -> PathBuf {
        self.root.join(format!("trained_{model_name}"))
    }

    #[must_use]
    pub fn checkpoint_path(&self, model_name: &str, epoch: usize) -> PathBuf {
        self.model_dir(model_name)
            .join(format!("{CHECKPOINT_PREFIX}{epoch}.{CHECKPOINT_EXTENSION}"))
    }

    #[must_use]
    pub fn manifest_path(&self, model_name: &str) -> PathBuf {
        self.model_dir(model_name).join("run_manifest.json")
    }

    pub fn ensure_model_dir(&self, model_name: &str) -> TrainingResult<PathBuf> {
        let dir = self.model_dir(model_name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Epoch indices of checkpoints currently on disk, ascending.
    pub fn list_checkpoints(&self, model_name: &str) -> TrainingResult<Vec<usize>> {
        let dir = self.model_dir(model_name);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut epochs = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(epoch) = name
                .to_str()
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|n| n.strip_suffix(".pt"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            epochs.push(epoch);
        }
        epochs.sort_unstable();
        Ok(epochs)
    }
}
