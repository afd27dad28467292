use crate::config::TrainingConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::metrics::{EpochSummary, EvalReport};
use chrono::{DateTime, Utc};
use nuclear_models::ModelFamily;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointArtifact {
    pub epoch: usize,
    pub path: PathBuf,
    pub sha256: String,
}

/// Record of a finished run, written next to its checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub family: ModelFamily,
    pub checkpoint_id: String,
    pub model_name: String,
    pub world_size: usize,
    pub hyperparams: serde_json::Value,
    pub dataset_fingerprint: String,
    pub epochs: Vec<EpochSummary>,
    pub test: Option<EvalReport>,
    pub artifacts: Vec<CheckpointArtifact>,
    pub runtime_secs: f64,
}

impl RunManifest {
    pub fn new(
        family: ModelFamily,
        config: &TrainingConfig,
        world_size: usize,
        dataset_fingerprint: String,
        epochs: Vec<EpochSummary>,
        test: Option<EvalReport>,
        runtime_secs: f64,
    ) -> TrainingResult<Self> {
        let artifacts = saved_checkpoints(&epochs)?;
        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            family,
            checkpoint_id: family.checkpoint_id().to_string(),
            model_name: config.model_name().to_string(),
            world_size,
            hyperparams: serde_json::to_value(config)?,
            dataset_fingerprint,
            epochs,
            test,
            artifacts,
            runtime_secs,
        })
    }

    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes the checkpoints recorded in `epochs`, i.e. the files this run wrote.
pub fn saved_checkpoints(epochs: &[EpochSummary]) -> TrainingResult<Vec<CheckpointArtifact>> {
    epochs
        .iter()
        .filter_map(|summary| summary.checkpoint.as_ref().map(|path| (summary.epoch, path)))
        .map(|(epoch, path)| {
            if !path.is_file() {
                return Err(TrainingError::MissingCheckpoint(path.clone()));
            }
            let sha256 = sha256_file(path)?;
            Ok(CheckpointArtifact { epoch, path: path.clone(), sha256 })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CheckpointLayout;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    fn summary(epoch: usize, checkpoint: Option<PathBuf>) -> EpochSummary {
        EpochSummary {
            epoch,
            train_loss: 0.5,
            steps: 2,
            validation: EvalReport { loss: 0.4, accuracy: 0.5, correct: 1, total: 2 },
            checkpoint,
        }
    }

    #[test]
    fn test_manifest_lists_checkpoints_and_round_trips() {
        let temp = TempDir::new().unwrap();
        let config = TrainingConfig::builder()
            .epochs(2)
            .model_name("Llama")
            .layout(CheckpointLayout::new(temp.path().to_path_buf()))
            .build();
        let dir = config.layout().ensure_model_dir("Llama").unwrap();
        std::fs::write(dir.join("Nuclear_epoch0.pt"), b"zero").unwrap();
        std::fs::write(dir.join("Nuclear_epoch1.pt"), b"one").unwrap();
        let epochs = vec![
            summary(0, Some(config.checkpoint_path(0))),
            summary(1, Some(config.checkpoint_path(1))),
        ];

        let manifest =
            RunManifest::new(ModelFamily::Llama, &config, 1, "fp".to_string(), epochs, None, 1.5)
                .unwrap();
        assert_eq!(manifest.artifacts.len(), 2);
        assert_eq!(manifest.checkpoint_id, "meta-llama/Llama-2-7b-hf");
        assert_eq!(manifest.hyperparams["epochs"], 2);

        let path = config.layout().manifest_path("Llama");
        manifest.write(&path).unwrap();
        let loaded = RunManifest::read(&path).unwrap();
        assert_eq!(loaded.run_id, manifest.run_id);
        assert_eq!(loaded.artifacts, manifest.artifacts);
    }

    #[test]
    fn test_leftover_checkpoints_are_not_recorded() {
        let temp = TempDir::new().unwrap();
        let config = TrainingConfig::builder()
            .epochs(3)
            .save_every(2)
            .model_name("GPT2")
            .layout(CheckpointLayout::new(temp.path().to_path_buf()))
            .build();
        let dir = config.layout().ensure_model_dir("GPT2").unwrap();
        for epoch in 0..3 {
            std::fs::write(dir.join(format!("Nuclear_epoch{epoch}.pt")), b"w").unwrap();
        }
        let epochs = vec![
            summary(0, Some(config.checkpoint_path(0))),
            summary(1, None),
            summary(2, Some(config.checkpoint_path(2))),
        ];

        let manifest =
            RunManifest::new(ModelFamily::Gpt2, &config, 1, "fp".to_string(), epochs, None, 0.1)
                .unwrap();
        let saved: Vec<usize> = manifest.artifacts.iter().map(|a| a.epoch).collect();
        assert_eq!(saved, vec![0, 2]);
    }

    #[test]
    fn test_recorded_checkpoint_missing_on_disk_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("trained_BERT/Nuclear_epoch0.pt");
        let err = saved_checkpoints(&[summary(0, Some(path.clone()))]).unwrap_err();
        assert!(matches!(err, TrainingError::MissingCheckpoint(p) if p == path));
    }
}
