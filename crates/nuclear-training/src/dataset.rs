use crate::error::{TrainingError, TrainingResult};
use crate::loader::LabeledTable;
use crate::tokenizer::TextEncoder;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One tokenized, label-encoded row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub input_ids: Vec<u32>,
    pub label: u32,
}

/// Split ratios and seed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitOptions {
    pub test_size: f64,
    pub val_size: f64,
    pub seed: u64,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self { test_size: 0.2, val_size: 0.1, seed: 42 }
    }
}

impl SplitOptions {
    pub fn validate(&self) -> TrainingResult<()> {
        let in_range = |v: f64| v.is_finite() && (0.0..1.0).contains(&v);
        if !in_range(self.test_size) || !in_range(self.val_size) {
            return Err(TrainingError::Dataset(
                "test_size and val_size must be in [0, 1)".to_string(),
            ));
        }
        if self.test_size + self.val_size >= 1.0 {
            return Err(TrainingError::Dataset(
                "test_size + val_size must leave rows for training".to_string(),
            ));
        }
        Ok(())
    }
}

/// Disjoint train / validation / test partitions.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Vec<Example>,
    pub val: Vec<Example>,
    pub test: Vec<Example>,
    pub num_classes: usize,
}

impl DatasetSplits {
    /// Tokenizes `table` and partitions it with a seeded shuffle.
    ///
    /// Every process given the same table, encoder and options produces the
    /// same splits, which is what lets distributed workers rebuild their own
    /// copy instead of receiving one.
    pub fn build(
        table: &LabeledTable,
        encoder: &dyn TextEncoder,
        options: &SplitOptions,
    ) -> TrainingResult<Self> {
        options.validate()?;
        let ids = encoder.encode_all(&table.texts)?;
        let examples: Vec<Example> = ids
            .into_iter()
            .zip(table.labels.iter().copied())
            .map(|(input_ids, label)| Example { input_ids, label })
            .collect();
        Self::split(examples, table.encoder.num_classes(), options)
    }

    pub fn split(
        mut examples: Vec<Example>,
        num_classes: usize,
        options: &SplitOptions,
    ) -> TrainingResult<Self> {
        options.validate()?;
        let total = examples.len();
        let n_test = portion(total, options.test_size);
        let n_val = portion(total, options.val_size);
        if n_test + n_val >= total {
            return Err(TrainingError::Dataset(format!(
                "{total} rows are too few for test_size={} val_size={}",
                options.test_size, options.val_size
            )));
        }

        let mut rng = StdRng::seed_from_u64(options.seed);
        examples.shuffle(&mut rng);

        let test = examples.split_off(total - n_test);
        let val = examples.split_off(examples.len() - n_val);

        tracing::debug!(
            train = examples.len(),
            val = val.len(),
            test = test.len(),
            "Dataset split"
        );

        Ok(Self { train: examples, val, test, num_classes })
    }

    /// Content hash over all three splits, in order.
    pub fn fingerprint(&self) -> TrainingResult<String> {
        let mut hasher = Sha256::new();
        for split in [&self.train, &self.val, &self.test] {
            for example in split {
                hasher.update(serde_json::to_vec(example)?);
                hasher.update(b"\n");
            }
            hasher.update(b"--\n");
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Rows a ratio claims, at least one whenever the ratio is positive.
fn portion(total: usize, ratio: f64) -> usize {
    if ratio <= 0.0 {
        return 0;
    }
    ((total as f64 * ratio).round() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_labeled_csv;
    use crate::tokenizer::{HashingTokenizer, TokenizerOptions};
    use std::collections::HashSet;

    fn examples(n: u32) -> Vec<Example> {
        (0..n).map(|i| Example { input_ids: vec![1, i + 2], label: i % 3 }).collect()
    }

    #[test]
    fn test_split_sizes_and_disjointness() {
        let splits = DatasetSplits::split(examples(50), 3, &SplitOptions::default()).unwrap();
        assert_eq!(splits.test.len(), 10);
        assert_eq!(splits.val.len(), 5);
        assert_eq!(splits.train.len(), 35);

        let seen: HashSet<u32> = splits
            .train
            .iter()
            .chain(&splits.val)
            .chain(&splits.test)
            .map(|e| e.input_ids[1])
            .collect();
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn test_split_is_seeded() {
        let a = DatasetSplits::split(examples(30), 3, &SplitOptions::default()).unwrap();
        let b = DatasetSplits::split(examples(30), 3, &SplitOptions::default()).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        let other = SplitOptions { seed: 7, ..SplitOptions::default() };
        let c = DatasetSplits::split(examples(30), 3, &other).unwrap();
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }

    #[test]
    fn test_too_few_rows_is_an_error() {
        let result = DatasetSplits::split(examples(2), 3, &SplitOptions::default());
        assert!(matches!(result, Err(TrainingError::Dataset(_))));
    }

    #[test]
    fn test_build_tokenizes_table() {
        let mut csv = String::from("text,label\n");
        for i in 0..20 {
            csv.push_str(&format!("review number {i},{}\n", i % 2));
        }
        let table = parse_labeled_csv(&csv, "text", "label").unwrap();
        let tok = HashingTokenizer::new(500, TokenizerOptions::default()).unwrap();
        let splits = DatasetSplits::build(&table, &tok, &SplitOptions::default()).unwrap();
        assert_eq!(splits.num_classes, 2);
        assert_eq!(splits.train.len() + splits.val.len() + splits.test.len(), 20);
        assert!(splits.train.iter().all(|e| e.input_ids.len() == 4));
    }
}
