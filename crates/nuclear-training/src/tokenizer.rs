//! Text encoders that turn raw strings into token ids.
//!
//! A pretrained `tokenizer.json` is used when one sits next to the family's
//! base weights; otherwise a deterministic hashing tokenizer stands in so runs
//! stay reproducible without any downloaded assets.

use crate::error::{TrainingError, TrainingResult};
use nuclear_models::ModelSpec;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, warn};

const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// Id reserved for padding by both encoders here.
pub const PAD_ID: u32 = 0;
const BOS_ID: u32 = 1;
const RESERVED_IDS: u32 = 2;

/// Options fixed at tokenizer construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerOptions {
    /// Encode batches on the tokenizer's internal thread pool.
    pub parallel: bool,
    /// Sequences are truncated to this many ids.
    pub max_length: usize,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        Self { parallel: false, max_length: 128 }
    }
}

pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> TrainingResult<Vec<u32>>;

    fn encode_all(&self, texts: &[String]) -> TrainingResult<Vec<Vec<u32>>> {
        texts.iter().map(|t| self.encode(t)).collect()
    }

    fn vocab_size(&self) -> usize;

    fn pad_id(&self) -> u32 {
        PAD_ID
    }
}

/// Word-level FNV-1a hashing into a fixed vocabulary.
///
/// Lowercases, splits on non-alphanumerics, prepends a BOS id. Ids below
/// `RESERVED_IDS` are never produced by the hash.
#[derive(Debug, Clone)]
pub struct HashingTokenizer {
    vocab_size: usize,
    options: TokenizerOptions,
}

impl HashingTokenizer {
    pub fn new(vocab_size: usize, options: TokenizerOptions) -> TrainingResult<Self> {
        if vocab_size <= RESERVED_IDS as usize {
            return Err(TrainingError::Tokenizer(format!(
                "vocab_size must exceed {RESERVED_IDS}, got {vocab_size}"
            )));
        }
        if options.max_length == 0 {
            return Err(TrainingError::Tokenizer("max_length must be >= 1".to_string()));
        }
        Ok(Self { vocab_size, options })
    }

    fn token_id(&self, word: &str) -> u32 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in word.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let span = self.vocab_size as u64 - u64::from(RESERVED_IDS);
        (hash % span) as u32 + RESERVED_IDS
    }
}

impl TextEncoder for HashingTokenizer {
    fn encode(&self, text: &str) -> TrainingResult<Vec<u32>> {
        let lowered = text.to_lowercase();
        let ids = std::iter::once(BOS_ID)
            .chain(
                lowered
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(|w| self.token_id(w)),
            )
            .take(self.options.max_length)
            .collect();
        Ok(ids)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

/// Wraps a Hugging Face `tokenizer.json`.
pub struct PretrainedTokenizer {
    inner: Tokenizer,
    options: TokenizerOptions,
    pad_id: u32,
}

impl PretrainedTokenizer {
    pub fn from_file(path: &Path, options: TokenizerOptions) -> TrainingResult<Self> {
        let inner = Tokenizer::from_file(path).map_err(|e| {
            TrainingError::Tokenizer(format!("failed to load {}: {e}", path.display()))
        })?;
        let pad_id = inner.get_padding().map_or(PAD_ID, |p| p.pad_id);
        Ok(Self { inner, options, pad_id })
    }

    fn truncate(&self, ids: &[u32]) -> Vec<u32> {
        ids[..ids.len().min(self.options.max_length)].to_vec()
    }
}

impl TextEncoder for PretrainedTokenizer {
    fn encode(&self, text: &str) -> TrainingResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| TrainingError::Tokenizer(e.to_string()))?;
        Ok(self.truncate(encoding.get_ids()))
    }

    fn encode_all(&self, texts: &[String]) -> TrainingResult<Vec<Vec<u32>>> {
        if !self.options.parallel {
            return texts.iter().map(|t| self.encode(t)).collect();
        }
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .inner
            .encode_batch(inputs, true)
            .map_err(|e| TrainingError::Tokenizer(e.to_string()))?;
        Ok(encodings.iter().map(|e| self.truncate(e.get_ids())).collect())
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

/// `<models_dir>/<checkpoint_id>/tokenizer.json`, if a models dir is set.
#[must_use]
pub fn tokenizer_path(models_dir: Option<&Path>, checkpoint_id: &str) -> Option<PathBuf> {
    models_dir.map(|dir| dir.join(checkpoint_id).join(TOKENIZER_FILENAME))
}

/// Picks the pretrained tokenizer for `spec` when present, else hashing.
pub fn encoder_for(
    spec: &ModelSpec,
    models_dir: Option<&Path>,
    options: TokenizerOptions,
) -> TrainingResult<Box<dyn TextEncoder>> {
    match tokenizer_path(models_dir, &spec.checkpoint_id) {
        Some(path) if path.is_file() => {
            debug!(path = %path.display(), "Using pretrained tokenizer");
            Ok(Box::new(PretrainedTokenizer::from_file(&path, options)?))
        }
        _ => {
            warn!(
                checkpoint = %spec.checkpoint_id,
                "No tokenizer.json found; using hashing tokenizer"
            );
            Ok(Box::new(HashingTokenizer::new(spec.vocab_size, options)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuclear_models::ModelFamily;

    #[test]
    fn test_hashing_is_deterministic_and_case_insensitive() {
        let tok = HashingTokenizer::new(1000, TokenizerOptions::default()).unwrap();
        let a = tok.encode("Great movie!").unwrap();
        let b = tok.encode("great   MOVIE").unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], BOS_ID);
        assert_eq!(a.len(), 3);
        assert!(a.iter().skip(1).all(|&id| id >= RESERVED_IDS && id < 1000));
    }

    #[test]
    fn test_hashing_truncates_to_max_length() {
        let options = TokenizerOptions { parallel: false, max_length: 4 };
        let tok = HashingTokenizer::new(100, options).unwrap();
        let ids = tok.encode("one two three four five six").unwrap();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_empty_text_keeps_bos() {
        let tok = HashingTokenizer::new(100, TokenizerOptions::default()).unwrap();
        assert_eq!(tok.encode("").unwrap(), vec![BOS_ID]);
    }

    #[test]
    fn test_encoder_falls_back_without_models_dir() {
        let spec = ModelSpec::for_family(ModelFamily::Gpt2);
        let encoder = encoder_for(&spec, None, TokenizerOptions::default()).unwrap();
        assert_eq!(encoder.vocab_size(), 50_257);
        assert_eq!(encoder.pad_id(), PAD_ID);
    }

    #[test]
    fn test_tokenizer_path_layout() {
        let path = tokenizer_path(Some(Path::new("/models")), "meta-llama/Llama-2-7b-hf");
        assert_eq!(
            path,
            Some(PathBuf::from("/models/meta-llama/Llama-2-7b-hf/tokenizer.json"))
        );
    }
}
