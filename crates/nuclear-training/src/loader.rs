//! CSV loading and label encoding.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Text encoding of the source CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1; every byte maps to the code point of the same value.
    Latin1,
}

impl TextEncoding {
    pub fn decode(self, bytes: &[u8]) -> TrainingResult<String> {
        match self {
            Self::Utf8 => {
                let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| TrainingError::Dataset(format!("input is not valid utf-8: {e}")))
            }
            Self::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 => f.write_str("utf-8"),
            Self::Latin1 => f.write_str("latin-1"),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(Self::Latin1),
            other => Err(TrainingError::Dataset(format!("unsupported encoding: {other}"))),
        }
    }
}

/// Maps raw label strings to dense class ids `0..n`.
///
/// Classes are ordered numerically when every label parses as a number and
/// lexicographically otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut classes: Vec<String> = labels.into_iter().map(str::to_string).collect();
        let numeric = classes.iter().all(|c| c.parse::<f64>().is_ok());
        if numeric {
            classes.sort_by(|a, b| {
                let (x, y) = (a.parse::<f64>().unwrap_or(0.0), b.parse::<f64>().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b))
            });
        } else {
            classes.sort();
        }
        classes.dedup();
        Self { classes }
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn transform(&self, label: &str) -> TrainingResult<u32> {
        self.classes
            .iter()
            .position(|c| c == label)
            .map(|i| i as u32)
            .ok_or_else(|| TrainingError::Dataset(format!("unknown label: {label}")))
    }

    #[must_use]
    pub fn inverse(&self, id: u32) -> Option<&str> {
        self.classes.get(id as usize).map(String::as_str)
    }
}

/// Rows of `(text, class id)` read from a CSV, plus the fitted encoder.
#[derive(Debug, Clone)]
pub struct LabeledTable {
    pub texts: Vec<String>,
    pub labels: Vec<u32>,
    pub encoder: LabelEncoder,
}

impl LabeledTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Row count per class id.
    #[must_use]
    pub fn class_counts(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for &label in &self.labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }
}

pub fn load_labeled_csv(
    path: &Path,
    input_col: &str,
    output_col: &str,
    encoding: TextEncoding,
) -> TrainingResult<LabeledTable> {
    let bytes = std::fs::read(path).map_err(|e| {
        TrainingError::Dataset(format!("failed to read {}: {e}", path.display()))
    })?;
    parse_labeled_csv(&encoding.decode(&bytes)?, input_col, output_col)
}

pub fn parse_labeled_csv(
    content: &str,
    input_col: &str,
    output_col: &str,
) -> TrainingResult<LabeledTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| TrainingError::Dataset(format!("column not found: {name}")))
    };
    let input_idx = column(input_col)?;
    let output_idx = column(output_col)?;

    let mut texts = Vec::new();
    let mut raw_labels = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let (Some(text), Some(label)) = (record.get(input_idx), record.get(output_idx)) else {
            return Err(TrainingError::Dataset(format!("row {} is missing a column", row + 1)));
        };
        let label = label.trim();
        if label.is_empty() {
            return Err(TrainingError::Dataset(format!("row {} has an empty label", row + 1)));
        }
        texts.push(text.to_string());
        raw_labels.push(label.to_string());
    }

    if texts.is_empty() {
        return Err(TrainingError::Dataset("no rows found".to_string()));
    }

    let encoder = LabelEncoder::fit(raw_labels.iter().map(String::as_str));
    let labels = raw_labels
        .iter()
        .map(|l| encoder.transform(l))
        .collect::<TrainingResult<Vec<_>>>()?;

    Ok(LabeledTable { texts, labels, encoder })
}
