//! Dataset iteration (§4.4).
//!
//! `Sampler` wraps an immutable, shared `Vec<DatasetRecord>` behind an
//! atomically-advanced cursor so many `VirtualUser`s can call `next()`
//! concurrently without ever observing a torn read — the same
//! `Arc<Mutex<cursor>>` round-robin discipline the teacher's CSV data source
//! uses, generalized from CSV rows to JSONL/embedded dataset records.

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;

use crate::descriptor::Dataset;

const DEFAULT_TEXT_JSONL: &str = include_str!("datasets/default_text.jsonl");
const DEFAULT_SHAREGPT_JSONL: &str = include_str!("datasets/default_sharegpt.jsonl");
const DEFAULT_VISION_JSONL: &str = include_str!("datasets/default_vision.jsonl");

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    pub id: String,
    pub prompt: String,
    pub image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    id: String,
    prompt: String,
    #[serde(default)]
    image: Option<String>,
}

impl From<RawRecord> for DatasetRecord {
    fn from(r: RawRecord) -> Self {
        Self {
            id: r.id,
            prompt: r.prompt,
            image: r.image,
        }
    }
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("dataset line {line} is not valid JSON: {source}")]
    MalformedLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("dataset has no records")]
    EmptyDataset,
    #[error("failed to read dataset file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// An infinite, shared, round-robin sequence over a dataset. Iteration order
/// for built-in datasets is fixed: insertion order in the embedded JSONL.
#[derive(Clone)]
pub struct Sampler {
    records: Arc<Vec<DatasetRecord>>,
    cursor: Arc<Mutex<usize>>,
}

impl Sampler {
    pub fn from_dataset(dataset: &Dataset) -> Result<Self, DataSourceError> {
        let records = match dataset {
            Dataset::DefaultText => parse_jsonl(DEFAULT_TEXT_JSONL)?,
            Dataset::DefaultShareGpt => parse_jsonl(DEFAULT_SHAREGPT_JSONL)?,
            Dataset::DefaultVision => parse_jsonl(DEFAULT_VISION_JSONL)?,
            Dataset::InlineJsonl { jsonl } => parse_jsonl(jsonl)?,
            Dataset::UploadedJsonl { path } => {
                let content =
                    std::fs::read_to_string(path).map_err(|e| DataSourceError::IoError {
                        path: path.clone(),
                        source: e,
                    })?;
                parse_jsonl(&content)?
            }
            Dataset::None => vec![DatasetRecord {
                id: "none".to_string(),
                prompt: String::new(),
                image: None,
            }],
        };

        if records.is_empty() {
            return Err(DataSourceError::EmptyDataset);
        }

        Ok(Self {
            records: Arc::new(records),
            cursor: Arc::new(Mutex::new(0)),
        })
    }

    /// Advances the shared cursor atomically and returns the next record,
    /// wrapping around when the dataset is exhausted.
    pub fn next(&self) -> DatasetRecord {
        let mut cursor = self.cursor.lock().unwrap();
        let record = self.records[*cursor % self.records.len()].clone();
        *cursor = cursor.wrapping_add(1);
        record
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn parse_jsonl(content: &str) -> Result<Vec<DatasetRecord>, DataSourceError> {
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: RawRecord = serde_json::from_str(line).map_err(|e| DataSourceError::MalformedLine {
            line: idx + 1,
            source: e,
        })?;
        records.push(raw.into());
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_text_dataset_parses() {
        let sampler = Sampler::from_dataset(&Dataset::DefaultText).unwrap();
        assert!(sampler.len() >= 5);
    }

    #[test]
    fn default_vision_records_carry_an_image() {
        let sampler = Sampler::from_dataset(&Dataset::DefaultVision).unwrap();
        let record = sampler.next();
        assert!(record.image.is_some());
    }

    #[test]
    fn round_robin_wraps_around() {
        let sampler = Sampler::from_dataset(&Dataset::InlineJsonl {
            jsonl: "{\"id\":\"a\",\"prompt\":\"1\"}\n{\"id\":\"b\",\"prompt\":\"2\"}".to_string(),
        })
        .unwrap();

        let seen: Vec<String> = (0..4).map(|_| sampler.next().id).collect();
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn malformed_line_rejected_before_any_user_runs() {
        let result = Sampler::from_dataset(&Dataset::InlineJsonl {
            jsonl: "{\"id\":\"a\",\"prompt\":\"1\"}\nnot json".to_string(),
        });
        assert!(matches!(
            result,
            Err(DataSourceError::MalformedLine { line: 2, .. })
        ));
    }

    #[test]
    fn none_dataset_yields_single_empty_sentinel() {
        let sampler = Sampler::from_dataset(&Dataset::None).unwrap();
        let record = sampler.next();
        assert_eq!(record.prompt, "");
        assert_eq!(sampler.len(), 1);
    }

    #[test]
    fn concurrent_next_never_skips_or_duplicates_within_one_cycle() {
        use std::collections::HashSet;
        use std::thread;

        let sampler = Sampler::from_dataset(&Dataset::DefaultText).unwrap();
        let n = sampler.len();

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let sampler = sampler.clone();
                thread::spawn(move || sampler.next().id)
            })
            .collect();

        let ids: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), n);
    }
}
