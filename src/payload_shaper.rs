//! Per-request JSON body shaping (§4.3).
//!
//! Writes the current dataset sample into the request template at the
//! configured dotted path, and the optional image. For OpenAI-like and
//! Claude-like kinds, also pins the `stream` field so the server-side
//! streaming flag always matches the engine's own `stream_mode`.

use serde_json::Value;
use thiserror::Error;

use crate::descriptor::{ApiKind, FieldMap};
use crate::sampler::DatasetRecord;

#[derive(Debug, Error, PartialEq)]
pub enum ShapeError {
    #[error("path segment not addressable in template: {0}")]
    PathNotFound(String),
}

pub struct PayloadShaper {
    prompt_path: String,
    image_path: Option<String>,
    api_kind: ApiKind,
    stream_mode: bool,
}

impl PayloadShaper {
    pub fn new(field_map: &FieldMap, api_kind: ApiKind, stream_mode: bool) -> Self {
        Self {
            prompt_path: field_map.prompt_path.clone(),
            image_path: field_map.image_path.clone(),
            api_kind,
            stream_mode,
        }
    }

    /// Produces a shaped copy of `template` for one request. Never mutates
    /// `template` itself; each virtual user's request is independent.
    pub fn shape(&self, template: &Value, record: &DatasetRecord) -> Result<Value, ShapeError> {
        let mut body = template.clone();

        set_path(
            &mut body,
            &self.prompt_path,
            Value::String(record.prompt.clone()),
        )?;

        if let (Some(path), Some(image)) = (&self.image_path, &record.image) {
            set_path(&mut body, path, Value::String(image.clone()))?;
        }

        if matches!(self.api_kind, ApiKind::OpenAiChat | ApiKind::ClaudeChat) {
            set_path(&mut body, "stream", Value::Bool(self.stream_mode))?;
        }

        Ok(body)
    }

    /// Dry-runs `shape` against a sentinel record so descriptor validation
    /// can reject a malformed template before any user is spawned (§4.3).
    pub fn validate_template(&self, template: &Value) -> Result<(), ShapeError> {
        let sentinel = DatasetRecord {
            id: "validation".to_string(),
            prompt: String::new(),
            image: self.image_path.as_ref().map(|_| String::new()),
        };
        self.shape(template, &sentinel).map(|_| ())
    }
}

fn set_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), ShapeError> {
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(value, &segments, new_value)
}

fn set_segments(value: &mut Value, segments: &[&str], new_value: Value) -> Result<(), ShapeError> {
    let (head, rest) = match segments.split_first() {
        Some(pair) => pair,
        None => {
            *value = new_value;
            return Ok(());
        }
    };

    match value {
        Value::Array(arr) => {
            let idx: i64 = head
                .parse()
                .map_err(|_| ShapeError::PathNotFound(head.to_string()))?;
            let resolved = if idx < 0 {
                arr.len().checked_sub((-idx) as usize)
            } else {
                Some(idx as usize)
            };
            let i = resolved.ok_or_else(|| ShapeError::PathNotFound(head.to_string()))?;
            let slot = arr
                .get_mut(i)
                .ok_or_else(|| ShapeError::PathNotFound(head.to_string()))?;
            set_segments(slot, rest, new_value)
        }
        Value::Object(map) => {
            if rest.is_empty() {
                map.insert((*head).to_string(), new_value);
                Ok(())
            } else {
                let entry = map
                    .entry((*head).to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                set_segments(entry, rest, new_value)
            }
        }
        _ => Err(ShapeError::PathNotFound(head.to_string())),
    }
}
