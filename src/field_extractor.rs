//! Dotted-path extraction over decoded JSON (§4.1).
//!
//! Deliberately narrower than JSONPath: a path is a `.`-separated list of
//! segments, each either an object key or, when it parses as an integer, an
//! array index (`-1` selects the array's last element as it currently
//! stands). Missing segments resolve to `None` rather than an error — a
//! provider that omits a field should never fail the request.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractionError {
    #[error("path is empty")]
    EmptyPath,
}

/// The typed union `string | number | bool | object | null | None` from §4.1.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    String(String),
    Number(f64),
    Bool(bool),
    Object(Value),
    Null,
}

impl Extracted {
    /// Numeric coercion: numeric strings parse, everything else that isn't
    /// already a number yields `None` per §4.1's "all other type mismatches
    /// yield None".
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Extracted::Number(n) => Some(*n),
            Extracted::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Non-empty-string test used throughout `ResponseAccountant` to decide
    /// whether a frame "yields a non-empty token".
    pub fn as_non_empty_str(&self) -> Option<&str> {
        match self {
            Extracted::String(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Splits a path on `.` and walks `value`, returning the first missing
/// segment as `None` rather than failing. The only error case is an empty
/// path, which is a configuration mistake rather than a per-response miss.
pub fn extract(value: &Value, path: &str) -> Result<Option<Extracted>, ExtractionError> {
    if path.is_empty() {
        return Err(ExtractionError::EmptyPath);
    }

    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Array(arr) => {
                let idx = match segment.parse::<i64>() {
                    Ok(i) => i,
                    Err(_) => return Ok(None),
                };
                let resolved = if idx < 0 {
                    let from_end = (-idx) as usize;
                    arr.len().checked_sub(from_end)
                } else {
                    Some(idx as usize)
                };
                match resolved.and_then(|i| arr.get(i)) {
                    Some(v) => current = v,
                    None => return Ok(None),
                }
            }
            Value::Object(map) => match map.get(segment) {
                Some(v) => current = v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        }
    }

    Ok(Some(to_extracted(current)))
}

fn to_extracted(value: &Value) -> Extracted {
    match value {
        Value::String(s) => Extracted::String(s.clone()),
        Value::Number(n) => Extracted::Number(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => Extracted::Bool(*b),
        Value::Null => Extracted::Null,
        other => Extracted::Object(other.clone()),
    }
}
