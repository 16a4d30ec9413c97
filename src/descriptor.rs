//! The task descriptor: the engine's sole per-task configuration surface.
//!
//! A `TaskDescriptor` is supplied fully materialized (by the HTTP API layer, or
//! by a file for the demo binary) and is immutable once a task has started.
//! `validate()` is the one gate between an operator-submitted descriptor and a
//! running task; nothing downstream re-validates it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The shape of API the target endpoint exposes. Differences between kinds
/// are limited to the default field map and default request template that
/// `ApiKind::default_field_map` / `default_request_template` produce; the
/// rest of the engine is kind-agnostic per the tagged-variant design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiKind {
    OpenAiChat,
    ClaudeChat,
    Embeddings,
    CustomChat,
    GenericHttp,
}

/// How a stream `Data` frame's payload should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    Text,
}

/// Request- and response-side field mapping (§3 FieldMap).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMap {
    pub prompt_path: String,
    #[serde(default)]
    pub image_path: Option<String>,

    #[serde(default = "FieldMap::default_line_prefix")]
    pub line_prefix: String,
    #[serde(default = "FieldMap::default_data_format")]
    pub data_format: DataFormat,
    pub content_path: String,
    #[serde(default)]
    pub reasoning_content_path: Option<String>,
    #[serde(default)]
    pub prompt_tokens_path: Option<String>,
    #[serde(default)]
    pub completion_tokens_path: Option<String>,
    #[serde(default)]
    pub total_tokens_path: Option<String>,
    #[serde(default)]
    pub end_line_prefix: Option<String>,
    #[serde(default)]
    pub end_field_path: Option<String>,
    #[serde(default = "FieldMap::default_stop_token")]
    pub stop_token: String,
}

impl FieldMap {
    fn default_line_prefix() -> String {
        "data:".to_string()
    }

    fn default_data_format() -> DataFormat {
        DataFormat::Json
    }

    fn default_stop_token() -> String {
        "[DONE]".to_string()
    }
}

/// Either a fixed user count held for the task duration, or a stepped ramp
/// that grows the active user count in increments (§3 LoadProfile).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LoadProfile {
    Fixed {
        users: u32,
        duration_s: u64,
        spawn_per_s: u32,
    },
    Stepped {
        start_users: u32,
        step_increment: u32,
        step_duration_s: u64,
        sustain_duration_s: u64,
        max_users: u32,
    },
}

impl LoadProfile {
    /// The user count the profile never exceeds, used for validation and for
    /// sizing the shared HTTP client's connection pool.
    pub fn max_users(&self) -> u32 {
        match self {
            LoadProfile::Fixed { users, .. } => *users,
            LoadProfile::Stepped { max_users, .. } => *max_users,
        }
    }

    /// A conservative upper bound on how long the task can run, used to size
    /// the default read timeout (§5) before a task has actually started.
    pub fn duration_upper_bound_s(&self) -> u64 {
        match self {
            LoadProfile::Fixed { duration_s, .. } => *duration_s,
            LoadProfile::Stepped {
                start_users,
                step_increment,
                step_duration_s,
                sustain_duration_s,
                max_users,
            } => {
                let steps = if *step_increment == 0 {
                    0
                } else {
                    (max_users.saturating_sub(*start_users) as u64) / (*step_increment as u64)
                };
                steps.saturating_mul(*step_duration_s) + sustain_duration_s
            }
        }
    }
}

/// Which dataset the Sampler iterates (§3/§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Dataset {
    DefaultText,
    DefaultVision,
    DefaultShareGpt,
    /// JSONL records embedded directly in the descriptor.
    InlineJsonl { jsonl: String },
    /// JSONL records resolved from a file path by the external upload layer.
    UploadedJsonl { path: String },
    None,
}

/// A combined cert+key pair, mounted per-task (§6), never global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsClientIdentity {
    pub cert_path: String,
    pub key_path: String,
}

/// Per-request timeout bounds (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "Timeouts::default_connect_timeout_s")]
    pub connect_timeout_s: u64,
    /// Defaults to half the task's upper-bound duration, capped at 600s,
    /// when not set explicitly.
    #[serde(default)]
    pub read_timeout_s: Option<u64>,
}

impl Timeouts {
    fn default_connect_timeout_s() -> u64 {
        10
    }

    pub fn resolved_read_timeout_s(&self, duration_upper_bound_s: u64) -> u64 {
        self.read_timeout_s
            .unwrap_or_else(|| (duration_upper_bound_s / 2).clamp(1, 600))
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_timeout_s: Self::default_connect_timeout_s(),
            read_timeout_s: None,
        }
    }
}

/// The engine's sole per-task configuration surface. Immutable once a task
/// has started; `TaskRuntime` owns it for the task's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub name: String,
    pub api_kind: ApiKind,
    pub target_base_url: String,
    pub api_path: String,
    #[serde(default = "TaskDescriptor::default_http_method")]
    pub http_method: String,
    pub request_template: serde_json::Value,
    /// An ordered map: insertion order is preserved when building the
    /// outbound request, and `Content-Type` is fixed based on `field_map`.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub tls_client_identity: Option<TlsClientIdentity>,
    #[serde(default)]
    pub stream_mode: bool,
    pub field_map: FieldMap,
    pub dataset: Dataset,
    pub load_profile: LoadProfile,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl TaskDescriptor {
    fn default_http_method() -> String {
        "POST".to_string()
    }

    /// Validates every invariant named in §3/§5. Called once, synchronously,
    /// from `TaskRuntime::start` before any component is constructed.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.task_id.trim().is_empty() {
            return Err(DescriptorError::MissingField("task_id"));
        }
        if self.target_base_url.trim().is_empty() {
            return Err(DescriptorError::MissingField("target_base_url"));
        }
        let scheme_ok = self.target_base_url.starts_with("http://")
            || self.target_base_url.starts_with("https://");
        if !scheme_ok {
            return Err(DescriptorError::InvalidUrl(self.target_base_url.clone()));
        }
        if self.field_map.prompt_path.trim().is_empty() {
            return Err(DescriptorError::MissingField("field_map.prompt_path"));
        }
        if self.field_map.content_path.trim().is_empty() {
            return Err(DescriptorError::MissingField("field_map.content_path"));
        }

        match &self.load_profile {
            LoadProfile::Fixed {
                users,
                duration_s,
                spawn_per_s,
            } => {
                if *users < 1 {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.users",
                        message: "must be >= 1".into(),
                    });
                }
                if *users as u64 > 5000 {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.users",
                        message: "must be <= 5000".into(),
                    });
                }
                if !(1..=100).contains(spawn_per_s) {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.spawn_per_s",
                        message: "must be in [1, 100]".into(),
                    });
                }
                if !(1..=172_800).contains(duration_s) {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.duration_s",
                        message: "must be in [1, 172800]".into(),
                    });
                }
            }
            LoadProfile::Stepped {
                start_users,
                step_increment,
                step_duration_s,
                sustain_duration_s,
                max_users,
            } => {
                if *start_users < 1 {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.start_users",
                        message: "must be >= 1".into(),
                    });
                }
                if *max_users as u64 > 5000 {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.max_users",
                        message: "must be <= 5000".into(),
                    });
                }
                if max_users < start_users {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.max_users",
                        message: "must be >= start_users".into(),
                    });
                }
                if *step_increment == 0 {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.step_increment",
                        message: "must be >= 1".into(),
                    });
                }
                if *step_duration_s == 0 || *sustain_duration_s == 0 {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile.step_duration_s/sustain_duration_s",
                        message: "must be >= 1".into(),
                    });
                }
                let total = self.load_profile.duration_upper_bound_s();
                if !(1..=172_800).contains(&total) {
                    return Err(DescriptorError::InvalidValue {
                        field: "load_profile",
                        message: "total ramp duration must be in [1, 172800] seconds".into(),
                    });
                }
            }
        }

        if let Some(identity) = &self.tls_client_identity {
            if identity.cert_path.trim().is_empty() || identity.key_path.trim().is_empty() {
                return Err(DescriptorError::IncompleteTlsIdentity);
            }
        }

        if let Dataset::UploadedJsonl { path } = &self.dataset {
            if path.trim().is_empty() {
                return Err(DescriptorError::MissingField("dataset.path"));
            }
        }
        if let Dataset::InlineJsonl { jsonl } = &self.dataset {
            if jsonl.trim().is_empty() {
                return Err(DescriptorError::MissingField("dataset.jsonl"));
            }
        }

        Ok(())
    }

    /// Materializes a default `FieldMap` for kinds that have one (§3). Only
    /// `custom-chat` requires the operator to supply every path; calling
    /// this for that kind returns `None`.
    pub fn default_field_map(kind: ApiKind) -> Option<FieldMap> {
        match kind {
            ApiKind::OpenAiChat => Some(FieldMap {
                prompt_path: "messages.-1.content".to_string(),
                image_path: None,
                line_prefix: "data:".to_string(),
                data_format: DataFormat::Json,
                content_path: "choices.0.delta.content".to_string(),
                reasoning_content_path: Some("choices.0.delta.reasoning_content".to_string()),
                prompt_tokens_path: Some("usage.prompt_tokens".to_string()),
                completion_tokens_path: Some("usage.completion_tokens".to_string()),
                total_tokens_path: Some("usage.total_tokens".to_string()),
                end_line_prefix: None,
                end_field_path: None,
                stop_token: "[DONE]".to_string(),
            }),
            ApiKind::ClaudeChat => Some(FieldMap {
                prompt_path: "messages.-1.content".to_string(),
                image_path: None,
                line_prefix: "data:".to_string(),
                data_format: DataFormat::Json,
                content_path: "delta.text".to_string(),
                reasoning_content_path: Some("delta.thinking".to_string()),
                prompt_tokens_path: Some("usage.input_tokens".to_string()),
                completion_tokens_path: Some("usage.output_tokens".to_string()),
                total_tokens_path: None,
                end_line_prefix: Some("data:".to_string()),
                end_field_path: Some("type".to_string()),
                stop_token: "message_stop".to_string(),
            }),
            ApiKind::Embeddings => Some(FieldMap {
                prompt_path: "input".to_string(),
                image_path: None,
                line_prefix: "data:".to_string(),
                data_format: DataFormat::Json,
                content_path: "data.0.embedding".to_string(),
                reasoning_content_path: None,
                prompt_tokens_path: Some("usage.prompt_tokens".to_string()),
                completion_tokens_path: None,
                total_tokens_path: Some("usage.total_tokens".to_string()),
                end_line_prefix: None,
                end_field_path: None,
                stop_token: "[DONE]".to_string(),
            }),
            ApiKind::CustomChat | ApiKind::GenericHttp => None,
        }
    }

    /// The request template a freshly-submitted descriptor gets if it didn't
    /// carry one, for the kinds where a default makes sense. `custom-chat`
    /// and `generic-http` always require the operator to supply one.
    pub fn default_request_template(kind: ApiKind) -> Option<serde_json::Value> {
        match kind {
            ApiKind::OpenAiChat => Some(serde_json::json!({
                "model": "none",
                "stream": true,
                "messages": [{"role": "user", "content": ""}]
            })),
            ApiKind::ClaudeChat => Some(serde_json::json!({
                "model": "none",
                "stream": true,
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": ""}]
            })),
            ApiKind::Embeddings => Some(serde_json::json!({
                "model": "none",
                "input": ""
            })),
            ApiKind::CustomChat | ApiKind::GenericHttp => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
    #[error("invalid target_base_url: {0}")]
    InvalidUrl(String),
    #[error("tls_client_identity must set both cert_path and key_path, or neither")]
    IncompleteTlsIdentity,
    #[error("request_template is not valid JSON: {0}")]
    MalformedTemplate(String),
    #[error("dataset is invalid: {0}")]
    InvalidDataset(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_descriptor() -> TaskDescriptor {
        TaskDescriptor {
            task_id: "t-1".to_string(),
            name: "smoke".to_string(),
            api_kind: ApiKind::OpenAiChat,
            target_base_url: "https://example.com".to_string(),
            api_path: "/v1/chat/completions".to_string(),
            http_method: "POST".to_string(),
            request_template: TaskDescriptor::default_request_template(ApiKind::OpenAiChat).unwrap(),
            headers: vec![],
            cookies: BTreeMap::new(),
            tls_client_identity: None,
            stream_mode: true,
            field_map: TaskDescriptor::default_field_map(ApiKind::OpenAiChat).unwrap(),
            dataset: Dataset::DefaultText,
            load_profile: LoadProfile::Fixed {
                users: 2,
                duration_s: 5,
                spawn_per_s: 2,
            },
            timeouts: Timeouts::default(),
        }
    }

    #[test]
    fn minimal_descriptor_validates() {
        assert!(minimal_descriptor().validate().is_ok());
    }

    #[test]
    fn rejects_missing_scheme() {
        let mut d = minimal_descriptor();
        d.target_base_url = "example.com".to_string();
        assert!(matches!(d.validate(), Err(DescriptorError::InvalidUrl(_))));
    }

    #[test]
    fn rejects_zero_users() {
        let mut d = minimal_descriptor();
        d.load_profile = LoadProfile::Fixed {
            users: 0,
            duration_s: 5,
            spawn_per_s: 1,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn rejects_spawn_per_s_out_of_range() {
        let mut d = minimal_descriptor();
        d.load_profile = LoadProfile::Fixed {
            users: 2,
            duration_s: 5,
            spawn_per_s: 101,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn rejects_max_users_over_cap() {
        let mut d = minimal_descriptor();
        d.load_profile = LoadProfile::Stepped {
            start_users: 1,
            step_increment: 100,
            step_duration_s: 10,
            sustain_duration_s: 10,
            max_users: 5001,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn rejects_half_configured_mtls() {
        let mut d = minimal_descriptor();
        d.tls_client_identity = Some(TlsClientIdentity {
            cert_path: "cert.pem".to_string(),
            key_path: "".to_string(),
        });
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::IncompleteTlsIdentity)
        ));
    }

    #[test]
    fn default_field_map_is_none_for_custom_chat() {
        assert!(TaskDescriptor::default_field_map(ApiKind::CustomChat).is_none());
    }

    #[test]
    fn stepped_duration_upper_bound() {
        let profile = LoadProfile::Stepped {
            start_users: 10,
            step_increment: 10,
            step_duration_s: 30,
            sustain_duration_s: 60,
            max_users: 100,
        };
        assert_eq!(profile.duration_upper_bound_s(), 9 * 30 + 60);
    }
}
