//! One HTTP call, end to end: shape the body, send it, drive the
//! `StreamParser` and `FieldExtractor` over the response, and account for
//! token/timing stages (§4.5 Requester + ResponseAccountant).

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::connection_pool::PoolStatsTracker;
use crate::descriptor::FieldMap;
use crate::errors::CategorizedError;
use crate::field_extractor::{self, Extracted};
use crate::measurement::{Measurement, Outcome};
use crate::payload_shaper::PayloadShaper;
use crate::sampler::DatasetRecord;
use crate::stream_parser::{Frame, StreamParser};

/// Bytes per estimated token, used only when a provider never reports real
/// token counts (§4.5 step 7).
const CHARS_PER_TOKEN_ESTIMATE: f64 = 4.0;
const HTTP_ERROR_BODY_CAP: usize = 64 * 1024;
const NON_STREAMING_BODY_CAP: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RequesterBuildError {
    #[error("invalid http method '{0}'")]
    InvalidMethod(String),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid header name/value: {0}")]
    InvalidHeader(String),
}

pub struct Requester {
    client: reqwest::Client,
    method: Method,
    url: reqwest::Url,
    headers: reqwest::header::HeaderMap,
    field_map: FieldMap,
    stream_mode: bool,
    shaper: PayloadShaper,
    request_template: Value,
    read_timeout: Duration,
    pool_stats: Arc<PoolStatsTracker>,
}

impl Requester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        method: &str,
        url: reqwest::Url,
        headers: reqwest::header::HeaderMap,
        field_map: FieldMap,
        stream_mode: bool,
        shaper: PayloadShaper,
        request_template: Value,
        read_timeout: Duration,
        pool_stats: Arc<PoolStatsTracker>,
    ) -> Result<Self, RequesterBuildError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| RequesterBuildError::InvalidMethod(method.to_string()))?;

        Ok(Self {
            client,
            method,
            url,
            headers,
            field_map,
            stream_mode,
            shaper,
            request_template,
            read_timeout,
            pool_stats,
        })
    }

    pub async fn execute(
        &self,
        record: &DatasetRecord,
        user_id: u32,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Measurement {
        let start_ts = Instant::now();
        let api_path = self.url.path().to_string();
        let prompt_chars = record.prompt.len() as u64;

        let body = match self.shaper.shape(&self.request_template, record) {
            Ok(body) => body,
            Err(e) => {
                return Measurement {
                    user_id,
                    api_path,
                    start_ts,
                    first_reasoning_ts: None,
                    first_output_ts: None,
                    completion_ts: None,
                    end_ts: Instant::now(),
                    http_status: None,
                    outcome: Outcome::ParseError,
                    prompt_tokens: None,
                    completion_tokens: None,
                    total_tokens: None,
                    tokens_estimated: false,
                    content_length_bytes: 0,
                    diagnostic: Some(format!("payload shaping failed: {e}")),
                };
            }
        };

        let send_result = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone())
            .timeout(self.read_timeout)
            .json(&body)
            .send()
            .await;

        let latency_ms = start_ts.elapsed().as_millis() as u64;
        self.pool_stats.record_request(latency_ms);

        let response = match send_result {
            Ok(response) => response,
            Err(e) => {
                let categorized = CategorizedError::from_reqwest(&e, Some(self.url.to_string()));
                debug!(user_id = user_id, error = %categorized, "request failed before a response was received");
                let outcome = if e.is_timeout() {
                    Outcome::Timeout
                } else {
                    Outcome::HttpError
                };
                return Measurement {
                    user_id,
                    api_path,
                    start_ts,
                    first_reasoning_ts: None,
                    first_output_ts: None,
                    completion_ts: None,
                    end_ts: Instant::now(),
                    http_status: None,
                    outcome,
                    prompt_tokens: None,
                    completion_tokens: None,
                    total_tokens: None,
                    tokens_estimated: false,
                    content_length_bytes: 0,
                    diagnostic: Some(categorized.to_string()),
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let diagnostic = read_bounded_text(response, HTTP_ERROR_BODY_CAP).await;
            return Measurement {
                user_id,
                api_path,
                start_ts,
                first_reasoning_ts: None,
                first_output_ts: None,
                completion_ts: None,
                end_ts: Instant::now(),
                http_status: Some(status.as_u16()),
                outcome: Outcome::HttpError,
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
                tokens_estimated: false,
                content_length_bytes: 0,
                diagnostic,
            };
        }

        if self.stream_mode {
            self.drive_streaming(response, user_id, api_path, start_ts, prompt_chars, stop_rx)
                .await
        } else {
            self.drive_non_streaming(response, user_id, api_path, start_ts, prompt_chars)
                .await
        }
    }

    async fn drive_non_streaming(
        &self,
        response: reqwest::Response,
        user_id: u32,
        api_path: String,
        start_ts: Instant,
        prompt_chars: u64,
    ) -> Measurement {
        let status = response.status().as_u16();
        let body_text = read_bounded_text(response, NON_STREAMING_BODY_CAP)
            .await
            .unwrap_or_default();
        let now = Instant::now();

        let parsed: Option<Value> = serde_json::from_str(&body_text).ok();

        let content_len = parsed
            .as_ref()
            .and_then(|v| field_extractor::extract(v, &self.field_map.content_path).ok().flatten())
            .and_then(|e| e.as_non_empty_str().map(|s| s.len() as u64))
            .unwrap_or(0);

        let (prompt_tokens, completion_tokens, total_tokens, mut estimated) =
            parsed.as_ref().map_or((None, None, None, true), |v| {
                self.extract_token_counts(v)
            });

        if prompt_tokens.is_none() && completion_tokens.is_none() && total_tokens.is_none() {
            estimated = true;
        }

        let (prompt_tokens, completion_tokens, total_tokens) = if estimated {
            (
                prompt_tokens.or_else(|| Some(estimate_tokens(prompt_chars))),
                completion_tokens.or(Some(estimate_tokens(content_len))),
                total_tokens,
            )
        } else {
            (prompt_tokens, completion_tokens, total_tokens)
        };

        Measurement {
            user_id,
            api_path,
            start_ts,
            first_reasoning_ts: None,
            first_output_ts: Some(now),
            completion_ts: Some(now),
            end_ts: now,
            http_status: Some(status),
            outcome: if parsed.is_some() {
                Outcome::Ok
            } else {
                Outcome::ParseError
            },
            prompt_tokens,
            completion_tokens,
            total_tokens,
            tokens_estimated: estimated,
            content_length_bytes: content_len,
            diagnostic: None,
        }
    }

    async fn drive_streaming(
        &self,
        mut response: reqwest::Response,
        user_id: u32,
        api_path: String,
        start_ts: Instant,
        prompt_chars: u64,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Measurement {
        let mut parser = StreamParser::new(&self.field_map);
        let status = response.status().as_u16();

        let mut first_reasoning_ts: Option<Instant> = None;
        let mut first_output_ts: Option<Instant> = None;
        let mut completion_ts: Option<Instant> = None;
        let mut content_length_bytes: u64 = 0;
        let mut prompt_tokens: Option<u64> = None;
        let mut completion_tokens: Option<u64> = None;
        let mut total_tokens: Option<u64> = None;
        let mut saw_output_token = false;
        let mut outcome = Outcome::ParseError;
        let mut end_ts = Instant::now();

        'read_loop: loop {
            if *stop_rx.borrow() {
                outcome = Outcome::Canceled;
                end_ts = Instant::now();
                break;
            }
            if start_ts.elapsed() >= self.read_timeout {
                outcome = Outcome::Timeout;
                end_ts = Instant::now();
                break;
            }

            while let Some(frame) = parser.next_frame() {
                match frame {
                    Frame::End => {
                        outcome = Outcome::Ok;
                        end_ts = Instant::now();
                        break 'read_loop;
                    }
                    Frame::Ignored => {}
                    Frame::Data(payload) => {
                        let now = Instant::now();
                        let parsed: Option<Value> = match self.field_map.data_format {
                            crate::descriptor::DataFormat::Json => {
                                serde_json::from_str(&payload).ok()
                            }
                            crate::descriptor::DataFormat::Text => {
                                Some(Value::String(payload.clone()))
                            }
                        };

                        let parsed = match parsed {
                            Some(v) => v,
                            None => continue,
                        };

                        if let Some(path) = &self.field_map.reasoning_content_path {
                            if let Ok(Some(e)) = field_extractor::extract(&parsed, path) {
                                if e.as_non_empty_str().is_some() && first_reasoning_ts.is_none() {
                                    first_reasoning_ts = Some(now);
                                }
                            }
                        }

                        if let Ok(Some(e)) =
                            field_extractor::extract(&parsed, &self.field_map.content_path)
                        {
                            if let Some(text) = e.as_non_empty_str() {
                                if first_output_ts.is_none() {
                                    first_output_ts = Some(now);
                                }
                                completion_ts = Some(now);
                                content_length_bytes += text.len() as u64;
                                saw_output_token = true;
                            }
                        }

                        self.update_token_counts(
                            &parsed,
                            &mut prompt_tokens,
                            &mut completion_tokens,
                            &mut total_tokens,
                        );
                    }
                }
            }

            match response.chunk().await {
                Ok(Some(bytes)) => parser.feed(&bytes),
                Ok(None) => {
                    if let Some(frame) = parser.finish() {
                        if let Frame::Data(payload) = frame {
                            if let Ok(parsed) = serde_json::from_str::<Value>(&payload) {
                                if let Ok(Some(e)) = field_extractor::extract(
                                    &parsed,
                                    &self.field_map.content_path,
                                ) {
                                    if let Some(text) = e.as_non_empty_str() {
                                        if first_output_ts.is_none() {
                                            first_output_ts = Some(Instant::now());
                                        }
                                        completion_ts = Some(Instant::now());
                                        content_length_bytes += text.len() as u64;
                                        saw_output_token = true;
                                    }
                                }
                            }
                        }
                    }
                    outcome = if saw_output_token {
                        Outcome::Ok
                    } else {
                        Outcome::ParseError
                    };
                    end_ts = Instant::now();
                    break;
                }
                Err(e) => {
                    let categorized = CategorizedError::from_reqwest(&e, Some(self.url.to_string()));
                    debug!(user_id = user_id, error = %categorized, "stream read failed mid-body");
                    outcome = if e.is_timeout() {
                        Outcome::Timeout
                    } else {
                        Outcome::HttpError
                    };
                    end_ts = Instant::now();
                    break;
                }
            }
        }

        let tokens_estimated = prompt_tokens.is_none() && completion_tokens.is_none() && total_tokens.is_none();
        let (prompt_tokens, completion_tokens) = if tokens_estimated {
            (
                Some(estimate_tokens(prompt_chars)),
                Some(estimate_tokens(content_length_bytes)),
            )
        } else {
            (prompt_tokens, completion_tokens)
        };

        Measurement {
            user_id,
            api_path,
            start_ts,
            first_reasoning_ts,
            first_output_ts,
            completion_ts,
            end_ts,
            http_status: Some(status),
            outcome,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            tokens_estimated,
            content_length_bytes,
            diagnostic: None,
        }
    }

    /// Last-seen-cumulative: every sighting overwrites outright (§11 resolution #1).
    fn update_token_counts(
        &self,
        parsed: &Value,
        prompt_tokens: &mut Option<u64>,
        completion_tokens: &mut Option<u64>,
        total_tokens: &mut Option<u64>,
    ) {
        if let Some(path) = &self.field_map.prompt_tokens_path {
            if let Ok(Some(e)) = field_extractor::extract(parsed, path) {
                if let Some(v) = e.as_f64() {
                    *prompt_tokens = Some(v as u64);
                }
            }
        }
        if let Some(path) = &self.field_map.completion_tokens_path {
            if let Ok(Some(e)) = field_extractor::extract(parsed, path) {
                if let Some(v) = e.as_f64() {
                    *completion_tokens = Some(v as u64);
                }
            }
        }
        if let Some(path) = &self.field_map.total_tokens_path {
            if let Ok(Some(e)) = field_extractor::extract(parsed, path) {
                if let Some(v) = e.as_f64() {
                    *total_tokens = Some(v as u64);
                }
            }
        }
    }

    fn extract_token_counts(&self, parsed: &Value) -> (Option<u64>, Option<u64>, Option<u64>, bool) {
        let mut prompt_tokens = None;
        let mut completion_tokens = None;
        let mut total_tokens = None;
        self.update_token_counts(parsed, &mut prompt_tokens, &mut completion_tokens, &mut total_tokens);
        let estimated = prompt_tokens.is_none() && completion_tokens.is_none() && total_tokens.is_none();
        (prompt_tokens, completion_tokens, total_tokens, estimated)
    }
}

fn estimate_tokens(bytes: u64) -> u64 {
    ((bytes as f64) / CHARS_PER_TOKEN_ESTIMATE).round() as u64
}


async fn read_bounded_text(mut response: reqwest::Response, cap: usize) -> Option<String> {
    let mut buf = Vec::new();
    while buf.len() < cap {
        match response.chunk().await {
            Ok(Some(bytes)) => buf.extend_from_slice(&bytes),
            Ok(None) => break,
            Err(_) => break,
        }
    }
    buf.truncate(cap);
    if buf.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buf).into_owned())
    }
}
