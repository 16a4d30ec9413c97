//! The per-request record (§3 Measurement/StageSample) that flows from the
//! `Requester` to the `Aggregator`.

use std::time::Instant;

/// The outcome of one request, recorded on every `Measurement` regardless of
/// success or failure — request-level errors are metrics, not exceptions
/// (§7/§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    HttpError,
    ParseError,
    Timeout,
    Canceled,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Ok)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::HttpError => "http_error",
            Outcome::ParseError => "parse_error",
            Outcome::Timeout => "timeout",
            Outcome::Canceled => "canceled",
        }
    }
}

/// One completed request. Timestamps are monotonic clock readings; ordering
/// among the populated ones is `start_ts <= first_reasoning_ts <=
/// first_output_ts <= completion_ts <= end_ts`.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub user_id: u32,
    pub api_path: String,
    pub start_ts: Instant,
    pub first_reasoning_ts: Option<Instant>,
    pub first_output_ts: Option<Instant>,
    pub completion_ts: Option<Instant>,
    pub end_ts: Instant,
    pub http_status: Option<u16>,
    pub outcome: Outcome,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub tokens_estimated: bool,
    pub content_length_bytes: u64,
    pub diagnostic: Option<String>,
}

/// A Measurement decomposed into the per-stage samples the Aggregator folds
/// into its buckets (§3 StageSample).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    TimeToFirstReasoningToken,
    TimeToFirstOutputToken,
    TimeToOutputCompletion,
    TotalTime,
    /// Path-scoped, keyed by the request's `api_path`.
    Path,
    Failure,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::TimeToFirstReasoningToken => "time_to_first_reasoning_token",
            Stage::TimeToFirstOutputToken => "time_to_first_output_token",
            Stage::TimeToOutputCompletion => "time_to_output_completion",
            Stage::TotalTime => "total_time",
            Stage::Path => "path",
            Stage::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageSample {
    pub stage: Stage,
    /// Only meaningful for `Stage::Path`: the `api_path` this sample is keyed by.
    pub key: Option<String>,
    pub value_us: u64,
    pub content_length_bytes: u64,
}

/// Decomposes a Measurement into the StageSamples the Aggregator accepts,
/// applying the ordering invariant from §4.5's "Ordering guarantee": if
/// `first_output_ts` precedes `first_reasoning_ts`, the reasoning stamp is
/// dropped rather than emitted out of order.
pub fn decompose(m: &Measurement) -> Vec<StageSample> {
    let mut samples = Vec::new();

    let reasoning_ts = match (m.first_reasoning_ts, m.first_output_ts) {
        (Some(r), Some(o)) if r > o => None,
        (r, _) => r,
    };

    if let Some(r) = reasoning_ts {
        samples.push(StageSample {
            stage: Stage::TimeToFirstReasoningToken,
            key: None,
            value_us: duration_us(m.start_ts, r),
            content_length_bytes: 0,
        });
    }

    if let Some(o) = m.first_output_ts {
        samples.push(StageSample {
            stage: Stage::TimeToFirstOutputToken,
            key: None,
            value_us: duration_us(m.start_ts, o),
            content_length_bytes: 0,
        });

        if let Some(c) = m.completion_ts {
            samples.push(StageSample {
                stage: Stage::TimeToOutputCompletion,
                key: None,
                value_us: duration_us(o, c),
                content_length_bytes: 0,
            });
        }
    }

    samples.push(StageSample {
        stage: Stage::TotalTime,
        key: None,
        value_us: duration_us(m.start_ts, m.end_ts),
        content_length_bytes: m.content_length_bytes,
    });

    samples.push(StageSample {
        stage: Stage::Path,
        key: Some(m.api_path.clone()),
        value_us: duration_us(m.start_ts, m.end_ts),
        content_length_bytes: m.content_length_bytes,
    });

    if m.outcome.is_failure() {
        samples.push(StageSample {
            stage: Stage::Failure,
            key: None,
            value_us: duration_us(m.start_ts, m.end_ts),
            content_length_bytes: 0,
        });
    }

    samples
}

fn duration_us(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_micros().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base_measurement() -> Measurement {
        let start = Instant::now();
        Measurement {
            user_id: 1,
            api_path: "/v1/chat/completions".to_string(),
            start_ts: start,
            first_reasoning_ts: None,
            first_output_ts: None,
            completion_ts: None,
            end_ts: start + Duration::from_millis(10),
            http_status: Some(200),
            outcome: Outcome::Ok,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            tokens_estimated: false,
            content_length_bytes: 0,
            diagnostic: None,
        }
    }

    #[test]
    fn decompose_always_emits_total_time_and_path() {
        let m = base_measurement();
        let samples = decompose(&m);
        assert!(samples.iter().any(|s| s.stage == Stage::TotalTime));
        assert!(samples.iter().any(|s| s.stage == Stage::Path));
        assert!(!samples.iter().any(|s| s.stage == Stage::Failure));
    }

    #[test]
    fn failure_outcome_emits_failure_stage() {
        let mut m = base_measurement();
        m.outcome = Outcome::Timeout;
        let samples = decompose(&m);
        assert!(samples.iter().any(|s| s.stage == Stage::Failure));
    }

    #[test]
    fn reasoning_after_output_is_dropped() {
        let mut m = base_measurement();
        m.first_output_ts = Some(m.start_ts + Duration::from_millis(2));
        m.first_reasoning_ts = Some(m.start_ts + Duration::from_millis(5));
        let samples = decompose(&m);
        assert!(!samples
            .iter()
            .any(|s| s.stage == Stage::TimeToFirstReasoningToken));
    }

    #[test]
    fn completion_stage_measures_from_first_output_not_start() {
        let mut m = base_measurement();
        m.first_output_ts = Some(m.start_ts + Duration::from_millis(2));
        m.completion_ts = Some(m.start_ts + Duration::from_millis(8));
        let samples = decompose(&m);
        let completion = samples
            .iter()
            .find(|s| s.stage == Stage::TimeToOutputCompletion)
            .unwrap();
        assert_eq!(completion.value_us, 6_000);
    }
}
