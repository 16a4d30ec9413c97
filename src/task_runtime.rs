//! Owns one task end to end (§4.9): validates the descriptor, builds every
//! per-task component, wires the Scheduler's admission callback to
//! `virtual_user::spawn`, and exposes `start`/`stop`/`join`/`metrics_stream`.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::aggregator::{self, RealtimePoint, RealtimeSink, TerminalSink, TerminalSummary};
use crate::client::{self, ClientBuildError};
use crate::descriptor::{DescriptorError, TaskDescriptor};
use crate::payload_shaper::PayloadShaper;
use crate::requester::{Requester, RequesterBuildError};
use crate::sampler::{DataSourceError, Sampler};
use crate::scheduler::{self, TaskState, UserAdmitter};

#[derive(Debug, Error)]
pub enum TaskStartError {
    #[error("descriptor invalid: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("dataset could not be prepared: {0}")]
    Dataset(#[from] DataSourceError),
    #[error("http client could not be built: {0}")]
    Client(#[from] ClientBuildError),
    #[error("request url or method invalid: {0}")]
    Requester(#[from] RequesterBuildError),
}

/// The default realtime publish cadence (§4.8's "fixed real-time tick").
const REALTIME_TICK: Duration = Duration::from_secs(1);
/// Added to the per-request read timeout to get the Scheduler's drain grace
/// window (§5 "Cancellation and timeouts").
const DRAIN_GRACE_MARGIN: Duration = Duration::from_secs(5);

struct AdmitterImpl {
    sampler: Sampler,
    requester: Arc<Requester>,
    measurements_tx: mpsc::UnboundedSender<crate::measurement::Measurement>,
    deadline: Instant,
    spawn_batch_interval: Duration,
}

impl UserAdmitter for AdmitterImpl {
    fn admit(&self, user_id: u32, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        // Stagger within the admission tick so co-admitted users don't all
        // fire their first request in the same instant (§4.6).
        let stagger = self.spawn_batch_interval.mul_f64(fractional_offset(user_id));
        crate::virtual_user::spawn(
            user_id,
            self.sampler.clone(),
            self.requester.clone(),
            self.measurements_tx.clone(),
            self.deadline,
            stagger,
            stop_rx,
        )
    }
}

/// Deterministic pseudo-random-looking spread in `[0, 1)` derived from the
/// user's admission index, so staggering doesn't need its own RNG dependency.
fn fractional_offset(user_id: u32) -> f64 {
    ((user_id as u64).wrapping_mul(2_654_435_761) % 1000) as f64 / 1000.0
}

pub struct TaskHandle {
    task_id: String,
    state: Arc<Mutex<TaskState>>,
    scheduler: scheduler::SchedulerHandle,
    terminal: JoinHandle<TerminalSummary>,
    realtime_log: Arc<RealtimeLog>,
}

/// Minimal in-memory ring the handle reads back for `metrics_stream` polling;
/// sinks remain the system of record, this just lets `await`/`metrics_stream`
/// work without requiring an external sink to be configured.
struct RealtimeLog {
    points: std::sync::Mutex<Vec<RealtimePoint>>,
}

struct RecordingSink {
    log: Arc<RealtimeLog>,
}

impl RealtimeSink for RecordingSink {
    fn publish(&self, point: &RealtimePoint) -> Result<(), aggregator::SinkError> {
        self.log.points.lock().unwrap().push(point.clone());
        Ok(())
    }
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Idempotent; raises the cancellation signal (§4.7/§4.9).
    pub async fn stop(&self) {
        *self.state.lock().await = TaskState::Stopping;
        self.scheduler.stop();
    }

    /// Blocks until the terminal state is reached; returns the summary.
    pub async fn join(self) -> TerminalSummary {
        self.scheduler.join().await;
        let summary = self.terminal.await.unwrap_or_else(|_| TerminalSummary {
            task_id: self.task_id.clone(),
            stages: Vec::new(),
            token_metrics: Default::default(),
            total_requests: 0,
            total_failures: 0,
            success_rate: 100.0,
            task_wall_seconds: 0.0,
            sink_degraded: true,
        });
        let mut state = self.state.lock().await;
        *state = if summary.sink_degraded {
            TaskState::StoppedWithSinkDegraded
        } else {
            TaskState::Stopped
        };
        summary
    }

    /// RealtimePoints with timestamps strictly greater than `since_ts`.
    pub fn metrics_stream(&self, since_ts: u64) -> Vec<RealtimePoint> {
        self.realtime_log
            .points
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.timestamp_s > since_ts)
            .cloned()
            .collect()
    }

    pub async fn state(&self) -> TaskState {
        *self.state.lock().await
    }
}

/// Validates the descriptor, resolves the dataset, builds an HTTP client
/// sized to the profile, and spins up the Scheduler + Aggregator. Returns a
/// handle; request-level failures never surface here, only the runtime
/// failures named in §4.9.
pub fn start(
    descriptor: TaskDescriptor,
    extra_terminal_sinks: Vec<Arc<dyn TerminalSink>>,
) -> Result<TaskHandle, TaskStartError> {
    descriptor.validate()?;

    let sampler = Sampler::from_dataset(&descriptor.dataset)?;

    let duration_upper_bound = descriptor.load_profile.duration_upper_bound_s();
    let connect_timeout = Duration::from_secs(descriptor.timeouts.connect_timeout_s);
    let read_timeout_s = descriptor
        .timeouts
        .resolved_read_timeout_s(duration_upper_bound);
    let read_timeout = Duration::from_secs(read_timeout_s);

    let client = client::build_task_client(&descriptor, connect_timeout)?;

    let field_map = descriptor.field_map.clone();
    let shaper = PayloadShaper::new(&field_map, descriptor.api_kind, descriptor.stream_mode);
    shaper
        .validate_template(&descriptor.request_template)
        .map_err(|e| DescriptorError::MalformedTemplate(e.to_string()))?;

    let url = build_url(&descriptor)?;
    let headers = build_header_map(&descriptor)?;

    let pool_stats = Arc::new(crate::connection_pool::PoolStatsTracker::new(500));

    let requester = Arc::new(Requester::new(
        client,
        &descriptor.http_method,
        url,
        headers,
        field_map,
        descriptor.stream_mode,
        shaper,
        descriptor.request_template.clone(),
        read_timeout,
        pool_stats,
    )?);

    let current_users = Arc::new(AtomicU32::new(0));

    let realtime_log = Arc::new(RealtimeLog {
        points: std::sync::Mutex::new(Vec::new()),
    });
    let mut realtime_sinks: Vec<Arc<dyn RealtimeSink>> = vec![Arc::new(RecordingSink {
        log: realtime_log.clone(),
    })];
    realtime_sinks.push(Arc::new(aggregator::LoggingSink));

    let mut terminal_sinks: Vec<Arc<dyn TerminalSink>> = vec![Arc::new(aggregator::LoggingSink)];
    terminal_sinks.extend(extra_terminal_sinks);

    let (measurements_tx, terminal) = aggregator::spawn(
        descriptor.task_id.clone(),
        current_users.clone(),
        REALTIME_TICK,
        realtime_sinks,
        terminal_sinks,
    );

    let deadline = Instant::now() + Duration::from_secs(duration_upper_bound);
    let spawn_batch_interval = match &descriptor.load_profile {
        crate::descriptor::LoadProfile::Fixed { spawn_per_s, .. } => {
            Duration::from_secs(1) / (*spawn_per_s).max(1)
        }
        crate::descriptor::LoadProfile::Stepped { .. } => Duration::from_millis(200),
    };

    let admitter: Arc<dyn UserAdmitter> = Arc::new(AdmitterImpl {
        sampler,
        requester,
        measurements_tx,
        deadline,
        spawn_batch_interval,
    });

    let grace = read_timeout + DRAIN_GRACE_MARGIN;
    let scheduler_handle = scheduler::spawn(
        descriptor.load_profile.clone(),
        current_users,
        grace,
        admitter,
    );

    Ok(TaskHandle {
        task_id: descriptor.task_id,
        state: Arc::new(Mutex::new(TaskState::Ramping)),
        scheduler: scheduler_handle,
        terminal,
        realtime_log,
    })
}

fn build_url(descriptor: &TaskDescriptor) -> Result<reqwest::Url, RequesterBuildError> {
    let base = descriptor.target_base_url.trim_end_matches('/');
    let path = if descriptor.api_path.starts_with('/') {
        descriptor.api_path.clone()
    } else {
        format!("/{}", descriptor.api_path)
    };
    reqwest::Url::parse(&format!("{base}{path}")).map_err(RequesterBuildError::InvalidUrl)
}

fn build_header_map(
    descriptor: &TaskDescriptor,
) -> Result<reqwest::header::HeaderMap, RequesterBuildError> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &descriptor.headers {
        let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RequesterBuildError::InvalidHeader(e.to_string()))?;
        let header_value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| RequesterBuildError::InvalidHeader(e.to_string()))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ApiKind, Dataset, LoadProfile, Timeouts};
    use std::collections::BTreeMap;

    fn descriptor_against(url: &str) -> TaskDescriptor {
        TaskDescriptor {
            task_id: "t-1".to_string(),
            name: "smoke".to_string(),
            api_kind: ApiKind::GenericHttp,
            target_base_url: url.to_string(),
            api_path: "/echo".to_string(),
            http_method: "POST".to_string(),
            request_template: serde_json::json!({"prompt": ""}),
            headers: vec![],
            cookies: BTreeMap::new(),
            tls_client_identity: None,
            stream_mode: false,
            field_map: crate::descriptor::FieldMap {
                prompt_path: "prompt".to_string(),
                image_path: None,
                line_prefix: "data:".to_string(),
                data_format: crate::descriptor::DataFormat::Json,
                content_path: "content".to_string(),
                reasoning_content_path: None,
                prompt_tokens_path: None,
                completion_tokens_path: None,
                total_tokens_path: None,
                end_line_prefix: None,
                end_field_path: None,
                stop_token: "[DONE]".to_string(),
            },
            dataset: Dataset::None,
            load_profile: LoadProfile::Fixed {
                users: 1,
                duration_s: 1,
                spawn_per_s: 1,
            },
            timeouts: Timeouts::default(),
        }
    }

    #[test]
    fn fractional_offset_stays_within_unit_interval() {
        for id in 0..50 {
            let f = fractional_offset(id);
            assert!((0.0..1.0).contains(&f));
        }
    }

    #[test]
    fn build_url_joins_base_and_path() {
        let descriptor = descriptor_against("http://127.0.0.1:9");
        let url = build_url(&descriptor).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9/echo");
    }

    #[test]
    fn invalid_descriptor_is_rejected_before_any_component_is_built() {
        let mut descriptor = descriptor_against("not-a-url");
        descriptor.target_base_url = "not-a-url".to_string();
        let result = start(descriptor, vec![]);
        assert!(matches!(result, Err(TaskStartError::InvalidDescriptor(_))));
    }

    /// §4.3/§7: a `prompt_path` that doesn't address anything in the
    /// request template fails validation before any user runs, rather than
    /// degrading every request to `outcome=parse_error` at request time.
    #[test]
    fn malformed_prompt_path_is_rejected_before_any_user_runs() {
        let mut descriptor = descriptor_against("http://127.0.0.1:9");
        // "prompt" in the template is a scalar string, so addressing a
        // segment underneath it is not addressable.
        descriptor.field_map.prompt_path = "prompt.nested".to_string();
        let result = start(descriptor, vec![]);
        assert!(matches!(
            result,
            Err(TaskStartError::InvalidDescriptor(
                crate::descriptor::DescriptorError::MalformedTemplate(_)
            ))
        ));
    }

    #[tokio::test]
    async fn start_and_stop_reaches_a_terminal_state() {
        let descriptor = descriptor_against("http://127.0.0.1:9");
        let handle = start(descriptor, vec![]).unwrap();
        handle.stop().await;
        let summary = handle.join().await;
        assert_eq!(summary.task_id, "t-1");
    }
}
