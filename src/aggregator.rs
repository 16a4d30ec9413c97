//! Single-writer, many-producer metrics fold (§4.8).
//!
//! Every `VirtualUser` holds a clone of the `mpsc::UnboundedSender<Measurement>`
//! returned by `AggregatorHandle::spawn`; there is no shared mutable state
//! outside this actor. When every clone (including the `TaskRuntime`'s own,
//! which it drops once all users are spawned) goes out of scope, the channel
//! closes, `rx.recv()` returns `None`, and the worker emits its terminal
//! summary — the same drop-closes-the-channel shutdown discipline as the
//! teacher's worker pool, generalized from a fixed worker count to per-task
//! dynamic fan-in.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::measurement::{decompose, Measurement, Stage};
use crate::percentiles::PercentileTracker;

/// Cap on distinct `api_path` labels tracked simultaneously, mirroring the
/// percentile tracker's own label-eviction discipline (§4.8 implementation note).
const PATH_LABEL_CAP: usize = 100;
const SINK_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
#[error("sink publish failed: {0}")]
pub struct SinkError(pub String);

/// One point in the append-only realtime stream (§6).
#[derive(Debug, Clone)]
pub struct RealtimePoint {
    pub task_id: String,
    pub timestamp_s: u64,
    pub current_users: u32,
    pub current_rps: f64,
    pub current_fail_per_sec: f64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub success_rate: f64,
}

/// One stage or path-scoped record in the terminal summary (§6).
#[derive(Debug, Clone)]
pub struct StageMetricRecord {
    pub task_id: String,
    pub metric_type: String,
    pub request_count: u64,
    pub failure_count: u64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub percentile_50: f64,
    pub percentile_90: f64,
    pub percentile_95: f64,
    pub rps: f64,
    pub avg_content_length: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TokenMetrics {
    pub total_tps: f64,
    pub completion_tps: f64,
    pub avg_total_tokens_per_req: f64,
    pub avg_completion_tokens_per_req: f64,
    pub estimated_count: u64,
}

#[derive(Debug, Clone)]
pub struct TerminalSummary {
    pub task_id: String,
    pub stages: Vec<StageMetricRecord>,
    pub token_metrics: TokenMetrics,
    pub total_requests: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub task_wall_seconds: f64,
    /// Set when the terminal write itself failed after retries (§7):
    /// the task's own terminal state becomes `stopped-with-sink-degraded`.
    pub sink_degraded: bool,
}

pub trait RealtimeSink: Send + Sync {
    fn publish(&self, point: &RealtimePoint) -> Result<(), SinkError>;
}

pub trait TerminalSink: Send + Sync {
    fn publish(&self, summary: &TerminalSummary) -> Result<(), SinkError>;
}

/// Default sink: writes both streams through `tracing`. Never fails.
pub struct LoggingSink;

impl RealtimeSink for LoggingSink {
    fn publish(&self, point: &RealtimePoint) -> Result<(), SinkError> {
        info!(
            task_id = %point.task_id,
            timestamp_s = point.timestamp_s,
            current_users = point.current_users,
            current_rps = point.current_rps,
            current_fail_per_sec = point.current_fail_per_sec,
            avg_response_time_ms = point.avg_response_time_ms,
            p95_response_time_ms = point.p95_response_time_ms,
            success_rate = point.success_rate,
            "realtime point"
        );
        Ok(())
    }
}

impl TerminalSink for LoggingSink {
    fn publish(&self, summary: &TerminalSummary) -> Result<(), SinkError> {
        info!(
            task_id = %summary.task_id,
            total_requests = summary.total_requests,
            total_failures = summary.total_failures,
            success_rate = summary.success_rate,
            task_wall_seconds = summary.task_wall_seconds,
            total_tps = summary.token_metrics.total_tps,
            completion_tps = summary.token_metrics.completion_tps,
            "terminal summary"
        );
        for stage in &summary.stages {
            info!(
                task_id = %summary.task_id,
                metric_type = %stage.metric_type,
                request_count = stage.request_count,
                failure_count = stage.failure_count,
                avg_response_time_ms = stage.avg_response_time_ms,
                p50_ms = stage.percentile_50,
                p90_ms = stage.percentile_90,
                p95_ms = stage.percentile_95,
                rps = stage.rps,
                avg_content_length = stage.avg_content_length,
                "stage summary"
            );
        }
        Ok(())
    }
}

/// Accumulated counters for one stage (or one `api_path` label). Holds its
/// own bounded histogram, registered process-wide so the memory guard can
/// rotate it without the Aggregator knowing it is being watched.
struct StageBucket {
    tracker: Arc<PercentileTracker>,
    count: u64,
    failure_count: u64,
    sum_us: u128,
    min_us: u64,
    max_us: u64,
    content_length_sum: u128,
}

impl StageBucket {
    fn new() -> Self {
        let tracker = Arc::new(PercentileTracker::new());
        register_histogram(&tracker);
        Self {
            tracker,
            count: 0,
            failure_count: 0,
            sum_us: 0,
            min_us: u64::MAX,
            max_us: 0,
            content_length_sum: 0,
        }
    }

    fn record(&mut self, value_us: u64, failed: bool, content_length_bytes: u64) {
        self.tracker.record_us(value_us);
        self.count += 1;
        if failed {
            self.failure_count += 1;
        }
        self.sum_us += u128::from(value_us);
        self.min_us = self.min_us.min(value_us);
        self.max_us = self.max_us.max(value_us);
        self.content_length_sum += u128::from(content_length_bytes);
    }

    fn avg_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_us as f64 / self.count as f64
        }
    }

    fn avg_content_length(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.content_length_sum as f64 / self.count as f64
        }
    }

    fn min_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min_us as f64 / 1000.0
        }
    }

    fn max_ms(&self) -> f64 {
        self.max_us as f64 / 1000.0
    }
}

fn stage_record(
    task_id: &str,
    label: &str,
    bucket: &StageBucket,
    wall_seconds: f64,
) -> StageMetricRecord {
    let stats = bucket.tracker.stats();
    let (p50, p90, p95) = stats
        .map(|s| {
            (
                s.p50 as f64 / 1000.0,
                s.p90 as f64 / 1000.0,
                s.p95 as f64 / 1000.0,
            )
        })
        .unwrap_or((0.0, 0.0, 0.0));

    StageMetricRecord {
        task_id: task_id.to_string(),
        metric_type: label.to_string(),
        request_count: bucket.count,
        failure_count: bucket.failure_count,
        avg_response_time_ms: bucket.avg_us() / 1000.0,
        min_response_time_ms: bucket.min_ms(),
        max_response_time_ms: bucket.max_ms(),
        percentile_50: p50,
        percentile_90: p90,
        percentile_95: p95,
        rps: if wall_seconds > 0.0 {
            bucket.count as f64 / wall_seconds
        } else {
            0.0
        },
        avg_content_length: bucket.avg_content_length(),
    }
}

/// Per-`api_path` buckets, LRU-capped the same way the teacher's
/// `MultiLabelPercentileTracker` bounds per-endpoint label cardinality.
struct PathBuckets {
    buckets: Mutex<LruCache<String, StageBucket>>,
    warned: Mutex<bool>,
}

impl PathBuckets {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(LruCache::new(NonZeroUsize::new(PATH_LABEL_CAP).unwrap())),
            warned: Mutex::new(false),
        }
    }

    fn record(&self, path: &str, value_us: u64, failed: bool, content_length_bytes: u64) {
        let mut buckets = self.buckets.lock().unwrap();
        if !buckets.contains(path) {
            let size = buckets.len();
            if size >= PATH_LABEL_CAP * 8 / 10 {
                let mut warned = self.warned.lock().unwrap();
                if !*warned {
                    warn!(
                        current_labels = size,
                        max_labels = PATH_LABEL_CAP,
                        "approaching api_path label cardinality limit; least-recently-used paths will be evicted"
                    );
                    *warned = true;
                }
            }
            buckets.put(path.to_string(), StageBucket::new());
        }
        if let Some(bucket) = buckets.get_mut(path) {
            bucket.record(value_us, failed, content_length_bytes);
        }
    }

    fn records(&self, task_id: &str, wall_seconds: f64) -> Vec<StageMetricRecord> {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .iter()
            .map(|(path, bucket)| {
                stage_record(task_id, &format!("path:{path}"), bucket, wall_seconds)
            })
            .collect()
    }
}

/// 1-second buckets over the last 60 s, used to derive `current_rps` /
/// `current_fail_per_sec` (§4.8).
struct RateWindow {
    buckets: VecDeque<(u64, u64, u64)>,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            buckets: VecDeque::new(),
        }
    }

    fn record(&mut self, ts: u64, failed: bool) {
        if let Some(back) = self.buckets.back_mut() {
            if back.0 == ts {
                back.1 += 1;
                back.2 += u64::from(failed);
                self.prune(ts);
                return;
            }
        }
        self.buckets.push_back((ts, 1, u64::from(failed)));
        self.prune(ts);
    }

    fn prune(&mut self, now: u64) {
        while let Some(&(ts, _, _)) = self.buckets.front() {
            if now.saturating_sub(ts) >= 60 {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// The most recently completed whole second's counts.
    fn last_second(&self, now: u64) -> (u64, u64) {
        let target = now.saturating_sub(1);
        self.buckets
            .iter()
            .find(|(ts, _, _)| *ts == target)
            .map(|(_, c, f)| (*c, *f))
            .unwrap_or((0, 0))
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct AggregatorState {
    task_id: String,
    current_users: Arc<AtomicU32>,
    first_sample_ts: Option<Instant>,
    last_sample_ts: Option<Instant>,
    reasoning: StageBucket,
    first_output: StageBucket,
    output_completion: StageBucket,
    total_time: StageBucket,
    failure: StageBucket,
    paths: PathBuckets,
    rate: RateWindow,
    prompt_tokens_sum: u64,
    completion_tokens_sum: u64,
    total_tokens_sum: u64,
    token_sample_count: u64,
    estimated_token_count: u64,
}

impl AggregatorState {
    fn new(task_id: String, current_users: Arc<AtomicU32>) -> Self {
        Self {
            task_id,
            current_users,
            first_sample_ts: None,
            last_sample_ts: None,
            reasoning: StageBucket::new(),
            first_output: StageBucket::new(),
            output_completion: StageBucket::new(),
            total_time: StageBucket::new(),
            failure: StageBucket::new(),
            paths: PathBuckets::new(),
            rate: RateWindow::new(),
            prompt_tokens_sum: 0,
            completion_tokens_sum: 0,
            total_tokens_sum: 0,
            token_sample_count: 0,
            estimated_token_count: 0,
        }
    }

    fn fold(&mut self, m: Measurement) {
        if self.first_sample_ts.is_none() {
            self.first_sample_ts = Some(m.start_ts);
        }
        self.last_sample_ts = Some(m.end_ts);

        let failed = m.outcome.is_failure();
        self.rate.record(epoch_seconds(), failed);

        if m.prompt_tokens.is_some() || m.completion_tokens.is_some() || m.total_tokens.is_some() {
            self.token_sample_count += 1;
            self.prompt_tokens_sum += m.prompt_tokens.unwrap_or(0);
            self.completion_tokens_sum += m.completion_tokens.unwrap_or(0);
            self.total_tokens_sum += m.total_tokens.unwrap_or(0);
            if m.tokens_estimated {
                self.estimated_token_count += 1;
            }
        }

        for sample in decompose(&m) {
            match sample.stage {
                Stage::TimeToFirstReasoningToken => self.reasoning.record(
                    sample.value_us,
                    failed,
                    sample.content_length_bytes,
                ),
                Stage::TimeToFirstOutputToken => self.first_output.record(
                    sample.value_us,
                    failed,
                    sample.content_length_bytes,
                ),
                Stage::TimeToOutputCompletion => self.output_completion.record(
                    sample.value_us,
                    failed,
                    sample.content_length_bytes,
                ),
                Stage::TotalTime => {
                    self.total_time
                        .record(sample.value_us, failed, sample.content_length_bytes)
                }
                Stage::Failure => {
                    self.failure
                        .record(sample.value_us, failed, sample.content_length_bytes)
                }
                Stage::Path => {
                    if let Some(path) = sample.key {
                        self.paths.record(
                            &path,
                            sample.value_us,
                            failed,
                            sample.content_length_bytes,
                        );
                    }
                }
            }
        }
    }

    fn task_wall_seconds(&self) -> f64 {
        match (self.first_sample_ts, self.last_sample_ts) {
            (Some(first), Some(last)) => last.saturating_duration_since(first).as_secs_f64(),
            _ => 0.0,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_time.count == 0 {
            return 100.0;
        }
        ((self.total_time.count - self.failure.count) as f64 / self.total_time.count as f64)
            * 100.0
    }

    fn realtime_point(&self) -> RealtimePoint {
        let now = epoch_seconds();
        let (current_rps, current_fail_per_sec) = {
            let (c, f) = self.rate.last_second(now);
            (c as f64, f as f64)
        };
        let p95_response_time_ms = self
            .total_time
            .tracker
            .stats()
            .map(|s| s.p95 as f64 / 1000.0)
            .unwrap_or(0.0);
        RealtimePoint {
            task_id: self.task_id.clone(),
            timestamp_s: now,
            current_users: self.current_users.load(Ordering::Relaxed),
            current_rps,
            current_fail_per_sec,
            avg_response_time_ms: self.total_time.avg_us() / 1000.0,
            p95_response_time_ms,
            success_rate: self.success_rate(),
        }
    }

    fn terminal_summary(&self) -> TerminalSummary {
        let wall = self.task_wall_seconds();
        let mut stages = vec![
            stage_record(
                &self.task_id,
                Stage::TimeToFirstReasoningToken.label(),
                &self.reasoning,
                wall,
            ),
            stage_record(
                &self.task_id,
                Stage::TimeToFirstOutputToken.label(),
                &self.first_output,
                wall,
            ),
            stage_record(
                &self.task_id,
                Stage::TimeToOutputCompletion.label(),
                &self.output_completion,
                wall,
            ),
            stage_record(&self.task_id, Stage::TotalTime.label(), &self.total_time, wall),
            stage_record(&self.task_id, Stage::Failure.label(), &self.failure, wall),
        ];
        stages.extend(self.paths.records(&self.task_id, wall));

        let token_metrics = TokenMetrics {
            total_tps: if wall > 0.0 {
                self.total_tokens_sum as f64 / wall
            } else {
                0.0
            },
            completion_tps: if wall > 0.0 {
                self.completion_tokens_sum as f64 / wall
            } else {
                0.0
            },
            avg_total_tokens_per_req: if self.token_sample_count > 0 {
                self.total_tokens_sum as f64 / self.token_sample_count as f64
            } else {
                0.0
            },
            avg_completion_tokens_per_req: if self.token_sample_count > 0 {
                self.completion_tokens_sum as f64 / self.token_sample_count as f64
            } else {
                0.0
            },
            estimated_count: self.estimated_token_count,
        };

        TerminalSummary {
            task_id: self.task_id.clone(),
            stages,
            token_metrics,
            total_requests: self.total_time.count,
            total_failures: self.failure.count,
            success_rate: self.success_rate(),
            task_wall_seconds: wall,
            sink_degraded: false,
        }
    }
}

async fn publish_realtime_with_retry(sinks: &[Arc<dyn RealtimeSink>], point: &RealtimePoint) {
    for sink in sinks {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match sink.publish(point) {
                Ok(()) => break,
                Err(e) => {
                    warn!(attempt, error = %e, "realtime sink publish failed");
                    if attempt >= SINK_MAX_ATTEMPTS {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
                }
            }
        }
    }
}

async fn publish_terminal_with_retry(
    sinks: &[Arc<dyn TerminalSink>],
    summary: &TerminalSummary,
) -> bool {
    let mut all_ok = true;
    for sink in sinks {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match sink.publish(summary) {
                Ok(()) => break,
                Err(e) => {
                    warn!(attempt, error = %e, "terminal sink publish failed");
                    if attempt >= SINK_MAX_ATTEMPTS {
                        all_ok = false;
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
                }
            }
        }
    }
    all_ok
}

async fn run(
    task_id: String,
    current_users: Arc<AtomicU32>,
    realtime_interval: Duration,
    realtime_sinks: Vec<Arc<dyn RealtimeSink>>,
    terminal_sinks: Vec<Arc<dyn TerminalSink>>,
    mut rx: mpsc::UnboundedReceiver<Measurement>,
) -> TerminalSummary {
    let mut state = AggregatorState::new(task_id, current_users);
    let mut ticker = tokio::time::interval(realtime_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            maybe = rx.recv() => {
                match maybe {
                    Some(m) => state.fold(m),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let point = state.realtime_point();
                publish_realtime_with_retry(&realtime_sinks, &point).await;
            }
        }
    }

    while let Ok(m) = rx.try_recv() {
        state.fold(m);
    }

    let mut summary = state.terminal_summary();
    let all_ok = publish_terminal_with_retry(&terminal_sinks, &summary).await;
    summary.sink_degraded = !all_ok;
    summary
}

/// Spawns the aggregator worker; returns the producer handle and a join
/// handle resolving to the terminal summary once every producer clone has
/// been dropped.
pub fn spawn(
    task_id: String,
    current_users: Arc<AtomicU32>,
    realtime_interval: Duration,
    realtime_sinks: Vec<Arc<dyn RealtimeSink>>,
    terminal_sinks: Vec<Arc<dyn TerminalSink>>,
) -> (
    mpsc::UnboundedSender<Measurement>,
    JoinHandle<TerminalSummary>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(
        task_id,
        current_users,
        realtime_interval,
        realtime_sinks,
        terminal_sinks,
        rx,
    ));
    (tx, handle)
}

// Process-wide registry of every currently-live task's percentile
// histograms, so the memory guard can rotate them without the Aggregator
// exposing any global state of its own.
lazy_static::lazy_static! {
    static ref ACTIVE_TASK_HISTOGRAMS: Mutex<Vec<Weak<PercentileTracker>>> = Mutex::new(Vec::new());
}

fn register_histogram(tracker: &Arc<PercentileTracker>) {
    ACTIVE_TASK_HISTOGRAMS
        .lock()
        .unwrap()
        .push(Arc::downgrade(tracker));
}

/// Clears every currently-live task's percentile histograms. Called by the
/// memory guard when resident memory crosses its warning threshold.
pub fn rotate_all_histograms() {
    let mut registry = ACTIVE_TASK_HISTOGRAMS.lock().unwrap();
    registry.retain(|weak| {
        if let Some(tracker) = weak.upgrade() {
            tracker.reset();
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Outcome;
    use std::time::Instant;

    fn ok_measurement(api_path: &str) -> Measurement {
        let start = Instant::now();
        Measurement {
            user_id: 1,
            api_path: api_path.to_string(),
            start_ts: start,
            first_reasoning_ts: None,
            first_output_ts: Some(start + Duration::from_millis(5)),
            completion_ts: Some(start + Duration::from_millis(20)),
            end_ts: start + Duration::from_millis(25),
            http_status: Some(200),
            outcome: Outcome::Ok,
            prompt_tokens: Some(10),
            completion_tokens: Some(20),
            total_tokens: Some(30),
            tokens_estimated: false,
            content_length_bytes: 40,
            diagnostic: None,
        }
    }

    fn failed_measurement(api_path: &str) -> Measurement {
        let start = Instant::now();
        Measurement {
            user_id: 2,
            api_path: api_path.to_string(),
            start_ts: start,
            first_reasoning_ts: None,
            first_output_ts: None,
            completion_ts: None,
            end_ts: start + Duration::from_millis(5),
            http_status: Some(500),
            outcome: Outcome::HttpError,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            tokens_estimated: false,
            content_length_bytes: 0,
            diagnostic: Some("server error".to_string()),
        }
    }

    #[test]
    fn folding_tracks_counts_and_success_rate() {
        let mut state = AggregatorState::new("t1".to_string(), Arc::new(AtomicU32::new(0)));
        state.fold(ok_measurement("/v1/chat/completions"));
        state.fold(ok_measurement("/v1/chat/completions"));
        state.fold(failed_measurement("/v1/chat/completions"));

        assert_eq!(state.total_time.count, 3);
        assert_eq!(state.failure.count, 1);
        let rate = state.success_rate();
        assert!((rate - 66.666_666_666_666_67).abs() < 0.001);
    }

    /// §3/§6: every realtime tick carries `avg_response_time_ms` and
    /// `p95_response_time_ms` derived from the total-time bucket.
    #[test]
    fn realtime_point_carries_response_time_fields() {
        let mut state = AggregatorState::new("t1".to_string(), Arc::new(AtomicU32::new(0)));
        state.fold(ok_measurement("/v1/chat/completions"));
        state.fold(ok_measurement("/v1/chat/completions"));

        let point = state.realtime_point();
        assert!(point.avg_response_time_ms > 0.0);
        assert!(point.p95_response_time_ms > 0.0);
    }

    #[test]
    fn path_buckets_are_keyed_by_api_path() {
        let mut state = AggregatorState::new("t1".to_string(), Arc::new(AtomicU32::new(0)));
        state.fold(ok_measurement("/v1/chat/completions"));
        state.fold(ok_measurement("/v1/embeddings"));

        let summary = state.terminal_summary();
        let path_labels: Vec<_> = summary
            .stages
            .iter()
            .filter(|s| s.metric_type.starts_with("path:"))
            .map(|s| s.metric_type.clone())
            .collect();
        assert!(path_labels.contains(&"path:/v1/chat/completions".to_string()));
        assert!(path_labels.contains(&"path:/v1/embeddings".to_string()));
    }

    #[test]
    fn token_metrics_average_over_samples_carrying_tokens() {
        let mut state = AggregatorState::new("t1".to_string(), Arc::new(AtomicU32::new(0)));
        state.fold(ok_measurement("/v1/chat/completions"));
        state.fold(ok_measurement("/v1/chat/completions"));

        let summary = state.terminal_summary();
        assert_eq!(summary.token_metrics.avg_total_tokens_per_req, 30.0);
        assert_eq!(summary.token_metrics.avg_completion_tokens_per_req, 20.0);
        assert_eq!(summary.token_metrics.estimated_count, 0);
    }

    #[test]
    fn failure_stage_count_matches_non_ok_outcomes() {
        let mut state = AggregatorState::new("t1".to_string(), Arc::new(AtomicU32::new(0)));
        for _ in 0..3 {
            state.fold(ok_measurement("/x"));
        }
        for _ in 0..1 {
            state.fold(failed_measurement("/x"));
        }
        assert_eq!(state.failure.count, 1);
        assert_eq!(state.total_time.count, 4);
    }

    #[tokio::test]
    async fn actor_closes_and_returns_terminal_summary_when_senders_drop() {
        let (tx, handle) = spawn(
            "t1".to_string(),
            Arc::new(AtomicU32::new(0)),
            Duration::from_secs(3600),
            vec![Arc::new(LoggingSink)],
            vec![Arc::new(LoggingSink)],
        );

        tx.send(ok_measurement("/v1/chat/completions")).unwrap();
        tx.send(ok_measurement("/v1/chat/completions")).unwrap();
        drop(tx);

        let summary = handle.await.unwrap();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.total_failures, 0);
        assert!(!summary.sink_degraded);
    }

    #[test]
    fn rotate_all_histograms_resets_registered_trackers() {
        let bucket = StageBucket::new();
        bucket.tracker.record_ms(100);
        assert!(bucket.tracker.stats().is_some());

        rotate_all_histograms();

        assert!(bucket.tracker.stats().is_none());
    }
}
