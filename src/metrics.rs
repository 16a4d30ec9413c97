//! Ambient, cross-task process metrics (§10.3), exposed in Prometheus
//! exposition format over a small `hyper` HTTP server. Distinct from the
//! per-task realtime/terminal sinks in `src/aggregator.rs`, which are the
//! engine's primary externally-specified output (§6).
//!
//! Grounded on the teacher's `src/metrics.rs`: the same `lazy_static`
//! namespaced-metric + `hyper::Server` shape, with the scenario-DSL metrics
//! dropped and request/stage/error-category counters generalized across
//! tasks instead of scoped to one scenario run.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::errors::ErrorCategory;
use crate::measurement::{Outcome, Stage};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "promptload".to_string());

    /// Users currently admitted and running, summed across every live task.
    pub static ref CONCURRENT_USERS: Gauge =
        Gauge::with_opts(
            Opts::new("concurrent_users", "Users currently active across all tasks")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    /// One count per completed Measurement, labeled by stage and outcome —
    /// the process-wide analogue of the Aggregator's per-task stage buckets.
    pub static ref MEASUREMENTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("measurements_total", "Completed measurements by stage and outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["stage", "outcome"],
        ).unwrap();

    /// Transport/HTTP errors by the shared `ErrorCategory` taxonomy (§10.2),
    /// independent of the per-task `ok`/`failure` distinction.
    pub static ref ERRORS_BY_CATEGORY_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("errors_by_category_total", "Transport/HTTP errors by category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"],
        ).unwrap();

    /// Connection-pool behavior inferred via `connection_pool::PoolStatsTracker`'s
    /// latency-threshold heuristic — diagnostic, not authoritative (§10.3).
    pub static ref POOL_LIKELY_REUSED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new(
                "pool_connection_likely_reused_total",
                "Requests classified by a latency heuristic as reusing a pooled connection \
                 (label=true) or paying a fresh handshake (label=false); diagnostic only",
            ).namespace(METRIC_NAMESPACE.as_str()),
            &["reused"],
        ).unwrap();
}

/// Registers every metric above with the given registry. Call once per
/// process (or once per test, with a fresh `Registry::new()` — prometheus
/// rejects re-registering the same collector against the same registry).
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(CONCURRENT_USERS.clone()))?;
    registry.register(Box::new(MEASUREMENTS_TOTAL.clone()))?;
    registry.register(Box::new(ERRORS_BY_CATEGORY_TOTAL.clone()))?;
    registry.register(Box::new(POOL_LIKELY_REUSED_TOTAL.clone()))?;
    Ok(())
}

/// Records one completed Measurement's outcome against the process-wide
/// counters (an optional cross-task view alongside the per-task Aggregator;
/// never load-bearing for task correctness).
pub fn record_outcome(stage: Stage, outcome: Outcome) {
    MEASUREMENTS_TOTAL
        .with_label_values(&[stage.label(), outcome.label()])
        .inc();
}

pub fn record_error(category: ErrorCategory) {
    ERRORS_BY_CATEGORY_TOTAL
        .with_label_values(&[category.label()])
        .inc();
}

pub fn record_pool_sample(likely_reused: bool) {
    POOL_LIKELY_REUSED_TOTAL
        .with_label_values(&[if likely_reused { "true" } else { "false" }])
        .inc();
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the ambient Prometheus metrics HTTP server (§10.3/§6 "process
/// metrics endpoint").
pub async fn start_metrics_server(bind_addr: &str, port: u16, registry: Arc<Mutex<Registry>>) {
    let ip: std::net::IpAddr = bind_addr
        .parse()
        .unwrap_or_else(|_| std::net::Ipv4Addr::UNSPECIFIED.into());
    let addr = (ip, port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port = port, addr = %addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

/// Gathers and encodes metrics as a string, used by the demo binary to print
/// a final snapshot alongside the terminal summary.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        eprintln!("error encoding metrics to UTF-8: {e}");
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}
