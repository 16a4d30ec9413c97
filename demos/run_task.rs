//! Runs the bundled example `TaskDescriptor` against a target URL and prints
//! the terminal summary. Registered as a cargo example (not under
//! `examples/`, which is reserved) since the binary crate's own `main.rs`
//! is the operator-facing entry point; this is a short illustration of
//! calling `task_runtime::start` directly from library code.
//!
//! Run with a real target:
//! `cargo run --example run_task -- http://127.0.0.1:8080`

use promptload::descriptor::TaskDescriptor;
use promptload::task_runtime;

const BUNDLED_EXAMPLE_DESCRIPTOR: &str = include_str!("../fixtures/example_task.json");

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut descriptor: TaskDescriptor =
        serde_json::from_str(BUNDLED_EXAMPLE_DESCRIPTOR).expect("bundled descriptor is valid json");

    if let Some(target) = std::env::args().nth(1) {
        descriptor.target_base_url = target;
    }
    descriptor.validate().expect("bundled descriptor validates");

    let handle = task_runtime::start(descriptor, Vec::new()).expect("task starts");
    let summary = handle.join().await;

    println!(
        "task {} finished: {} requests, {} failures, {:.1}% success over {:.1}s",
        summary.task_id,
        summary.total_requests,
        summary.total_failures,
        summary.success_rate,
        summary.task_wall_seconds,
    );
    for stage in &summary.stages {
        println!(
            "  {:<24} n={:<6} p50={:.1}ms p90={:.1}ms p95={:.1}ms rps={:.2}",
            stage.metric_type,
            stage.request_count,
            stage.percentile_50,
            stage.percentile_90,
            stage.percentile_95,
            stage.rps,
        );
    }
}
