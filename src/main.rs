//! CLI entry point: loads a `TaskDescriptor`, starts the task runtime, and
//! serves the ambient Prometheus metrics endpoint and memory guard alongside
//! it for the task's lifetime (§6/§10.3/§10.4).
//!
//! Usage: `promptload [descriptor.json] [--duration 5m] [--header "K:V,K2:V2"]`
//!
//! With no path given, a small bundled example descriptor runs against
//! `http://127.0.0.1:8080` so the binary has something to demonstrate out of
//! the box.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use mimalloc::MiMalloc;
use prometheus::Registry;
use tracing::{error, info, warn};

use promptload::config::EngineConfig;
use promptload::descriptor::{LoadProfile, TaskDescriptor};
use promptload::scheduler::TaskState;
use promptload::utils::{parse_duration_string, parse_headers_with_escapes};
use promptload::{memory_guard, metrics, task_runtime};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const BUNDLED_EXAMPLE_DESCRIPTOR: &str = include_str!("../fixtures/example_task.json");

struct Cli {
    descriptor_path: Option<String>,
    duration_override: Option<StdDuration>,
    extra_headers: Vec<(String, String)>,
}

fn parse_cli(mut args: impl Iterator<Item = String>) -> Result<Cli, String> {
    let mut cli = Cli {
        descriptor_path: None,
        duration_override: None,
        extra_headers: Vec::new(),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--duration" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--duration requires a value".to_string())?;
                cli.duration_override = Some(parse_duration_string(&value)?);
            }
            "--header" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--header requires a value".to_string())?;
                for entry in parse_headers_with_escapes(&value) {
                    let (name, header_value) = entry
                        .split_once(':')
                        .ok_or_else(|| format!("malformed header '{entry}', expected NAME:VALUE"))?;
                    cli.extra_headers
                        .push((name.trim().to_string(), header_value.trim().to_string()));
                }
            }
            other if cli.descriptor_path.is_none() => {
                cli.descriptor_path = Some(other.to_string());
            }
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    Ok(cli)
}

fn load_descriptor(cli: &Cli) -> Result<TaskDescriptor, String> {
    let raw = match &cli.descriptor_path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read descriptor file '{path}': {e}"))?,
        None => {
            info!("no descriptor path given, running the bundled example task");
            BUNDLED_EXAMPLE_DESCRIPTOR.to_string()
        }
    };

    let mut descriptor: TaskDescriptor =
        serde_json::from_str(&raw).map_err(|e| format!("descriptor is not valid JSON: {e}"))?;

    if let Some(duration) = cli.duration_override {
        descriptor.load_profile = match descriptor.load_profile {
            LoadProfile::Fixed {
                users, spawn_per_s, ..
            } => LoadProfile::Fixed {
                users,
                spawn_per_s,
                duration_s: duration.as_secs(),
            },
            other @ LoadProfile::Stepped { .. } => {
                warn!("--duration only applies to fixed load profiles, ignoring override");
                other
            }
        };
    }

    descriptor.headers.extend(cli.extra_headers.iter().cloned());

    descriptor
        .validate()
        .map_err(|e| format!("descriptor failed validation: {e}"))?;

    Ok(descriptor)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid process configuration");
            std::process::exit(1);
        }
    };

    let cli = match parse_cli(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            error!(error = %e, "invalid command line arguments");
            std::process::exit(1);
        }
    };

    let descriptor = match load_descriptor(&cli) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            error!(error = %e, "could not load task descriptor");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(Mutex::new(Registry::new()));
    if let Err(e) = metrics::register_metrics(&registry.lock().unwrap()) {
        error!(error = %e, "failed to register process metrics");
        std::process::exit(1);
    }

    let metrics_bind_addr = config.metrics_bind_addr.clone();
    let metrics_port = config.metrics_port;
    let metrics_registry = registry.clone();
    tokio::spawn(async move {
        metrics::start_metrics_server(&metrics_bind_addr, metrics_port, metrics_registry).await;
    });
    tokio::spawn(memory_guard::spawn_memory_guard(config.memory_guard.clone()));

    info!(task_id = %descriptor.task_id, name = %descriptor.name, "starting task");

    let handle = match task_runtime::start(descriptor, Vec::new()) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start task");
            std::process::exit(1);
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, stopping task early");
                handle.stop().await;
                break;
            }
            _ = tokio::time::sleep(StdDuration::from_millis(500)) => {
                if matches!(
                    handle.state().await,
                    TaskState::Stopped | TaskState::StoppedWithSinkDegraded | TaskState::Failed
                ) {
                    break;
                }
            }
        }
    }

    let summary = handle.join().await;

    info!(
        task_id = %summary.task_id,
        total_requests = summary.total_requests,
        total_failures = summary.total_failures,
        success_rate = summary.success_rate,
        wall_seconds = summary.task_wall_seconds,
        sink_degraded = summary.sink_degraded,
        "task finished"
    );
    for stage in &summary.stages {
        info!(
            metric_type = %stage.metric_type,
            requests = stage.request_count,
            failures = stage.failure_count,
            p50_ms = stage.percentile_50,
            p90_ms = stage.percentile_90,
            p95_ms = stage.percentile_95,
            rps = stage.rps,
            "stage summary"
        );
    }

    println!("{}", metrics::gather_metrics_string(&registry));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_example_descriptor_parses_and_validates() {
        let descriptor: TaskDescriptor =
            serde_json::from_str(BUNDLED_EXAMPLE_DESCRIPTOR).expect("valid json");
        descriptor.validate().expect("valid descriptor");
    }

    #[test]
    fn cli_parses_duration_and_header_flags() {
        let args = vec![
            "descriptor.json".to_string(),
            "--duration".to_string(),
            "5m".to_string(),
            "--header".to_string(),
            "X-Trace:abc\\,def".to_string(),
        ];
        let cli = parse_cli(args.into_iter()).unwrap();
        assert_eq!(cli.descriptor_path.as_deref(), Some("descriptor.json"));
        assert_eq!(cli.duration_override, Some(StdDuration::from_secs(300)));
        assert_eq!(
            cli.extra_headers,
            vec![("X-Trace".to_string(), "abc,def".to_string())]
        );
    }

    #[test]
    fn cli_rejects_duration_without_value() {
        let args = vec!["--duration".to_string()];
        assert!(parse_cli(args.into_iter()).is_err());
    }

    #[test]
    fn load_descriptor_overrides_fixed_duration() {
        let cli = Cli {
            descriptor_path: None,
            duration_override: Some(StdDuration::from_secs(42)),
            extra_headers: vec![],
        };
        let descriptor = load_descriptor(&cli).unwrap();
        match descriptor.load_profile {
            LoadProfile::Fixed { duration_s, .. } => assert_eq!(duration_s, 42),
            LoadProfile::Stepped { .. } => panic!("expected fixed profile"),
        }
    }
}
