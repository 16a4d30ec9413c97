//! The looping request actor admitted by the Scheduler (§4.6).
//!
//! Each VirtualUser repeats: sample → shape+send (via `Requester`) → submit
//! the `Measurement` to the Aggregator → check cancellation — until the stop
//! signal fires or the task's deadline passes. No pacing between iterations;
//! this is closed-loop load, the same shape as the teacher's `run_worker`
//! minus its own RPS throttling, which now lives one layer up in the
//! Scheduler.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::measurement::Measurement;
use crate::requester::Requester;
use crate::sampler::Sampler;

/// Spawns one VirtualUser. `stagger` offsets the first iteration so users
/// admitted in the same scheduler tick don't all fire their first request in
/// the same instant; it is applied via `sleep_until` off of `Instant::now()`
/// at spawn time, not a relative sleep, so it doesn't drift under load.
pub fn spawn(
    user_id: u32,
    sampler: Sampler,
    requester: std::sync::Arc<Requester>,
    measurements_tx: mpsc::UnboundedSender<Measurement>,
    deadline: Instant,
    stagger: Duration,
    stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run(
        user_id,
        sampler,
        requester,
        measurements_tx,
        deadline,
        stagger,
        stop_rx,
    ))
}

async fn run(
    user_id: u32,
    sampler: Sampler,
    requester: std::sync::Arc<Requester>,
    measurements_tx: mpsc::UnboundedSender<Measurement>,
    deadline: Instant,
    stagger: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let first_fire = Instant::now() + stagger;
    tokio::select! {
        _ = time::sleep_until(first_fire) => {}
        _ = stop_rx.changed() => { return; }
    }

    loop {
        if *stop_rx.borrow() || Instant::now() >= deadline {
            break;
        }

        let record = sampler.next();
        let measurement = requester.execute(&record, user_id, &mut stop_rx).await;

        if measurements_tx.send(measurement).is_err() {
            // Aggregator has shut down; nothing left to report to.
            break;
        }

        if *stop_rx.borrow() || Instant::now() >= deadline {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_pool::PoolStatsTracker;
    use crate::descriptor::{ApiKind, Dataset, TaskDescriptor};
    use crate::payload_shaper::PayloadShaper;
    use std::sync::Arc;

    fn noop_requester() -> Arc<Requester> {
        let field_map = TaskDescriptor::default_field_map(ApiKind::GenericHttp).unwrap();
        let template = TaskDescriptor::default_request_template(ApiKind::GenericHttp).unwrap();
        let shaper = PayloadShaper::new(&field_map, ApiKind::GenericHttp, false);
        let client = reqwest::Client::new();
        let url = reqwest::Url::parse("http://127.0.0.1:1").unwrap();
        Arc::new(
            Requester::new(
                client,
                "POST",
                url,
                reqwest::header::HeaderMap::new(),
                field_map,
                false,
                shaper,
                template,
                Duration::from_millis(50),
                Arc::new(PoolStatsTracker::new(500)),
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn exits_promptly_once_stop_signal_is_raised() {
        let sampler = Sampler::from_dataset(&Dataset::None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(
            1,
            sampler,
            noop_requester(),
            tx.clone(),
            Instant::now() + Duration::from_secs(600),
            Duration::from_millis(0),
            stop_rx,
        );

        // Let at least one iteration start against the unroutable address.
        time::advance(Duration::from_millis(200)).await;
        stop_tx.send(true).unwrap();
        time::advance(Duration::from_secs(1)).await;

        handle.await.unwrap();
        drop(tx);
        // Some number of failed measurements may have been submitted before
        // the stop signal was observed; the point is the task terminates.
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapsing_stops_the_loop_without_a_stop_signal() {
        let sampler = Sampler::from_dataset(&Dataset::None).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(
            1,
            sampler,
            noop_requester(),
            tx,
            Instant::now() + Duration::from_millis(10),
            Duration::from_millis(0),
            stop_rx,
        );

        time::advance(Duration::from_secs(2)).await;
        handle.await.unwrap();
    }
}
