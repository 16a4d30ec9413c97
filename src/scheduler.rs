//! User-count ramp admission and lifecycle control (§4.7).
//!
//! Generalizes the teacher's RPS-targeting `sleep_until` ramp (see
//! `worker.rs`) from a requests-per-second axis to a user-count axis: the
//! Scheduler admits `VirtualUser`s on a fixed absolute-time cadence instead
//! of firing individual requests itself.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::info;

use crate::descriptor::LoadProfile;

/// `created → ramping → running → stopping → stopped | failed` (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Ramping,
    Running,
    Stopping,
    Stopped,
    StoppedWithSinkDegraded,
    Failed,
}

/// Callback invoked once per admitted user; returns the `JoinHandle` of the
/// spawned `VirtualUser` loop so the Scheduler can wait for it during drain.
pub trait UserAdmitter: Send + Sync {
    fn admit(&self, user_id: u32, stop_rx: watch::Receiver<bool>) -> JoinHandle<()>;
}

impl<F> UserAdmitter for F
where
    F: Fn(u32, watch::Receiver<bool>) -> JoinHandle<()> + Send + Sync,
{
    fn admit(&self, user_id: u32, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        self(user_id, stop_rx)
    }
}

pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Idempotent: raises the cancellation signal. Subsequent calls are no-ops
    /// since `watch::Sender::send` on an already-true value is harmless.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn join(self) {
        let _ = self.join_handle.await;
    }
}

/// Spawns the Scheduler's own task. `grace` bounds how long it waits for
/// in-flight users to drain after the stop signal is raised (default:
/// request read timeout + 5s, computed by the caller).
pub fn spawn(
    profile: LoadProfile,
    current_users: Arc<AtomicU32>,
    grace: Duration,
    admitter: Arc<dyn UserAdmitter>,
) -> SchedulerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx_for_run = stop_tx.clone();
    let join_handle = tokio::spawn(run(profile, current_users, grace, admitter, stop_rx, stop_tx_for_run));
    SchedulerHandle {
        stop_tx,
        join_handle,
    }
}

async fn run(
    profile: LoadProfile,
    current_users: Arc<AtomicU32>,
    grace: Duration,
    admitter: Arc<dyn UserAdmitter>,
    mut stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
) {
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let start = Instant::now();

    match profile {
        LoadProfile::Fixed {
            users,
            duration_s,
            spawn_per_s,
        } => {
            let mut admitted = 0u32;
            let mut next_tick = Instant::now();
            while admitted < users {
                tokio::select! {
                    _ = time::sleep_until(next_tick) => {
                        let batch = spawn_per_s.min(users - admitted);
                        for i in 0..batch {
                            admit_one(&current_users, &admitter, &stop_tx, &mut handles, admitted + i);
                        }
                        admitted += batch;
                        next_tick += Duration::from_secs(1);
                    }
                    _ = stop_rx.changed() => {
                        break;
                    }
                }
            }

            info!(users = admitted, "ramp-up complete, holding for task duration");
            let deadline = start + Duration::from_secs(duration_s);
            wait_for_deadline_or_stop(deadline, &mut stop_rx).await;
        }
        LoadProfile::Stepped {
            start_users,
            step_increment,
            step_duration_s,
            sustain_duration_s,
            max_users,
        } => {
            let mut admitted = 0u32;
            let first_batch = start_users.min(max_users);
            for i in 0..first_batch {
                admit_one(&current_users, &admitter, &stop_tx, &mut handles, i);
            }
            admitted = first_batch;

            let mut next_step = Instant::now() + Duration::from_secs(step_duration_s);
            while admitted < max_users {
                tokio::select! {
                    _ = time::sleep_until(next_step) => {
                        let batch = step_increment.min(max_users - admitted);
                        for i in 0..batch {
                            admit_one(&current_users, &admitter, &stop_tx, &mut handles, admitted + i);
                        }
                        admitted += batch;
                        next_step += Duration::from_secs(step_duration_s);
                    }
                    _ = stop_rx.changed() => {
                        break;
                    }
                }
            }

            info!(users = admitted, "ramp complete, holding for sustain window");
            let deadline = Instant::now() + Duration::from_secs(sustain_duration_s);
            wait_for_deadline_or_stop(deadline, &mut stop_rx).await;
        }
    }

    let _ = stop_tx.send(true);
    info!(active_users = handles.len(), "stop signal raised, draining in-flight users");

    let drain = futures_join_all(handles);
    if time::timeout(grace, drain).await.is_err() {
        tracing::warn!(grace_s = grace.as_secs(), "drain grace window elapsed with users still in flight");
    }
}

fn admit_one(
    current_users: &Arc<AtomicU32>,
    admitter: &Arc<dyn UserAdmitter>,
    stop_tx: &watch::Sender<bool>,
    handles: &mut Vec<JoinHandle<()>>,
    user_id: u32,
) {
    current_users.fetch_add(1, Ordering::Relaxed);
    handles.push(admitter.admit(user_id, stop_tx.subscribe()));
}

async fn wait_for_deadline_or_stop(deadline: Instant, stop_rx: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = time::sleep_until(deadline) => {}
        _ = stop_rx.changed() => {}
    }
}

async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn noop_admitter() -> Arc<dyn UserAdmitter> {
        Arc::new(|_user_id: u32, mut stop_rx: watch::Receiver<bool>| {
            tokio::spawn(async move {
                let _ = stop_rx.changed().await;
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_profile_admits_users_up_to_the_configured_count() {
        let current_users = Arc::new(AtomicU32::new(0));
        let profile = LoadProfile::Fixed {
            users: 4,
            duration_s: 2,
            spawn_per_s: 2,
        };

        let handle = spawn(
            profile,
            current_users.clone(),
            Duration::from_secs(5),
            noop_admitter(),
        );

        time::advance(Duration::from_secs(5)).await;
        handle.stop();
        handle.join().await;

        assert_eq!(current_users.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stepped_profile_admits_start_users_immediately() {
        let current_users = Arc::new(AtomicU32::new(0));
        let profile = LoadProfile::Stepped {
            start_users: 2,
            step_increment: 1,
            step_duration_s: 1,
            sustain_duration_s: 1,
            max_users: 3,
        };

        let handle = spawn(
            profile,
            current_users.clone(),
            Duration::from_secs(5),
            noop_admitter(),
        );

        time::advance(Duration::from_millis(10)).await;
        assert!(current_users.load(Ordering::Relaxed) >= 2);

        time::advance(Duration::from_secs(5)).await;
        handle.stop();
        handle.join().await;

        assert_eq!(current_users.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let current_users = Arc::new(AtomicU32::new(0));
        let profile = LoadProfile::Fixed {
            users: 1,
            duration_s: 1,
            spawn_per_s: 1,
        };

        let handle = spawn(
            profile,
            current_users,
            Duration::from_millis(200),
            noop_admitter(),
        );

        handle.stop();
        handle.stop();
        handle.join().await;
    }

    #[allow(dead_code)]
    fn _unused(_: Mutex<()>) {}
}
