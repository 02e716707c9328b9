/// Quota scheduler: a recurring background tick that force-stops runs whose
/// tier expiry has passed.
///
/// The tick is idempotent against concurrent manual stops (both converge on
/// "record absent") and never stalls on one hung child — the supervisor's
/// stop path already bounds the grace period and escalates to SIGKILL.
use crate::notify::Notifier;
use crate::state::StateStore;
use crate::supervisor::Supervisor;
use crate::types::{unix_now, Notification, StopOutcome};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One sweep over every run record. Returns how many runs were stopped.
/// Exposed separately from the loop so it can be driven directly in tests
/// and from the CLI.
pub fn run_tick(supervisor: &Arc<Supervisor>, store: &StateStore, notifier: &Notifier) -> usize {
    let now = unix_now();
    let mut stopped = 0;
    for (uid, key, record) in store.snapshot().all_run_records() {
        let Some(expiry) = record.expiry else {
            continue;
        };
        if expiry > now {
            continue;
        }
        // Pinned to the pid from the snapshot: a run restarted between the
        // snapshot and this stop keeps its fresh record.
        match supervisor.stop_pid(uid, &key, record.pid) {
            Ok(StopOutcome::Stopped) => {
                stopped += 1;
                info!("runtime limit reached for user {uid} {key} (pid {})", record.pid);
                notifier.emit(Notification::RuntimeLimitReached {
                    uid,
                    project: key.project.clone(),
                });
            }
            // Already gone: a manual stop or the reaper won the race.
            Ok(StopOutcome::NotRunning) => {}
            Err(e) => warn!("scheduler stop of {key} for user {uid} failed: {e}"),
        }
    }
    stopped
}

pub struct QuotaScheduler {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl QuotaScheduler {
    /// Start the periodic sweep thread. Errors inside a tick are logged and
    /// the loop continues; only `shutdown` ends it.
    pub fn spawn(
        supervisor: Arc<Supervisor>,
        store: Arc<StateStore>,
        interval: Duration,
        notifier: Notifier,
    ) -> Self {
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        let thread = std::thread::Builder::new()
            .name("quota-scheduler".to_string())
            .spawn(move || {
                info!("quota scheduler started (interval {interval:?})");
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            run_tick(&supervisor, &store, &notifier);
                        }
                    }
                }
                info!("quota scheduler stopped");
            })
            .expect("failed to spawn quota scheduler thread");
        Self {
            shutdown: tx,
            thread: Some(thread),
        }
    }

    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
