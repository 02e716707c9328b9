/// Boot reconciler: bring the state document back in line with reality
/// after a daemon restart.
///
/// Run records describe processes from a previous incarnation. For each one:
/// a still-alive pid is adopted as-is (its expiry keeps ticking), a dead pid
/// has its record dropped, and dropped runs are restarted best-effort when
/// the project directory and entry file still exist.
use crate::state::StateStore;
use crate::supervisor::Supervisor;
use crate::types::Result;
use log::{info, warn};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records whose process survived the daemon restart
    pub kept: usize,
    /// Dead runs relaunched with a fresh record
    pub restarted: usize,
    /// Dead runs whose project or entry no longer exists
    pub dropped: usize,
}

/// One pass over every persisted run record. Restart failures downgrade to
/// `dropped` with a warning; a broken project must not block boot.
pub fn reconcile(supervisor: &Arc<Supervisor>, store: &StateStore) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let records = store.snapshot().all_run_records();
    info!("reconciling {} persisted run record(s)", records.len());

    for (uid, key, record) in records {
        if Supervisor::pid_alive(record.pid) {
            report.kept += 1;
            continue;
        }
        // The stale record must go before a restart can insert a fresh one.
        store.mutate(|st| {
            st.remove_run_record(uid, &key);
            Ok(())
        })?;

        let dir = supervisor.config().project_dir(uid, &key.project);
        if !dir.join(&key.entry).is_file() {
            warn!("dropping run record for user {uid} {key}: entry file gone");
            report.dropped += 1;
            continue;
        }
        match supervisor.start(uid, &key) {
            Ok(pid) => {
                info!("relaunched {key} for user {uid} as pid {pid}");
                report.restarted += 1;
            }
            Err(e) => {
                warn!("could not relaunch {key} for user {uid}: {e}");
                report.dropped += 1;
            }
        }
    }

    info!(
        "reconcile complete: {} kept, {} restarted, {} dropped",
        report.kept, report.restarted, report.dropped
    );
    Ok(report)
}
