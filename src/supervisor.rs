/// Process supervisor: one OS process per (user, project, entry) key.
///
/// The supervisor owns the full lifecycle: spawn in an isolated session with
/// stdout/stderr appended to a per-entry log, a persisted [`RunRecord`] while
/// the child lives, and a deterministic two-phase stop (SIGTERM to the
/// process group, bounded grace, then SIGKILL). Duplicate starts for the
/// same key are refused; stop is idempotent.
use crate::config::HostConfig;
use crate::state::{RunRecord, StateStore};
use crate::types::{unix_now, HostError, ProcKey, Result, StopOutcome, UserId};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Poll interval while waiting out the stop grace period.
const STOP_POLL: Duration = Duration::from_millis(100);
/// Extra wait after SIGKILL before declaring the child unkillable.
const KILL_SETTLE: Duration = Duration::from_secs(1);

pub struct Supervisor {
    config: Arc<HostConfig>,
    store: Arc<StateStore>,
    /// Keys with a spawn in flight. Closes the window between the duplicate
    /// check and the RunRecord landing in the store, so two concurrent
    /// `start` calls for one key cannot both succeed.
    starting: Mutex<HashSet<(UserId, String)>>,
}

/// Removes the in-flight marker when a start attempt finishes, on every path.
struct StartGuard<'a> {
    supervisor: &'a Supervisor,
    slot: (UserId, String),
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.supervisor
            .starting
            .lock()
            .expect("starting set poisoned")
            .remove(&self.slot);
    }
}

impl Supervisor {
    pub fn new(config: Arc<HostConfig>, store: Arc<StateStore>) -> Self {
        Self {
            config,
            store,
            starting: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<HostConfig> {
        &self.config
    }

    /// Append-only log file for one entry within a project directory.
    pub fn log_path(dir: &Path, entry: &str) -> PathBuf {
        dir.join(format!("{entry}.log"))
    }

    /// Spawn the entry program for `(uid, project, entry)` and persist its
    /// RunRecord. Free-tier runs get an expiry of start + ceiling; premium
    /// runs are unbounded.
    pub fn start(self: &Arc<Self>, uid: UserId, key: &ProcKey) -> Result<i32> {
        let dir = self.config.project_dir(uid, &key.project);
        if !dir.is_dir() {
            return Err(HostError::NotFound(format!(
                "project {} for user {uid}",
                key.project
            )));
        }
        let entry_path = dir.join(&key.entry);
        if !entry_path.is_file() {
            return Err(HostError::NotFound(format!(
                "entry file {} in project {}",
                key.entry, key.project
            )));
        }

        let slot = (uid, key.encode());
        {
            let mut starting = self.starting.lock().expect("starting set poisoned");
            if starting.contains(&slot) {
                return Err(HostError::Conflict(format!("{key} is already starting")));
            }
            if self.store.snapshot().run_record(uid, key).is_some() {
                return Err(HostError::Conflict(format!("{key} is already running")));
            }
            starting.insert(slot.clone());
        }
        let _guard = StartGuard {
            supervisor: self,
            slot,
        };

        // Per-project dependency environment. An external installer
        // populates it; the child only needs to find it.
        let deps_dir = dir.join(".deps");
        std::fs::create_dir_all(&deps_dir)?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::log_path(&dir, &key.entry))?;
        let log_err = log_file.try_clone()?;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(&key.entry)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err))
            .env("HOSTBOX_DEPS", &deps_dir);
        unsafe {
            // Own session so the whole process tree can be signalled as one
            // group on stop.
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::Resource(format!("spawn {key}: {e}")))?;
        let pid = child.id() as i32;

        let start = unix_now();
        let tier = self
            .store
            .snapshot()
            .user(uid)
            .map(|u| u.tier)
            .unwrap_or_default();
        let expiry = self
            .config
            .runtime_ceiling(tier)
            .map(|ceiling| start + ceiling.as_secs());

        let record = RunRecord {
            pid,
            start,
            entry: key.entry.clone(),
            expiry,
        };
        if let Err(e) = self.store.mutate(|st| {
            st.ensure_user(uid);
            st.insert_run_record(uid, key, record.clone());
            Ok(())
        }) {
            // The record never landed; reap the orphan rather than leak it.
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
            let _ = child.wait();
            return Err(e);
        }

        // Reap the child when it exits on its own, and retire its record so
        // the store does not accumulate ghosts of finished runs.
        {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            std::thread::spawn(move || {
                let _ = child.wait();
                let removed = store.mutate(|st| {
                    if st.run_record(uid, &key).map(|r| r.pid) == Some(pid) {
                        st.remove_run_record(uid, &key);
                    }
                    Ok(())
                });
                if let Err(e) = removed {
                    warn!("failed to retire run record for {key}: {e}");
                }
            });
        }

        let run_id = uuid::Uuid::new_v4();
        info!("started {key} for user {uid} (run {run_id}, pid {pid}, expiry {expiry:?})");
        Ok(pid)
    }

    /// Stop whatever process currently holds this key. See [`Self::stop_pid`]
    /// for the termination contract.
    pub fn stop(&self, uid: UserId, key: &ProcKey) -> Result<StopOutcome> {
        let Some(record) = self.store.snapshot().run_record(uid, key).cloned() else {
            return Ok(StopOutcome::NotRunning);
        };
        self.stop_pid(uid, key, record.pid)
    }

    /// Two-phase stop pinned to one process: SIGTERM to the process group,
    /// bounded grace wait, SIGKILL escalation. Stopping an already-dead PID
    /// is success. Both the entry check and the record removal require the
    /// key's record to still carry `pid`, so a stop racing a restart (the
    /// reaper retires the old record, a concurrent `start` installs a new
    /// one) can never tear down the replacement's record.
    pub fn stop_pid(&self, uid: UserId, key: &ProcKey, pid: i32) -> Result<StopOutcome> {
        match self.store.snapshot().run_record(uid, key) {
            Some(record) if record.pid == pid => {}
            _ => return Ok(StopOutcome::NotRunning),
        }
        let pgid = Pid::from_raw(pid);

        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                // Group signal refused; fall back to the direct PID before
                // giving up on the graceful phase.
                debug!("group SIGTERM for {key} failed ({e}), signalling pid directly");
                match kill(pgid, Signal::SIGTERM) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(HostError::Resource(format!("SIGTERM pid {pid}: {e}"))),
                }
            }
        }

        let deadline = Instant::now() + self.config.stop_grace;
        while Self::pid_alive(pid) && Instant::now() < deadline {
            std::thread::sleep(STOP_POLL);
        }

        if Self::pid_alive(pid) {
            debug!("{key} survived grace period, escalating to SIGKILL");
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(_) => {
                    let _ = kill(pgid, Signal::SIGKILL);
                }
            }
            let settle = Instant::now() + KILL_SETTLE;
            while Self::pid_alive(pid) && Instant::now() < settle {
                std::thread::sleep(STOP_POLL);
            }
            if Self::pid_alive(pid) {
                return Err(HostError::Timeout(format!(
                    "pid {pid} for {key} survived SIGKILL"
                )));
            }
        }

        self.store.mutate(|st| {
            if st.run_record(uid, key).map(|r| r.pid) == Some(pid) {
                st.remove_run_record(uid, key);
            }
            Ok(())
        })?;
        info!("stopped {key} for user {uid} (pid {pid})");
        Ok(StopOutcome::Stopped)
    }

    /// Stop-then-start. The stop half tolerates "not running"; each half's
    /// error is reported on its own.
    pub fn restart(self: &Arc<Self>, uid: UserId, key: &ProcKey) -> Result<i32> {
        self.stop(uid, key)?;
        self.start(uid, key)
    }

    /// Liveness probe without delivering a signal (`kill(pid, 0)`). EPERM
    /// means the process exists but is not ours, which still counts as
    /// alive.
    pub fn pid_alive(pid: i32) -> bool {
        if pid <= 1 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    pub fn is_running(&self, pid: i32) -> bool {
        Self::pid_alive(pid)
    }

    /// Last `max_lines` lines of an entry's log. Reads a bounded window from
    /// the file tail instead of the whole file, so huge logs stay cheap.
    pub fn read_log_tail(
        &self,
        uid: UserId,
        key: &ProcKey,
        max_lines: usize,
    ) -> Result<String> {
        let dir = self.config.project_dir(uid, &key.project);
        let path = Self::log_path(&dir, &key.entry);
        if !path.is_file() {
            return Err(HostError::NotFound(format!("no log for {key}")));
        }
        read_tail_lines(&path, max_lines)
    }
}

/// Tail-bounded line read: seek back a window proportional to the requested
/// line count (capped at 1 MiB), then keep the last `max_lines` lines.
fn read_tail_lines(path: &Path, max_lines: usize) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let window = (max_lines as u64 * 512).clamp(4096, 1 << 20).min(len);
    file.seek(SeekFrom::End(-(window as i64)))?;
    let mut raw = Vec::with_capacity(window as usize);
    file.read_to_end(&mut raw)?;
    let buf = String::from_utf8_lossy(&raw);

    // A mid-line window start yields a partial first line; drop it unless we
    // read the whole file.
    let text = if window < len {
        buf.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
    } else {
        buf.as_ref()
    };
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(max_lines);
    Ok(lines[skip..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_setup(dir: &Path) -> (Arc<HostConfig>, Arc<StateStore>, Arc<Supervisor>) {
        let config = Arc::new(HostConfig {
            data_dir: dir.to_path_buf(),
            backup_dir: dir.join("backups"),
            interpreter: "sh".to_string(),
            stop_grace: Duration::from_millis(400),
            ..HostConfig::default()
        });
        let store = Arc::new(StateStore::open(config.state_path()).unwrap());
        let supervisor = Arc::new(Supervisor::new(Arc::clone(&config), Arc::clone(&store)));
        (config, store, supervisor)
    }

    fn write_entry(config: &HostConfig, uid: UserId, project: &str, entry: &str, body: &str) {
        let dir = config.project_dir(uid, project);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(entry), body).unwrap();
    }

    #[test]
    fn start_refuses_duplicate_key() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, store, supervisor) = test_setup(tmp.path());
        write_entry(&config, 1, "alpha", "main.py", "sleep 30\n");
        let key = ProcKey::new("alpha", "main.py");

        let pid = supervisor.start(1, &key).unwrap();
        assert!(Supervisor::pid_alive(pid));
        assert!(matches!(
            supervisor.start(1, &key),
            Err(HostError::Conflict(_))
        ));
        assert_eq!(
            store.snapshot().run_record(1, &key).map(|r| r.pid),
            Some(pid)
        );

        assert_eq!(supervisor.stop(1, &key).unwrap(), StopOutcome::Stopped);
    }

    #[test]
    fn stop_is_idempotent_and_clears_record() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, store, supervisor) = test_setup(tmp.path());
        write_entry(&config, 2, "beta", "main.py", "sleep 30\n");
        let key = ProcKey::new("beta", "main.py");

        let pid = supervisor.start(2, &key).unwrap();
        assert_eq!(supervisor.stop(2, &key).unwrap(), StopOutcome::Stopped);
        assert!(!Supervisor::pid_alive(pid));
        assert!(store.snapshot().run_record(2, &key).is_none());
        assert_eq!(supervisor.stop(2, &key).unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn sigterm_ignoring_child_is_force_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, _store, supervisor) = test_setup(tmp.path());
        write_entry(&config, 3, "stubborn", "main.py", "trap '' TERM\nsleep 30\n");
        let key = ProcKey::new("stubborn", "main.py");

        let pid = supervisor.start(3, &key).unwrap();
        // Give the shell a moment to install the trap.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(supervisor.stop(3, &key).unwrap(), StopOutcome::Stopped);
        assert!(!Supervisor::pid_alive(pid));
    }

    #[test]
    fn free_tier_start_records_expiry_premium_does_not() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, store, supervisor) = test_setup(tmp.path());
        write_entry(&config, 4, "alpha", "main.py", "sleep 30\n");
        write_entry(&config, 5, "alpha", "main.py", "sleep 30\n");
        store
            .mutate(|st| {
                st.ensure_user(5).tier = crate::types::Tier::Premium;
                Ok(())
            })
            .unwrap();
        let key = ProcKey::new("alpha", "main.py");

        supervisor.start(4, &key).unwrap();
        supervisor.start(5, &key).unwrap();
        let snap = store.snapshot();
        let free = snap.run_record(4, &key).unwrap();
        let prem = snap.run_record(5, &key).unwrap();
        let ceiling = config.free_runtime_ceiling.as_secs();
        assert_eq!(free.expiry, Some(free.start + ceiling));
        assert_eq!(prem.expiry, None);

        supervisor.stop(4, &key).unwrap();
        supervisor.stop(5, &key).unwrap();
    }

    #[test]
    fn exited_child_record_is_retired_by_reaper() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, store, supervisor) = test_setup(tmp.path());
        write_entry(&config, 6, "short", "main.py", "echo done\n");
        let key = ProcKey::new("short", "main.py");

        supervisor.start(6, &key).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.snapshot().run_record(6, &key).is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(store.snapshot().run_record(6, &key).is_none());
    }

    #[test]
    fn log_tail_returns_last_lines_only() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, _store, supervisor) = test_setup(tmp.path());
        write_entry(&config, 7, "logs", "main.py", "true\n");
        let key = ProcKey::new("logs", "main.py");
        let dir = config.project_dir(7, "logs");
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Supervisor::log_path(&dir, "main.py"))
            .unwrap();
        for i in 0..1000 {
            writeln!(f, "line {i}").unwrap();
        }

        let tail = supervisor.read_log_tail(7, &key, 3).unwrap();
        assert_eq!(tail, "line 997\nline 998\nline 999");
    }

    #[test]
    fn stop_leaves_record_of_newer_run_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, store, supervisor) = test_setup(tmp.path());
        write_entry(&config, 9, "swap", "main.py", "trap '' TERM\nsleep 30\n");
        let key = ProcKey::new("swap", "main.py");
        let old_pid = supervisor.start(9, &key).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        // The TERM-ignoring child keeps this stop inside its grace wait
        // while the run is replaced under it.
        let stopper = {
            let supervisor = Arc::clone(&supervisor);
            let key = key.clone();
            std::thread::spawn(move || supervisor.stop(9, &key))
        };
        std::thread::sleep(Duration::from_millis(100));
        unsafe { libc::kill(-old_pid, libc::SIGKILL) };
        let deadline = Instant::now() + Duration::from_secs(2);
        while store.snapshot().run_record(9, &key).is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let new_pid = supervisor.start(9, &key).unwrap();
        assert_ne!(new_pid, old_pid);

        assert_eq!(stopper.join().unwrap().unwrap(), StopOutcome::Stopped);
        // The stop targeted old_pid only; the replacement run and its
        // record survive.
        assert_eq!(store.snapshot().run_record(9, &key).map(|r| r.pid), Some(new_pid));
        assert!(Supervisor::pid_alive(new_pid));

        supervisor.stop(9, &key).unwrap();
    }

    #[test]
    fn stop_pid_ignores_a_record_with_another_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, store, supervisor) = test_setup(tmp.path());
        write_entry(&config, 10, "pin", "main.py", "sleep 30\n");
        let key = ProcKey::new("pin", "main.py");
        let pid = supervisor.start(10, &key).unwrap();

        // A stop pinned to a stale pid no-ops instead of killing the
        // current run.
        assert_eq!(
            supervisor.stop_pid(10, &key, pid + 1).unwrap(),
            StopOutcome::NotRunning
        );
        assert!(Supervisor::pid_alive(pid));
        assert!(store.snapshot().run_record(10, &key).is_some());

        assert_eq!(supervisor.stop_pid(10, &key, pid).unwrap(), StopOutcome::Stopped);
    }

    #[test]
    fn start_fails_fast_on_missing_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, store, supervisor) = test_setup(tmp.path());
        let dir = config.project_dir(8, "empty");
        std::fs::create_dir_all(&dir).unwrap();
        let key = ProcKey::new("empty", "main.py");

        assert!(matches!(
            supervisor.start(8, &key),
            Err(HostError::NotFound(_))
        ));
        // A spawn failure never creates a record.
        assert!(store.snapshot().run_record(8, &key).is_none());
    }
}
