/// Durable state store: one JSON document holding users, projects and
/// run-records, mutated read-modify-write under a process-wide mutex.
///
/// All writers (front-end requests, scheduler ticks, supervisor events)
/// funnel through [`StateStore::mutate`], so updates are linearized and a
/// failed save rolls back to the last persisted snapshot. Persistence uses
/// write-to-temp-then-rename so the on-disk document is never torn.
use crate::types::{HostError, ProcKey, Result, Tier, UserId};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Per-user durable record. Users are never physically deleted; admin
/// actions only flip the tier and ban flags.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub projects: Vec<String>,
}

/// Live-process metadata tracked while a project's entry program runs.
/// Exists only between a successful spawn and an observed or forced stop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub pid: i32,
    /// Spawn time, Unix seconds
    pub start: u64,
    /// Resolved entry-file name
    pub entry: String,
    /// Tier-limit cutoff, Unix seconds; `None` for unbounded premium runs
    #[serde(default)]
    pub expiry: Option<u64>,
}

/// The persisted document. Map keys are stringified so the JSON layout stays
/// stable and diffable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub users: HashMap<String, UserRecord>,
    /// uid -> ("<project>:<entry>" -> record)
    #[serde(default)]
    pub procs: HashMap<String, HashMap<String, RunRecord>>,
}

impl State {
    pub fn user(&self, uid: UserId) -> Option<&UserRecord> {
        self.users.get(&uid.to_string())
    }

    /// Get-or-create the record for a user. New users start on the free
    /// tier with no projects.
    pub fn ensure_user(&mut self, uid: UserId) -> &mut UserRecord {
        self.users.entry(uid.to_string()).or_default()
    }

    pub fn run_record(&self, uid: UserId, key: &ProcKey) -> Option<&RunRecord> {
        self.procs.get(&uid.to_string())?.get(&key.encode())
    }

    pub fn insert_run_record(&mut self, uid: UserId, key: &ProcKey, record: RunRecord) {
        self.procs
            .entry(uid.to_string())
            .or_default()
            .insert(key.encode(), record);
    }

    /// Remove a run record; returns the removed record if one existed.
    /// Safe to call twice — concurrent manual and scheduler stops both
    /// converge to "absent".
    pub fn remove_run_record(&mut self, uid: UserId, key: &ProcKey) -> Option<RunRecord> {
        let suid = uid.to_string();
        let removed = self.procs.get_mut(&suid)?.remove(&key.encode());
        if self.procs.get(&suid).is_some_and(|m| m.is_empty()) {
            self.procs.remove(&suid);
        }
        removed
    }

    /// All run records for one user's project, keyed by entry file.
    pub fn project_records(&self, uid: UserId, project: &str) -> Vec<(ProcKey, RunRecord)> {
        let Some(map) = self.procs.get(&uid.to_string()) else {
            return Vec::new();
        };
        map.iter()
            .filter_map(|(raw, rec)| {
                let key = ProcKey::decode(raw)?;
                (key.project == project).then(|| (key, rec.clone()))
            })
            .collect()
    }

    /// Flat view over every run record: (uid, key, record).
    pub fn all_run_records(&self) -> Vec<(UserId, ProcKey, RunRecord)> {
        let mut out = Vec::new();
        for (suid, map) in &self.procs {
            let Ok(uid) = suid.parse::<UserId>() else {
                continue;
            };
            for (raw, rec) in map {
                if let Some(key) = ProcKey::decode(raw) {
                    out.push((uid, key, rec.clone()));
                }
            }
        }
        out
    }
}

/// Serialize `value` to `path` via a sibling temp file and an atomic rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| HostError::Resource(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    // pid plus a random suffix: concurrent writers within one process must
    // not stomp each other's temp file.
    let tmp = parent.join(format!(
        ".{}.tmp.{}.{:08x}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string()),
        std::process::id(),
        fastrand::u32(..)
    ));
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| HostError::Resource(format!("state serialization failed: {e}")))?;
    std::fs::write(&tmp, &bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Process-wide owner of the persisted [`State`].
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<State>,
}

impl StateStore {
    /// Load the state document from `path`, starting empty when the file
    /// does not exist yet. A file that exists but fails to parse is an
    /// error — silently discarding user records is worse than refusing to
    /// boot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| HostError::Resource(format!("corrupt state file {}: {e}", path.display())))?
        } else {
            State::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    /// Clone of the current in-memory state. Readers may observe a snapshot
    /// slightly behind concurrent mutators, never a torn one.
    pub fn snapshot(&self) -> State {
        self.inner.lock().expect("state mutex poisoned").clone()
    }

    /// Read-modify-write under the store mutex. The mutation runs against a
    /// clone; only a successful save swaps it in, so both a mutation error
    /// and a save failure leave memory at the last persisted snapshot.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock().expect("state mutex poisoned");
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if let Err(e) = write_json_atomic(&self.path, &next) {
            warn!("state save failed, rolling back mutation: {e}");
            return Err(e);
        }
        *guard = next;
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
