/// High-level host service: the operation surface a chat front-end calls.
///
/// Ties together the state store, supervisor, token service and backup
/// manager, and enforces the account-level policy the lower layers do not
/// know about: project name validation, per-tier project quotas and ban
/// flags.
use crate::backup::BackupManager;
use crate::config::HostConfig;
use crate::files::confine;
use crate::notify::Notifier;
use crate::state::StateStore;
use crate::supervisor::Supervisor;
use crate::tokens::TokenService;
use crate::types::{HostError, Notification, ProcKey, Result, StopOutcome, Tier, UserId};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

const MAX_PROJECT_NAME: usize = 64;

/// Project names become directory names and state-document keys, so the
/// alphabet is tight: ASCII alphanumerics plus `-` and `_`. The `:`
/// separator of run-record keys can therefore never appear in a name.
pub fn validate_project_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_PROJECT_NAME {
        return Err(HostError::Conflict(format!(
            "project name must be 1-{MAX_PROJECT_NAME} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(HostError::Conflict(
            "project name may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

pub struct HostService {
    config: Arc<HostConfig>,
    store: Arc<StateStore>,
    supervisor: Arc<Supervisor>,
    tokens: Arc<TokenService>,
    backup: BackupManager,
    notifier: Notifier,
}

impl HostService {
    pub fn new(
        config: Arc<HostConfig>,
        store: Arc<StateStore>,
        supervisor: Arc<Supervisor>,
        tokens: Arc<TokenService>,
        notifier: Notifier,
    ) -> Self {
        let backup = BackupManager::new(Arc::clone(&config));
        Self {
            config,
            store,
            supervisor,
            tokens,
            backup,
            notifier,
        }
    }

    pub fn config(&self) -> &Arc<HostConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn check_not_banned(&self, uid: UserId) -> Result<()> {
        if self.store.snapshot().user(uid).is_some_and(|u| u.banned) {
            return Err(HostError::Unauthorized(format!("user {uid} is banned")));
        }
        Ok(())
    }

    // ---- projects ---------------------------------------------------------

    /// Register a new project for a user and create its directory. Enforces
    /// the per-tier project quota and refuses duplicates.
    pub fn create_project(&self, uid: UserId, name: &str) -> Result<()> {
        validate_project_name(name)?;
        self.check_not_banned(uid)?;

        let dir = self.config.project_dir(uid, name);
        self.store.mutate(|st| {
            let limit = self.config.project_limit(st.user(uid).map(|u| u.tier).unwrap_or_default());
            let user = st.ensure_user(uid);
            if user.projects.iter().any(|p| p == name) {
                return Err(HostError::Conflict(format!("project '{name}' already exists")));
            }
            if user.projects.len() >= limit {
                return Err(HostError::Resource(format!(
                    "project limit reached ({limit} on the {} tier)",
                    user.tier
                )));
            }
            user.projects.push(name.to_string());
            Ok(())
        })?;
        if let Err(e) = std::fs::create_dir_all(&dir) {
            // A registration without a directory must not survive: the list
            // and the tree stay in step even when the mkdir fails.
            let _ = self.store.mutate(|st| {
                if let Some(user) = st.users.get_mut(&uid.to_string()) {
                    user.projects.retain(|p| p != name);
                }
                Ok(())
            });
            return Err(e.into());
        }
        info!("created project '{name}' for user {uid}");
        Ok(())
    }

    pub fn list_projects(&self, uid: UserId) -> Vec<String> {
        self.store
            .snapshot()
            .user(uid)
            .map(|u| u.projects.clone())
            .unwrap_or_default()
    }

    fn require_project(&self, uid: UserId, project: &str) -> Result<PathBuf> {
        let owned = self
            .store
            .snapshot()
            .user(uid)
            .is_some_and(|u| u.projects.iter().any(|p| p == project));
        if !owned {
            return Err(HostError::NotFound(format!(
                "user {uid} has no project '{project}'"
            )));
        }
        Ok(self.config.project_dir(uid, project))
    }

    /// Place a source file into a project. The front-end hands us uploaded
    /// documents; the path is confined to the project directory.
    pub fn upload_file(
        &self,
        uid: UserId,
        project: &str,
        filename: &str,
        contents: &[u8],
    ) -> Result<()> {
        self.check_not_banned(uid)?;
        let dir = self.require_project(uid, project)?;
        std::fs::create_dir_all(&dir)?;
        let path = confine(&dir, filename)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        info!(
            "stored {} ({} bytes) in project '{project}' for user {uid}",
            filename,
            contents.len()
        );
        Ok(())
    }

    /// Stop everything in the project, revoke its tokens, then remove both
    /// the directory and the registration.
    pub fn delete_project(&self, uid: UserId, project: &str) -> Result<()> {
        let dir = self.require_project(uid, project)?;
        for (key, _) in self.store.snapshot().project_records(uid, project) {
            let _ = self.supervisor.stop(uid, &key);
        }
        self.tokens.revoke_project(uid, project)?;
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.store.mutate(|st| {
            if let Some(user) = st.users.get_mut(&uid.to_string()) {
                user.projects.retain(|p| p != project);
            }
            // Stop above already cleared the records; this covers records
            // whose process refused to die.
            if let Some(map) = st.procs.get_mut(&uid.to_string()) {
                map.retain(|raw, _| {
                    ProcKey::decode(raw).map_or(true, |k| k.project != project)
                });
                if map.is_empty() {
                    st.procs.remove(&uid.to_string());
                }
            }
            Ok(())
        })?;
        info!("deleted project '{project}' for user {uid}");
        Ok(())
    }

    // ---- runs -------------------------------------------------------------

    /// Pick the file to execute: the configured default name when present,
    /// otherwise the lexicographically first file with the entry suffix.
    pub fn resolve_entry(&self, uid: UserId, project: &str) -> Result<String> {
        let dir = self.require_project(uid, project)?;
        let default = dir.join(&self.config.default_entry);
        if default.is_file() {
            return Ok(self.config.default_entry.clone());
        }
        let mut candidates: Vec<String> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(&self.config.entry_suffix))
            .collect();
        candidates.sort();
        candidates.into_iter().next().ok_or_else(|| {
            HostError::NotFound(format!(
                "project '{project}' has no {} entry file",
                self.config.entry_suffix
            ))
        })
    }

    /// Entry used for stop/log operations: the running record's entry when
    /// one exists, so commands address the process actually alive, not the
    /// file a later upload may have introduced.
    fn current_entry(&self, uid: UserId, project: &str) -> Result<String> {
        let records = self.store.snapshot().project_records(uid, project);
        if let Some((key, _)) = records.into_iter().next() {
            return Ok(key.entry);
        }
        self.resolve_entry(uid, project)
    }

    pub fn start_project(&self, uid: UserId, project: &str) -> Result<i32> {
        self.check_not_banned(uid)?;
        let entry = self.resolve_entry(uid, project)?;
        let key = ProcKey::new(project, entry);
        let pid = self.supervisor.start(uid, &key)?;
        self.notifier.emit(Notification::ProjectStarted {
            uid,
            project: project.to_string(),
            pid,
        });
        Ok(pid)
    }

    pub fn stop_project(&self, uid: UserId, project: &str) -> Result<StopOutcome> {
        let entry = self.current_entry(uid, project)?;
        let outcome = self.supervisor.stop(uid, &ProcKey::new(project, entry))?;
        if outcome == StopOutcome::Stopped {
            self.notifier.emit(Notification::ProjectStopped {
                uid,
                project: project.to_string(),
            });
        }
        Ok(outcome)
    }

    /// Stop-then-start. A project that was not running simply starts.
    pub fn restart_project(&self, uid: UserId, project: &str) -> Result<i32> {
        self.check_not_banned(uid)?;
        let _ = self.stop_project(uid, project)?;
        self.start_project(uid, project)
    }

    pub fn tail_logs(&self, uid: UserId, project: &str, max_lines: usize) -> Result<String> {
        let entry = self.current_entry(uid, project)?;
        self.supervisor
            .read_log_tail(uid, &ProcKey::new(project, entry), max_lines)
    }

    pub fn is_running(&self, uid: UserId, project: &str) -> bool {
        !self.store.snapshot().project_records(uid, project).is_empty()
    }

    // ---- accounts ---------------------------------------------------------

    pub fn set_tier(&self, uid: UserId, tier: Tier) -> Result<()> {
        self.store.mutate(|st| {
            st.ensure_user(uid).tier = tier;
            Ok(())
        })?;
        info!("user {uid} moved to the {tier} tier");
        Ok(())
    }

    /// Ban a user and stop all of their runs. The projects and files stay;
    /// an unban restores access without data loss.
    pub fn ban(&self, uid: UserId) -> Result<()> {
        self.store.mutate(|st| {
            st.ensure_user(uid).banned = true;
            Ok(())
        })?;
        for (ruid, key, _) in self.store.snapshot().all_run_records() {
            if ruid == uid {
                let _ = self.supervisor.stop(uid, &key);
            }
        }
        info!("user {uid} banned");
        Ok(())
    }

    pub fn unban(&self, uid: UserId) -> Result<()> {
        self.store.mutate(|st| {
            st.ensure_user(uid).banned = false;
            Ok(())
        })?;
        info!("user {uid} unbanned");
        Ok(())
    }

    // ---- file channel & backups -------------------------------------------

    /// Issue a file-channel token and render the link the front-end shows
    /// the user.
    pub fn file_link(&self, uid: UserId, project: &str) -> Result<String> {
        self.check_not_banned(uid)?;
        self.require_project(uid, project)?;
        let token = self.tokens.issue(uid, project)?;
        Ok(format!(
            "{}/fm?uid={uid}&proj={project}&token={token}",
            self.config.base_url
        ))
    }

    pub fn trigger_backup(&self) -> Result<PathBuf> {
        self.backup.run_and_rotate()
    }
}
