/// Host-wide configuration, loaded from the environment with defaults that
/// match the reference deployment.
use crate::types::{Tier, UserId};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Root of the durable data tree (state file, per-user project dirs)
    pub data_dir: PathBuf,
    /// Where backup bundles are written
    pub backup_dir: PathBuf,
    /// Base URL used when rendering file-channel links
    pub base_url: String,
    /// Project-count ceiling for free users
    pub max_free_projects: usize,
    /// Project-count ceiling for premium users
    pub max_premium_projects: usize,
    /// Runtime ceiling per free-tier run; premium runs are unbounded
    pub free_runtime_ceiling: Duration,
    /// Period of the background backup loop
    pub backup_interval: Duration,
    /// Retained bundle count after rotation
    pub backup_keep: usize,
    /// Period of the quota scheduler tick
    pub scheduler_interval: Duration,
    /// Lifetime of file-channel access tokens
    pub token_lifetime: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
    /// Interpreter used to launch entry files
    pub interpreter: String,
    /// Suffix of runnable entry files
    pub entry_suffix: String,
    /// Preferred entry-file name when a project holds several candidates
    pub default_entry: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backup_dir: PathBuf::from("./backups"),
            base_url: String::new(),
            max_free_projects: 2,
            max_premium_projects: 10,
            free_runtime_ceiling: Duration::from_secs(12 * 3600),
            backup_interval: Duration::from_secs(600),
            backup_keep: 20,
            scheduler_interval: Duration::from_secs(60),
            token_lifetime: Duration::from_secs(3600),
            stop_grace: Duration::from_secs(5),
            interpreter: "python3".to_string(),
            entry_suffix: ".py".to_string(),
            default_entry: "main.py".to_string(),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

impl HostConfig {
    /// Build a config from `HOSTBOX_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("HOSTBOX_DATA") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HOSTBOX_BACKUPS") {
            cfg.backup_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HOSTBOX_BASE_URL") {
            cfg.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = env_u64("HOSTBOX_MAX_FREE") {
            cfg.max_free_projects = v as usize;
        }
        if let Some(v) = env_u64("HOSTBOX_MAX_PREMIUM") {
            cfg.max_premium_projects = v as usize;
        }
        if let Some(v) = env_u64("HOSTBOX_FREE_RUNTIME_SECS") {
            cfg.free_runtime_ceiling = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("HOSTBOX_BACKUP_INTERVAL_SECS") {
            cfg.backup_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("HOSTBOX_BACKUP_KEEP") {
            cfg.backup_keep = v as usize;
        }
        if let Some(v) = env_u64("HOSTBOX_SCHEDULER_INTERVAL_SECS") {
            cfg.scheduler_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("HOSTBOX_TOKEN_LIFETIME_SECS") {
            cfg.token_lifetime = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("HOSTBOX_STOP_GRACE_SECS") {
            cfg.stop_grace = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("HOSTBOX_INTERPRETER") {
            if !v.trim().is_empty() {
                cfg.interpreter = v;
            }
        }
        cfg
    }

    /// Root of all per-user project directories.
    pub fn users_dir(&self) -> PathBuf {
        self.data_dir.join("users")
    }

    /// Directory holding one user's projects.
    pub fn user_dir(&self, uid: UserId) -> PathBuf {
        self.users_dir().join(uid.to_string())
    }

    /// Directory of a single project. Callers must have validated the
    /// project name; this is plain path assembly.
    pub fn project_dir(&self, uid: UserId, project: &str) -> PathBuf {
        self.user_dir(uid).join(project)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.data_dir.join("tokens.json")
    }

    /// Project-count ceiling for a tier.
    pub fn project_limit(&self, tier: Tier) -> usize {
        match tier {
            Tier::Free => self.max_free_projects,
            Tier::Premium => self.max_premium_projects,
        }
    }

    /// Runtime ceiling for a tier; `None` means unbounded.
    pub fn runtime_ceiling(&self, tier: Tier) -> Option<Duration> {
        match tier {
            Tier::Free => Some(self.free_runtime_ceiling),
            Tier::Premium => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.max_free_projects, 2);
        assert_eq!(cfg.max_premium_projects, 10);
        assert_eq!(cfg.free_runtime_ceiling, Duration::from_secs(43200));
        assert_eq!(cfg.backup_keep, 20);
    }

    #[test]
    fn tier_limits_follow_config() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.project_limit(Tier::Free), 2);
        assert_eq!(cfg.project_limit(Tier::Premium), 10);
        assert!(cfg.runtime_ceiling(Tier::Free).is_some());
        assert!(cfg.runtime_ceiling(Tier::Premium).is_none());
    }

    #[test]
    fn paths_nest_under_data_dir() {
        let cfg = HostConfig {
            data_dir: PathBuf::from("/srv/hostbox"),
            ..HostConfig::default()
        };
        assert_eq!(
            cfg.project_dir(42, "alpha"),
            PathBuf::from("/srv/hostbox/users/42/alpha")
        );
        assert_eq!(cfg.state_path(), PathBuf::from("/srv/hostbox/state.json"));
    }
}
