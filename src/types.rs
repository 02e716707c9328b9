/// Core types and error taxonomy for the hostbox system
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque end-user identifier (chat front-ends hand us numeric ids)
pub type UserId = u64;

/// Service level controlling project-count and runtime limits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Premium,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

/// Key identifying one supervised process: a project plus its entry file.
/// Persisted in the state document as `"<project>:<entry>"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcKey {
    pub project: String,
    pub entry: String,
}

impl ProcKey {
    pub fn new(project: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            entry: entry.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.project, self.entry)
    }

    /// Parse the persisted `"<project>:<entry>"` form. Project names cannot
    /// contain `:` (validated at creation), so the first separator wins.
    pub fn decode(raw: &str) -> Option<Self> {
        let (project, entry) = raw.split_once(':')?;
        if project.is_empty() || entry.is_empty() {
            return None;
        }
        Some(Self::new(project, entry))
    }
}

impl fmt::Display for ProcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.entry)
    }
}

/// Outcome of a stop request. A forced kill after a failed graceful stop is
/// the designed escalation path and still reports `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Asynchronous events surfaced to the front-end collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    ProjectStarted {
        uid: UserId,
        project: String,
        pid: i32,
    },
    ProjectStopped {
        uid: UserId,
        project: String,
    },
    RuntimeLimitReached {
        uid: UserId,
        project: String,
    },
    BackupFailed {
        reason: String,
    },
}

/// Custom error types for hostbox
#[derive(Error, Debug)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for HostError {
    fn from(err: nix::errno::Errno) -> Self {
        HostError::Resource(err.to_string())
    }
}

/// Result type alias for hostbox operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Current wall-clock time as whole seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
