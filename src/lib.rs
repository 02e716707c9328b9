//! hostbox: a multi-user supervised program-hosting core
//!
//! Users own named projects (directories of source files), and each project
//! can run its entry program as one supervised OS process. The crate is the
//! policy and lifecycle engine a chat front-end drives:
//!
//! - [`state`]: one durable JSON document of users, projects and run records
//! - [`supervisor`]: spawn in an own session, per-entry logs, two-phase stop
//! - [`scheduler`]: periodic sweep enforcing per-tier runtime ceilings
//! - [`backup`]: timestamped tar.gz bundles of the data tree, with rotation
//! - [`tokens`] / [`files`]: scoped capabilities gating the file channel
//! - [`recovery`]: boot-time reconciliation of records against live PIDs
//! - [`host`]: the operation facade tying policy (quotas, bans) together
//!
//! Everything is synchronous; background work runs on plain named threads
//! fed by crossbeam channels.

pub mod backup;
pub mod cli;
pub mod config;
pub mod files;
pub mod host;
pub mod notify;
pub mod recovery;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod tokens;
pub mod types;

pub use config::HostConfig;
pub use host::HostService;
pub use notify::Notifier;
pub use state::{RunRecord, State, StateStore, UserRecord};
pub use supervisor::Supervisor;
pub use tokens::TokenService;
pub use types::{HostError, Notification, ProcKey, Result, StopOutcome, Tier, UserId};
