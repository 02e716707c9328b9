/// Access tokens for the file channel.
///
/// A token is an opaque capability scoped to one (user, project) pair with a
/// fixed lifetime. Tokens are persisted in their own document, separate from
/// the main state file, so a corrupt or lost token table costs nothing but a
/// re-issue.
use crate::state::write_json_atomic;
use crate::types::{unix_now, HostError, Result, UserId};
use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Raw entropy per token before encoding.
const TOKEN_BYTES: usize = 24;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenRecord {
    pub uid: UserId,
    pub project: String,
    /// Unix seconds after which the token is dead
    pub expiry: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TokenTable {
    #[serde(default)]
    tokens: HashMap<String, TokenRecord>,
}

pub struct TokenService {
    path: PathBuf,
    lifetime: Duration,
    inner: Mutex<TokenTable>,
}

impl TokenService {
    /// Load the token table from `path`. Unlike the state document, a corrupt
    /// token file is recoverable — every token can be re-issued — so we log
    /// and start empty instead of refusing to boot.
    pub fn open(path: impl Into<PathBuf>, lifetime: Duration) -> Result<Self> {
        let path = path.into();
        let table = if path.exists() {
            let bytes = std::fs::read(&path)?;
            match serde_json::from_slice(&bytes) {
                Ok(table) => table,
                Err(e) => {
                    warn!("discarding corrupt token file {}: {e}", path.display());
                    TokenTable::default()
                }
            }
        } else {
            TokenTable::default()
        };
        Ok(Self {
            path,
            lifetime,
            inner: Mutex::new(table),
        })
    }

    /// Mint a fresh token scoped to `(uid, project)`. Expired entries are
    /// pruned on the way, so the table never grows without bound.
    pub fn issue(&self, uid: UserId, project: &str) -> Result<String> {
        let mut raw = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut raw);
        let token = {
            use base64::Engine;
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
        };

        let mut guard = self.inner.lock().expect("token mutex poisoned");
        let now = unix_now();
        guard.tokens.retain(|_, rec| rec.expiry > now);
        guard.tokens.insert(
            token.clone(),
            TokenRecord {
                uid,
                project: project.to_string(),
                expiry: now + self.lifetime.as_secs(),
            },
        );
        write_json_atomic(&self.path, &*guard)?;
        debug!("issued file token for user {uid} project {project}");
        Ok(token)
    }

    /// Check that `token` is live and scoped to exactly `(uid, project)`.
    /// An expired token is removed as a side effect.
    pub fn authorize(&self, token: &str, uid: UserId, project: &str) -> Result<()> {
        let mut guard = self.inner.lock().expect("token mutex poisoned");
        let Some(rec) = guard.tokens.get(token) else {
            return Err(HostError::Unauthorized("unknown token".to_string()));
        };
        if rec.expiry <= unix_now() {
            guard.tokens.remove(token);
            let _ = write_json_atomic(&self.path, &*guard);
            return Err(HostError::Unauthorized("token expired".to_string()));
        }
        if rec.uid != uid || rec.project != project {
            return Err(HostError::Unauthorized(
                "token not valid for this project".to_string(),
            ));
        }
        Ok(())
    }

    /// Drop one token. Revoking a token that never existed (or already
    /// expired away) is a no-op.
    pub fn revoke(&self, token: &str) -> Result<bool> {
        let mut guard = self.inner.lock().expect("token mutex poisoned");
        let removed = guard.tokens.remove(token).is_some();
        if removed {
            write_json_atomic(&self.path, &*guard)?;
        }
        Ok(removed)
    }

    /// Drop every token scoped to a project; used when the project itself
    /// goes away. Returns the number revoked.
    pub fn revoke_project(&self, uid: UserId, project: &str) -> Result<usize> {
        let mut guard = self.inner.lock().expect("token mutex poisoned");
        let before = guard.tokens.len();
        guard
            .tokens
            .retain(|_, rec| !(rec.uid == uid && rec.project == project));
        let removed = before - guard.tokens.len();
        if removed > 0 {
            write_json_atomic(&self.path, &*guard)?;
        }
        Ok(removed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_in(dir: &Path, lifetime: Duration) -> TokenService {
        TokenService::open(dir.join("tokens.json"), lifetime).unwrap()
    }

    #[test]
    fn issued_token_authorizes_its_own_scope_only() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_in(dir.path(), Duration::from_secs(3600));
        let token = svc.issue(1, "alpha").unwrap();

        assert!(svc.authorize(&token, 1, "alpha").is_ok());
        assert!(matches!(
            svc.authorize(&token, 1, "beta"),
            Err(HostError::Unauthorized(_))
        ));
        assert!(matches!(
            svc.authorize(&token, 2, "alpha"),
            Err(HostError::Unauthorized(_))
        ));
        assert!(matches!(
            svc.authorize("not-a-token", 1, "alpha"),
            Err(HostError::Unauthorized(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_in(dir.path(), Duration::from_secs(0));
        let token = svc.issue(1, "alpha").unwrap();
        assert!(matches!(
            svc.authorize(&token, 1, "alpha"),
            Err(HostError::Unauthorized(_))
        ));
        // The expired entry is gone, so revoke sees nothing.
        assert!(!svc.revoke(&token).unwrap());
    }

    #[test]
    fn revoke_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_in(dir.path(), Duration::from_secs(3600));
        let token = svc.issue(1, "alpha").unwrap();
        assert!(svc.revoke(&token).unwrap());
        assert!(!svc.revoke(&token).unwrap());
        assert!(svc.authorize(&token, 1, "alpha").is_err());
    }

    #[test]
    fn tokens_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let svc = service_in(dir.path(), Duration::from_secs(3600));
            svc.issue(5, "gamma").unwrap()
        };
        let svc = service_in(dir.path(), Duration::from_secs(3600));
        assert!(svc.authorize(&token, 5, "gamma").is_ok());
    }

    #[test]
    fn corrupt_token_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokens.json"), b"not json at all").unwrap();
        let svc = service_in(dir.path(), Duration::from_secs(3600));
        assert!(svc.authorize("anything", 1, "alpha").is_err());
        // And the service is usable again.
        let token = svc.issue(1, "alpha").unwrap();
        assert!(svc.authorize(&token, 1, "alpha").is_ok());
    }

    #[test]
    fn project_revocation_clears_all_matching_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_in(dir.path(), Duration::from_secs(3600));
        let a = svc.issue(1, "alpha").unwrap();
        let b = svc.issue(1, "alpha").unwrap();
        let other = svc.issue(1, "beta").unwrap();

        assert_eq!(svc.revoke_project(1, "alpha").unwrap(), 2);
        assert!(svc.authorize(&a, 1, "alpha").is_err());
        assert!(svc.authorize(&b, 1, "alpha").is_err());
        assert!(svc.authorize(&other, 1, "beta").is_ok());
    }
}
