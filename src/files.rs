/// Token-gated file channel: list, read, write and delete files inside one
/// project directory.
///
/// Every call authorizes against the token service first and then confines
/// the requested path to the project directory. Traversal components,
/// absolute paths and symlinks that resolve outside the project are all
/// rejected before any filesystem access happens.
use crate::config::HostConfig;
use crate::tokens::TokenService;
use crate::types::{HostError, Result, UserId};
use log::debug;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// One directory entry as reported to the front-end.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Resolve `rel` inside `base`, refusing anything that could land outside.
///
/// Only plain `Normal` components are accepted, so `..`, `.`, absolute paths
/// and empty paths never reach the join. The resolved path is then walked
/// component by component with `symlink_metadata`, and any symlink on the
/// way is refused outright. The link itself is inspected, never its target,
/// so a dangling link (whose target a later write would create) is caught
/// the same as a live one.
pub fn confine(base: &Path, rel: &str) -> Result<PathBuf> {
    if rel.is_empty() {
        return Err(HostError::Unauthorized("empty path".to_string()));
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(HostError::Unauthorized(
            "absolute paths are not allowed".to_string(),
        ));
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(HostError::Unauthorized(
                    "path escapes project directory".to_string(),
                ))
            }
        }
    }
    let canonical_base = base
        .canonicalize()
        .map_err(|_| HostError::NotFound("project directory missing".to_string()))?;

    let mut resolved = canonical_base;
    for component in rel_path.components() {
        resolved.push(component);
        if let Ok(meta) = std::fs::symlink_metadata(&resolved) {
            if meta.file_type().is_symlink() {
                return Err(HostError::Unauthorized(
                    "path escapes project directory".to_string(),
                ));
            }
        }
        // A missing component is fine: it names something a write is about
        // to create directly under the already-vetted parent.
    }
    Ok(resolved)
}

pub struct FileChannel {
    config: Arc<HostConfig>,
    tokens: Arc<TokenService>,
}

impl FileChannel {
    pub fn new(config: Arc<HostConfig>, tokens: Arc<TokenService>) -> Self {
        Self { config, tokens }
    }

    fn project_root(&self, token: &str, uid: UserId, project: &str) -> Result<PathBuf> {
        self.tokens.authorize(token, uid, project)?;
        let root = self.config.project_dir(uid, project);
        if !root.is_dir() {
            return Err(HostError::NotFound(format!("project '{project}' not found")));
        }
        Ok(root)
    }

    /// List entries of a directory inside the project. Pass `""` handled as
    /// the project root.
    pub fn list(
        &self,
        token: &str,
        uid: UserId,
        project: &str,
        rel: &str,
    ) -> Result<Vec<FileEntry>> {
        let root = self.project_root(token, uid, project)?;
        let dir = if rel.is_empty() {
            root
        } else {
            confine(&root, rel)?
        };
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                is_dir: meta.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn read_file(
        &self,
        token: &str,
        uid: UserId,
        project: &str,
        rel: &str,
    ) -> Result<Vec<u8>> {
        let root = self.project_root(token, uid, project)?;
        let path = confine(&root, rel)?;
        if !path.is_file() {
            return Err(HostError::NotFound(format!("no such file: {rel}")));
        }
        Ok(std::fs::read(&path)?)
    }

    /// Create or overwrite a file. Intermediate directories inside the
    /// project are created on demand.
    pub fn write_file(
        &self,
        token: &str,
        uid: UserId,
        project: &str,
        rel: &str,
        contents: &[u8],
    ) -> Result<()> {
        let root = self.project_root(token, uid, project)?;
        let path = confine(&root, rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        debug!("file channel wrote {} bytes to {}", contents.len(), path.display());
        Ok(())
    }

    /// Delete a file or an empty directory. Deleting something that is
    /// already gone reports `NotFound` rather than silently succeeding.
    pub fn delete(&self, token: &str, uid: UserId, project: &str, rel: &str) -> Result<()> {
        let root = self.project_root(token, uid, project)?;
        let path = confine(&root, rel)?;
        let meta = std::fs::symlink_metadata(&path)
            .map_err(|_| HostError::NotFound(format!("no such file: {rel}")))?;
        if meta.is_dir() {
            std::fs::remove_dir(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
