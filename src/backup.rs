/// Backup & rotation manager.
///
/// Bundles are gzip-compressed tar archives of the whole projects tree plus
/// the state document, named by UTC timestamp to second resolution so that
/// sort-by-name equals sort-by-time. Rotation keeps the most-recent-N
/// bundles by modification time and runs only after a successful new bundle,
/// so a failed archive write never shrinks the existing set.
use crate::config::HostConfig;
use crate::notify::Notifier;
use crate::types::{HostError, Notification, Result};
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

const BUNDLE_PREFIX: &str = "backup_";
const BUNDLE_SUFFIX: &str = ".tar.gz";

pub struct BackupManager {
    config: Arc<HostConfig>,
}

impl BackupManager {
    pub fn new(config: Arc<HostConfig>) -> Self {
        Self { config }
    }

    /// Archive the projects tree and state document into a fresh bundle.
    /// The archive is written under a temp name and renamed into place, so a
    /// half-written bundle never appears in listings.
    pub fn run_backup(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.backup_dir)?;
        let dest = self.next_bundle_path();
        let tmp = self
            .config
            .backup_dir
            .join(format!(".tmp_bundle.{}", std::process::id()));

        let result = self.write_archive(&tmp);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(HostError::Resource(format!("archive write failed: {e}")));
        }
        std::fs::rename(&tmp, &dest)?;
        info!("backup bundle written: {}", dest.display());
        Ok(dest)
    }

    fn write_archive(&self, tmp: &std::path::Path) -> std::io::Result<()> {
        let file = File::create(tmp)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let users_dir = self.config.users_dir();
        if users_dir.is_dir() {
            builder.append_dir_all("users", &users_dir)?;
        }
        let state_path = self.config.state_path();
        if state_path.is_file() {
            builder.append_path_with_name(&state_path, "state.json")?;
        }
        let encoder = builder.into_inner()?;
        encoder.finish()?;
        Ok(())
    }

    /// Monotonically increasing bundle name; a second-resolution collision
    /// (two backups inside one second) gets a numeric suffix.
    fn next_bundle_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let base = self
            .config
            .backup_dir
            .join(format!("{BUNDLE_PREFIX}{stamp}{BUNDLE_SUFFIX}"));
        if !base.exists() {
            return base;
        }
        for n in 1.. {
            let candidate = self
                .config
                .backup_dir
                .join(format!("{BUNDLE_PREFIX}{stamp}-{n}{BUNDLE_SUFFIX}"));
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!()
    }

    /// Delete bundles beyond the newest `keep`, ordered by modification time
    /// descending. Returns how many were removed.
    pub fn rotate(&self, keep: usize) -> Result<usize> {
        let mut bundles: Vec<(SystemTime, PathBuf)> = Vec::new();
        let dir = match std::fs::read_dir(&self.config.backup_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(BUNDLE_PREFIX) || !name.ends_with(BUNDLE_SUFFIX) {
                continue;
            }
            let modified = entry
                .metadata()?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            bundles.push((modified, entry.path()));
        }
        bundles.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (_, path) in bundles.into_iter().skip(keep) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("failed to prune bundle {}: {e}", path.display()),
            }
        }
        Ok(removed)
    }

    /// Backup, then rotate. Rotation is skipped entirely when the backup
    /// fails — an old bundle is better than none.
    pub fn run_and_rotate(&self) -> Result<PathBuf> {
        let bundle = self.run_backup()?;
        let removed = self.rotate(self.config.backup_keep)?;
        if removed > 0 {
            info!("pruned {removed} old backup bundle(s)");
        }
        Ok(bundle)
    }
}

pub struct BackupLoop {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl BackupLoop {
    /// Periodic backup thread. A failed cycle is logged and reported to the
    /// front-end; the loop keeps running.
    pub fn spawn(config: Arc<HostConfig>, notifier: Notifier) -> Self {
        let interval: Duration = config.backup_interval;
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        let thread = std::thread::Builder::new()
            .name("backup-loop".to_string())
            .spawn(move || {
                info!("backup loop started (interval {interval:?})");
                let manager = BackupManager::new(config);
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = manager.run_and_rotate() {
                                warn!("periodic backup failed: {e}");
                                notifier.emit(Notification::BackupFailed {
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
                info!("backup loop stopped");
            })
            .expect("failed to spawn backup thread");
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
