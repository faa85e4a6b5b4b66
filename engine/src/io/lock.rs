//! Cross-process session lock.
//!
//! A single well-known file under `.engineo/`. Holding it means this process
//! may spawn the agent and mutate ledgers. A second engine process fails fast
//! instead of waiting.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

/// The lock is held by another live session.
#[derive(Debug, thiserror::Error)]
#[error("session lock {path} held by pid {pid} on {host} since {acquired_at}")]
pub struct LockHeld {
    pub path: PathBuf,
    pub pid: u32,
    pub host: String,
    pub acquired_at: String,
}

/// The lock file no longer belongs to this session.
#[derive(Debug, thiserror::Error)]
#[error("session lock {path} was taken over (now pid {holder_pid:?})")]
pub struct LockLost {
    pub path: PathBuf,
    pub holder_pid: Option<u32>,
}

/// Held session lock; released on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    info: LockInfo,
}

impl SessionLock {
    /// Acquire the lock or fail immediately.
    ///
    /// A lock whose last refresh is older than `stale_after` is reclaimed.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self> {
        Self::acquire_at(path, stale_after, Utc::now())
    }

    pub fn acquire_at(path: &Path, stale_after: Duration, now: DateTime<Utc>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let info = LockInfo {
            pid: std::process::id(),
            host: hostname(),
            acquired_at: now,
            refreshed_at: now,
        };

        match create_exclusive(path, &info) {
            Ok(()) => {
                debug!(path = %path.display(), "session lock acquired");
                return Ok(Self {
                    path: path.to_path_buf(),
                    info,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("create lock {}", path.display()));
            }
        }

        let existing = read_lock(path);
        let last_seen = existing
            .as_ref()
            .map(|held| held.refreshed_at)
            .or_else(|| file_mtime(path))
            .unwrap_or(now);
        if now - last_seen < stale_after {
            let held = existing.unwrap_or(LockInfo {
                pid: 0,
                host: "unknown".to_string(),
                acquired_at: last_seen,
                refreshed_at: last_seen,
            });
            return Err(LockHeld {
                path: path.to_path_buf(),
                pid: held.pid,
                host: held.host,
                acquired_at: held.acquired_at.to_rfc3339(),
            }
            .into());
        }

        warn!(
            path = %path.display(),
            last_seen = %last_seen.to_rfc3339(),
            "reclaiming stale session lock"
        );
        fs::remove_file(path).with_context(|| format!("remove stale lock {}", path.display()))?;
        // Another process may have reclaimed it between remove and create;
        // create_new keeps that race safe.
        create_exclusive(path, &info).map_err(|err| {
            if err.kind() == ErrorKind::AlreadyExists {
                anyhow::Error::new(LockHeld {
                    path: path.to_path_buf(),
                    pid: 0,
                    host: "unknown".to_string(),
                    acquired_at: now.to_rfc3339(),
                })
            } else {
                anyhow::Error::new(err).context(format!("create lock {}", path.display()))
            }
        })?;
        info!(path = %path.display(), "stale session lock reclaimed");
        Ok(Self {
            path: path.to_path_buf(),
            info,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Bump `refreshedAt` so a long-running session is not considered stale.
    ///
    /// Fails with [`LockLost`] if another session reclaimed the file.
    pub fn refresh(&mut self) -> Result<()> {
        match read_lock(&self.path) {
            Some(current) if self.owns(&current) => {}
            current => {
                return Err(LockLost {
                    path: self.path.clone(),
                    holder_pid: current.map(|held| held.pid),
                }
                .into());
            }
        }
        self.info.refreshed_at = Utc::now();
        let mut buf = serde_json::to_string_pretty(&self.info).context("serialize lock")?;
        buf.push('\n');
        crate::io::ledger::write_atomic(&self.path, &buf)
    }

    fn owns(&self, current: &LockInfo) -> bool {
        current.pid == self.info.pid && current.acquired_at == self.info.acquired_at
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours; a stale reclaim by another
        // process must not be undone.
        match read_lock(&self.path) {
            Some(current) if self.owns(&current) => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), err = %err, "failed to release session lock");
                }
            }
            _ => debug!(path = %self.path.display(), "session lock no longer ours, leaving it"),
        }
    }
}

/// A held lock refreshed from a background thread every `interval`.
///
/// Guardrails and verification block the main thread, so the heartbeat in
/// the agent loop alone cannot keep the lock fresh. The refresher stops on
/// the first failed refresh; dropping the keeper stops it and releases the
/// lock.
pub struct LockKeeper {
    lock: Arc<Mutex<SessionLock>>,
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LockKeeper {
    pub fn start(lock: SessionLock, interval: std::time::Duration) -> Self {
        let lock = Arc::new(Mutex::new(lock));
        let (stop, stopped) = mpsc::channel::<()>();
        let shared = Arc::clone(&lock);
        let worker = thread::spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                if let Err(err) = refresh_shared(&shared) {
                    warn!(err = %err, "session lock refresh failed; refresher stopped");
                    break;
                }
            }
        });
        Self {
            lock,
            stop: Some(stop),
            worker: Some(worker),
        }
    }

    /// Refresh now, in addition to the timer.
    pub fn refresh(&self) -> Result<()> {
        refresh_shared(&self.lock)
    }

    pub fn info(&self) -> Result<LockInfo> {
        let lock = self
            .lock
            .lock()
            .map_err(|_| anyhow!("session lock mutex poisoned"))?;
        Ok(lock.info().clone())
    }
}

impl Drop for LockKeeper {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("session lock refresher panicked");
        }
    }
}

fn refresh_shared(lock: &Mutex<SessionLock>) -> Result<()> {
    lock.lock()
        .map_err(|_| anyhow!("session lock mutex poisoned"))?
        .refresh()
}

fn create_exclusive(path: &Path, info: &LockInfo) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut buf = serde_json::to_string_pretty(info).map_err(std::io::Error::other)?;
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    file.sync_all()
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified: SystemTime = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.into())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
