//! Crash-tolerant advisory file locking.
//!
//! Mutual exclusion between independent processes is built on a sidecar
//! lock file (`<document>.lock`) created with `O_CREAT | O_EXCL` and
//! containing a JSON [`LockRecord`] identifying the holder. A lock whose
//! holder process is no longer running is stale and may be reclaimed by
//! the next acquirer.
//!
//! The one edge case that matters: an *unparseable* sidecar is only stale
//! once it is older than the staleness threshold. A fresh unparseable file
//! means another process is mid-creation, and stealing it would corrupt
//! the exclusion guarantee.
//!
//! Contention is retried with exponential backoff (50ms doubling to a 1s
//! cap by default) until the wait budget elapses, then fails loudly with
//! [`StoreError::LockTimeout`] rather than hanging forever.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::LockConfig;
use crate::error::StoreError;

/// Liveness probe for lock-holder processes.
///
/// Kept as a seam so staleness detection can be implemented per host OS
/// (or faked in tests) without leaking platform details into the locking
/// algorithm.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the host OS.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        #[cfg(unix)]
        {
            // kill -0 checks existence without delivering a signal.
            let status = std::process::Command::new("kill")
                .args(["-0", &pid.to_string()])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
            matches!(status, Ok(s) if s.success())
        }
        #[cfg(not(unix))]
        {
            // No cheap probe available; assume alive so a live holder's
            // lock is never stolen.
            let _ = pid;
            true
        }
    }
}

/// Sidecar record identifying the current lock holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockRecord {
    holder_id: u32,
    acquired_at: DateTime<Utc>,
}

/// An exclusively held lock. Release explicitly with [`LockGuard::release`];
/// dropping the guard removes the sidecar on a best-effort basis.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    key: String,
    released: bool,
}

/// Advisory lock scoped to one logical key, backed by a sidecar file.
pub struct FileLock {
    path: PathBuf,
    key: String,
    config: LockConfig,
    probe: Arc<dyn ProcessProbe>,
}

impl FileLock {
    pub fn new(
        path: impl Into<PathBuf>,
        key: impl Into<String>,
        config: LockConfig,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            config,
            probe,
        }
    }

    /// Acquire the lock, retrying with exponential backoff until the
    /// configured wait budget elapses.
    pub async fn acquire(&self) -> Result<LockGuard, StoreError> {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut delay = Duration::from_millis(self.config.initial_backoff_ms);

        loop {
            if self.try_create().await? {
                return Ok(LockGuard {
                    path: self.path.clone(),
                    key: self.key.clone(),
                    released: false,
                });
            }

            if self.reclaim_if_stale().await? {
                // Sidecar removed (or it vanished on its own); retry the
                // exclusive create right away. Losing that race to another
                // process is normal contention.
                continue;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(StoreError::LockTimeout {
                    key: self.key.clone(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }

            tokio::time::sleep(delay.min(timeout - elapsed)).await;
            delay = (delay * 2).min(max_backoff);
        }
    }

    /// Attempt the exclusive create. `Ok(false)` means the lock is held.
    async fn try_create(&self) -> Result<bool, StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let record = LockRecord {
            holder_id: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&record)
            .map_err(|e| StoreError::io(&self.path, std::io::Error::new(ErrorKind::InvalidData, e)))?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        file.write_all(&body)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(true)
    }

    /// Check the existing sidecar for staleness; remove it if stale.
    /// Returns true when the caller should retry the exclusive create
    /// immediately.
    async fn reclaim_if_stale(&self) -> Result<bool, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) => {
                if self.probe.is_alive(record.holder_id) {
                    return Ok(false);
                }
                tracing::warn!(
                    key = %self.key,
                    holder_id = record.holder_id,
                    "reclaiming lock left by dead holder"
                );
                self.remove_sidecar().await?;
                Ok(true)
            }
            Err(_) => {
                // Unreadable record: another process may be mid-write.
                // Only reclaim once the file is older than the staleness
                // threshold.
                let meta = match tokio::fs::metadata(&self.path).await {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
                    Err(e) => return Err(StoreError::io(&self.path, e)),
                };
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok());
                match age {
                    Some(age) if age >= Duration::from_secs(self.config.staleness_secs) => {
                        tracing::warn!(
                            key = %self.key,
                            age_secs = age.as_secs(),
                            "reclaiming unreadable lock older than staleness threshold"
                        );
                        self.remove_sidecar().await?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
        }
    }

    async fn remove_sidecar(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            // Another process reclaimed first; treat as normal contention.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

impl LockGuard {
    /// Release the lock, deleting the sidecar only if this process still
    /// owns it. An ownership mismatch (the lock was reclaimed from us) is
    /// logged and swallowed — it must never crash the caller.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        match release_owned(&self.path, &self.key).await {
            Err(err @ StoreError::LockOwnershipMismatch { .. }) => {
                tracing::warn!(key = %self.key, %err, "skipping release of lock we no longer own");
                Ok(())
            }
            other => other,
        }
    }
}

async fn release_owned(path: &Path, key: &str) -> Result<(), StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        // Already gone; nothing to release.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let holder_id = match serde_json::from_slice::<LockRecord>(&bytes) {
        Ok(record) => record.holder_id,
        // Someone else is mid-write of a replacement record; not ours.
        Err(_) => 0,
    };

    if holder_id != std::process::id() {
        return Err(StoreError::LockOwnershipMismatch {
            key: key.to_string(),
            holder_id,
        });
    }

    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best-effort synchronous cleanup with the same ownership check.
        let owned = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok())
            .map(|record| record.holder_id == std::process::id())
            .unwrap_or(false);
        if owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct NeverAlive;
    impl ProcessProbe for NeverAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    struct AlwaysAlive;
    impl ProcessProbe for AlwaysAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
    }

    fn lock_at(
        dir: &TempDir,
        config: LockConfig,
        probe: Arc<dyn ProcessProbe>,
    ) -> (FileLock, PathBuf) {
        let path = dir.path().join("doc.json.lock");
        (FileLock::new(&path, "doc", config, probe), path)
    }

    fn short_timeout() -> LockConfig {
        LockConfig {
            timeout_ms: 250,
            ..LockConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_release_removes_sidecar() {
        let dir = TempDir::new().unwrap();
        let (lock, path) = lock_at(&dir, LockConfig::default(), Arc::new(SystemProbe));

        let guard = lock.acquire().await.unwrap();
        assert!(path.exists());
        guard.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_contention_with_live_holder_times_out() {
        let dir = TempDir::new().unwrap();
        let (lock, path) = lock_at(&dir, short_timeout(), Arc::new(AlwaysAlive));

        // Simulate another process's live lock.
        let record = serde_json::json!({ "holderId": 1, "acquiredAt": Utc::now() });
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let err = lock.acquire().await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }), "{err}");
        assert!(path.exists(), "live lock must not be stolen");
    }

    #[tokio::test]
    async fn test_dead_holder_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let (lock, path) = lock_at(&dir, short_timeout(), Arc::new(NeverAlive));

        let record = serde_json::json!({ "holderId": 999_999, "acquiredAt": Utc::now() });
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let guard = lock.acquire().await.unwrap();
        guard.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_fresh_unparseable_lock_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let (lock, path) = lock_at(&dir, short_timeout(), Arc::new(SystemProbe));

        // Just-written garbage: could be another process mid-creation.
        std::fs::write(&path, b"{half a reco").unwrap();

        let err = lock.acquire().await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }), "{err}");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_old_unparseable_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let config = LockConfig {
            timeout_ms: 250,
            staleness_secs: 0,
            ..LockConfig::default()
        };
        let (lock, path) = lock_at(&dir, config, Arc::new(SystemProbe));

        std::fs::write(&path, b"not json at all").unwrap();

        let guard = lock.acquire().await.unwrap();
        guard.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_leaves_sidecar() {
        let dir = TempDir::new().unwrap();
        let (lock, path) = lock_at(&dir, LockConfig::default(), Arc::new(SystemProbe));

        let guard = lock.acquire().await.unwrap();

        // Another process reclaimed and re-acquired behind our back.
        let record = serde_json::json!({ "holderId": 1, "acquiredAt": Utc::now() });
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        // Swallowed, not an error.
        guard.release().await.unwrap();
        assert!(path.exists(), "non-owner release must not delete the lock");
    }
}
