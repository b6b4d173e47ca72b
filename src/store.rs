//! Lock-guarded transactions over single JSON documents.
//!
//! [`LockedStore`] composes the file lock with the safe reader and atomic
//! writer: acquire the lock, read the current document (default when
//! absent), run the caller's mutation, write atomically, release. A
//! mutator error still releases the lock, writes nothing, and propagates
//! unchanged.
//!
//! Transactions against the same document are linearized by the lock;
//! different documents run fully concurrently. An in-process mutex is
//! taken first so same-process contention resolves without filesystem
//! retry storms.
//!
//! Persisted shapes implement [`DocumentSchema`]: an explicit default for
//! first access, a schema version, and an explicit migration hook instead
//! of ad hoc field probing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::StoreContext;
use crate::docfile;
use crate::error::StoreError;
use crate::lock::FileLock;

/// Permission bits for persisted documents. Personal data; owner-only.
const DOCUMENT_MODE: u32 = 0o600;

/// A versioned document persisted through the store.
pub trait DocumentSchema: Serialize + DeserializeOwned + Default + Send + Sync {
    /// Schema version written by this build. The serialized document must
    /// carry it in a top-level `version` field.
    const VERSION: u32;

    /// Upgrade a document persisted under a different version. The default
    /// refuses, so bumping [`VERSION`](Self::VERSION) forces the matching
    /// migration to be written.
    fn migrate(version: u32, _raw: serde_json::Value) -> Result<Self, String> {
        Err(format!(
            "no migration from document version {version} to {}",
            Self::VERSION
        ))
    }
}

/// Read-modify-write transaction primitive over one JSON document.
pub struct LockedStore {
    ctx: Arc<StoreContext>,
}

impl LockedStore {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    /// Run `mutator` against the document at `path` under the lock and
    /// persist the result atomically.
    pub async fn transact<D, T, F>(&self, path: &Path, mutator: F) -> Result<T>
    where
        D: DocumentSchema,
        F: FnOnce(&mut D) -> Result<T>,
    {
        let guard = self.acquire(path).await?;

        let result = async {
            let mut doc = read_document::<D>(path).await?;
            let out = mutator(&mut doc)?;
            docfile::write_json_atomic(path, &doc, Some(DOCUMENT_MODE)).await?;
            Ok::<T, anyhow::Error>(out)
        }
        .await;

        let released = guard.release().await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// Locked read without persisting. Still takes the lock so the
    /// snapshot can never interleave with a writer's mutation.
    pub async fn snapshot<D: DocumentSchema>(&self, path: &Path) -> Result<D> {
        let guard = self.acquire(path).await?;
        let result = read_document::<D>(path).await;
        let released = guard.release().await;
        let doc = result?;
        released?;
        Ok(doc)
    }

    /// Unlocked read for diagnostics. Safe against torn bytes only because
    /// writes are atomic renames; for a consistent view use
    /// [`snapshot`](Self::snapshot).
    pub async fn read_unlocked<D: DocumentSchema>(&self, path: &Path) -> Result<D, StoreError> {
        read_document(path).await
    }

    /// Delete the document under its lock (e.g. clearing a failure
    /// record). Absent documents are fine.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        let guard = self.acquire(path).await?;
        let result = match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        };
        let released = guard.release().await;
        result?;
        released?;
        Ok(())
    }

    async fn acquire(&self, path: &Path) -> Result<HeldLock, StoreError> {
        let key = document_key(path);
        let lock_config = self.ctx.config().lock.clone();

        // In-process first: threads in this process queue on a mutex
        // instead of hammering the sidecar file.
        let local = self.ctx.local_lock(path);
        let local_guard = tokio::time::timeout(
            Duration::from_millis(lock_config.timeout_ms),
            local.lock_owned(),
        )
        .await
        .map_err(|_| StoreError::LockTimeout {
            key: key.clone(),
            waited_ms: lock_config.timeout_ms,
        })?;

        let file_lock = FileLock::new(
            StoreContext::lock_path_for(path),
            key,
            lock_config,
            self.ctx.probe(),
        );
        let file_guard = file_lock.acquire().await?;

        Ok(HeldLock {
            _local: local_guard,
            file: file_guard,
        })
    }
}

/// Both levels of the lock, released together.
struct HeldLock {
    _local: tokio::sync::OwnedMutexGuard<()>,
    file: crate::lock::LockGuard,
}

impl HeldLock {
    async fn release(self) -> Result<(), StoreError> {
        self.file.release().await
    }
}

async fn read_document<D: DocumentSchema>(path: &Path) -> Result<D, StoreError> {
    match docfile::read_json_value(path).await? {
        None => Ok(D::default()),
        Some(raw) => {
            let version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            if version == D::VERSION {
                serde_json::from_value(raw).map_err(|e| StoreError::corrupt(path, e.to_string()))
            } else {
                D::migrate(version, raw).map_err(|reason| StoreError::corrupt(path, reason))
            }
        }
    }
}

fn document_key(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize)]
    struct Counter {
        version: u32,
        count: u64,
    }

    impl Default for Counter {
        fn default() -> Self {
            Self {
                version: Self::VERSION,
                count: 0,
            }
        }
    }

    impl DocumentSchema for Counter {
        const VERSION: u32 = 2;

        fn migrate(version: u32, raw: serde_json::Value) -> Result<Self, String> {
            // v1 stored the count under "n".
            if version == 1 {
                let count = raw.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
                return Ok(Self {
                    version: Self::VERSION,
                    count,
                });
            }
            Err(format!("no migration from version {version}"))
        }
    }

    fn setup() -> (TempDir, LockedStore, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(Config::with_data_dir(dir.path()));
        let path = dir.path().join("counter.json");
        (dir, LockedStore::new(ctx), path)
    }

    #[tokio::test]
    async fn test_transact_initializes_default_and_persists() {
        let (_dir, store, path) = setup();

        let seen = store
            .transact::<Counter, _, _>(&path, |doc| {
                let before = doc.count;
                doc.count += 1;
                Ok(before)
            })
            .await
            .unwrap();
        assert_eq!(seen, 0);

        let doc: Counter = store.snapshot(&path).await.unwrap();
        assert_eq!(doc.count, 1);
    }

    #[tokio::test]
    async fn test_mutator_error_writes_nothing_and_releases_lock() {
        let (_dir, store, path) = setup();

        store
            .transact::<Counter, _, _>(&path, |doc| {
                doc.count = 10;
                Ok(())
            })
            .await
            .unwrap();

        let err = store
            .transact::<Counter, (), _>(&path, |doc| {
                doc.count = 99;
                anyhow::bail!("classifier exploded")
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("classifier exploded"));

        // Nothing written, and the lock was released (next transact works).
        let doc: Counter = store.snapshot(&path).await.unwrap();
        assert_eq!(doc.count, 10);
        assert!(!StoreContext::lock_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_migration_applies_on_version_mismatch() {
        let (_dir, store, path) = setup();
        std::fs::write(&path, br#"{"version": 1, "n": 7}"#).unwrap();

        let doc: Counter = store.snapshot(&path).await.unwrap();
        assert_eq!(doc.count, 7);
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_unknown_version_is_corrupt() {
        let (_dir, store, path) = setup();
        std::fs::write(&path, br#"{"version": 9, "count": 7}"#).unwrap();

        let err = store.snapshot::<Counter>(&path).await.unwrap_err();
        let store_err = err.downcast_ref::<StoreError>().unwrap();
        assert!(store_err.is_corrupt(), "{store_err}");
    }

    #[tokio::test]
    async fn test_remove_clears_document() {
        let (_dir, store, path) = setup();
        store
            .transact::<Counter, _, _>(&path, |_| Ok(()))
            .await
            .unwrap();
        assert!(path.exists());

        store.remove(&path).await.unwrap();
        assert!(!path.exists());

        // Removing again is fine.
        store.remove(&path).await.unwrap();
    }
}
