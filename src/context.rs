//! Explicitly constructed store context.
//!
//! Everything that used to be ambient — data-directory layout, lock
//! tuning, the process-liveness probe, per-key in-process locks — lives on
//! [`StoreContext`] and is passed explicitly. Tests build a fresh context
//! per case and drop it for teardown; there is no module-level state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::lock::{ProcessProbe, SystemProbe};

/// Shared context for all store consumers.
pub struct StoreContext {
    config: Config,
    probe: Arc<dyn ProcessProbe>,
    /// In-process mutex per document path, taken before the file lock so
    /// same-process contention never hits the filesystem retry loop.
    local_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl StoreContext {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_probe(config, Arc::new(SystemProbe))
    }

    /// Construct with a custom liveness probe (tests, exotic platforms).
    pub fn with_probe(config: Config, probe: Arc<dyn ProcessProbe>) -> Arc<Self> {
        Arc::new(Self {
            config,
            probe,
            local_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn probe(&self) -> Arc<dyn ProcessProbe> {
        Arc::clone(&self.probe)
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data.dir
    }

    pub fn accounts_dir(&self) -> PathBuf {
        self.data_dir().join("accounts")
    }

    pub fn account_state_path(&self, username: &str) -> PathBuf {
        self.accounts_dir()
            .join(format!("{}.json", sanitize_component(username)))
    }

    pub fn narratives_dir(&self) -> PathBuf {
        self.data_dir().join("narratives")
    }

    pub fn narrative_index_path(&self) -> PathBuf {
        self.narratives_dir().join("index.json")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.narratives_dir().join("audit.ndjson")
    }

    pub fn failures_dir(&self) -> PathBuf {
        self.data_dir().join("failures")
    }

    pub fn failure_record_path(&self, account: &str, item_id: &str) -> PathBuf {
        self.failures_dir().join(format!(
            "{}__{}.json",
            sanitize_component(account),
            sanitize_component(item_id)
        ))
    }

    /// Sidecar lock path for a document.
    pub fn lock_path_for(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{name}.lock"))
    }

    /// The in-process mutex guarding a document path.
    pub(crate) fn local_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .local_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            map.entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Make a logical key safe to embed in a filename.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
