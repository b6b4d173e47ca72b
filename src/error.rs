//! Store error type.
//!
//! Corruption is deliberately a distinct variant from I/O failure: a
//! missing file initializes to a default document, but a file that exists
//! and no longer parses must surface to the operator instead of being
//! silently replaced.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The file exists but its contents cannot be decoded (or its schema
    /// version cannot be migrated). Never auto-initialized.
    #[error("corrupt document at '{path}': {reason}")]
    CorruptDocument { path: PathBuf, reason: String },

    /// The lock wait budget elapsed without acquiring the sidecar.
    #[error("timed out acquiring lock for '{key}' after {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Release found the sidecar held by someone else (our lock was
    /// reclaimed out from under us).
    #[error("lock for '{key}' is held by {holder_id}, not this process")]
    LockOwnershipMismatch { key: String, holder_id: u32 },

    #[error("io error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::CorruptDocument {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// True for documents that exist but cannot be decoded.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptDocument { .. })
    }
}
