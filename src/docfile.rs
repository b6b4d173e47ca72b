//! Safe JSON document reads and atomic writes.
//!
//! Reads distinguish "absent" (caller takes a default) from "corrupt"
//! (present but empty or unparseable — surfaced as
//! [`StoreError::CorruptDocument`], never silently defaulted).
//!
//! Writes go to a uniquely named temporary file in the same directory and
//! are renamed onto the final path, so the rename stays on one filesystem
//! and readers never observe a partial document. On any failure the
//! temporary file is removed and the destination is left untouched.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;

/// Read and parse a JSON document. Returns `None` when the path does not
/// exist.
pub async fn read_json<D: DeserializeOwned>(path: &Path) -> Result<Option<D>, StoreError> {
    match read_json_value(path).await? {
        None => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::corrupt(path, e.to_string())),
    }
}

/// Read a JSON document as a raw value, for callers that inspect the shape
/// (e.g. schema version) before deserializing.
pub async fn read_json_value(path: &Path) -> Result<Option<serde_json::Value>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    if bytes.is_empty() {
        return Err(StoreError::corrupt(path, "file exists but is empty"));
    }

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::corrupt(path, e.to_string()))
}

/// Serialize `value` and atomically replace the document at `path`.
///
/// `mode` sets the permission bits on the new file (unix only; ignored
/// elsewhere).
pub async fn write_json_atomic<D: Serialize>(
    path: &Path,
    value: &D,
    mode: Option<u32>,
) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::io(path, std::io::Error::new(ErrorKind::InvalidData, e)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp_path = temp_sibling(path);
    match write_temp_then_rename(path, &tmp_path, &body, mode).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            Err(e)
        }
    }
}

async fn write_temp_then_rename(
    path: &Path,
    tmp_path: &Path,
    body: &[u8],
    mode: Option<u32>,
) -> Result<(), StoreError> {
    tokio::fs::write(tmp_path, body)
        .await
        .map_err(|e| StoreError::io(tmp_path, e))?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(tmp_path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| StoreError::io(tmp_path, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

/// Unique temp name in the same directory, so the rename is atomic.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "doc".to_string());
    path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        name,
        std::process::id(),
        Uuid::new_v4().simple()
    ))
}
