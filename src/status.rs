//! Data-directory health overview.
//!
//! Summarizes what's on disk: account count, processed bookmarks,
//! narratives, failure-ledger state, audit-log length. Malformed JSON
//! files are collected and reported rather than crashing the run — the
//! corrupt-document error exists precisely so this report can aggregate
//! them for the operator.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::account::AccountState;
use crate::context::StoreContext;
use crate::error::StoreError;
use crate::failure::FailureDoc;
use crate::narrative::{AuditEntry, NarrativeIndexDoc};
use crate::store::LockedStore;

/// Snapshot of data-directory health.
#[derive(Debug, Default)]
pub struct StatusReport {
    pub accounts: usize,
    pub processed_bookmarks: usize,
    pub narratives: usize,
    pub total_bookmark_count: u64,
    pub failure_records: usize,
    pub poison_pills: usize,
    pub audit_entries: u64,
    /// Files that exist but no longer parse. These need operator
    /// attention; auto-initializing them would discard real data.
    pub malformed_files: Vec<PathBuf>,
}

/// Walk the data directory and build a [`StatusReport`].
///
/// Reads are unlocked (diagnostics tolerate a slightly stale view; atomic
/// renames mean no torn reads), so a status run never blocks the pollers.
pub async fn run_status(ctx: &Arc<StoreContext>) -> Result<StatusReport> {
    let store = LockedStore::new(Arc::clone(ctx));
    let mut report = StatusReport::default();

    for path in json_files(&ctx.accounts_dir()).await? {
        match store.read_unlocked::<AccountState>(&path).await {
            Ok(state) => {
                report.accounts += 1;
                report.processed_bookmarks += state.processed.len();
            }
            Err(err) if err.is_corrupt() => {
                tracing::warn!(path = %path.display(), %err, "malformed account state file");
                report.malformed_files.push(path);
            }
            Err(err) => return Err(err.into()),
        }
    }

    let index_path = ctx.narrative_index_path();
    match store.read_unlocked::<NarrativeIndexDoc>(&index_path).await {
        Ok(index) => {
            report.narratives = index.narratives.len();
            report.total_bookmark_count = index.narratives.values().map(|n| n.bookmark_count).sum();
        }
        Err(err) if err.is_corrupt() => {
            tracing::warn!(path = %index_path.display(), %err, "malformed narrative index");
            report.malformed_files.push(index_path);
        }
        Err(err) => return Err(err.into()),
    }

    for path in json_files(&ctx.failures_dir()).await? {
        match store.read_unlocked::<FailureDoc>(&path).await {
            Ok(doc) => {
                if let Some(record) = doc.record {
                    report.failure_records += 1;
                    if record.poison_pill {
                        report.poison_pills += 1;
                    }
                }
            }
            Err(err) if err.is_corrupt() => {
                tracing::warn!(path = %path.display(), %err, "malformed failure record");
                report.malformed_files.push(path);
            }
            Err(err) => return Err(err.into()),
        }
    }

    let audit_entries = count_audit_entries(&ctx.audit_log_path(), &mut report).await?;
    report.audit_entries = audit_entries;

    Ok(report)
}

impl StatusReport {
    /// Print the report in `curio status` form.
    pub fn print(&self, ctx: &StoreContext) {
        println!("Curio — Store Status");
        println!("====================");
        println!();
        println!("  Data dir:    {}", ctx.data_dir().display());
        println!();
        println!("  Accounts:    {}", self.accounts);
        println!("  Processed:   {} bookmarks", self.processed_bookmarks);
        println!(
            "  Narratives:  {} ({} bookmarks indexed)",
            self.narratives, self.total_bookmark_count
        );
        println!(
            "  Failures:    {} ({} poison pills)",
            self.failure_records, self.poison_pills
        );
        println!("  Audit log:   {} entries", self.audit_entries);

        if !self.malformed_files.is_empty() {
            println!();
            println!(
                "  WARNING: {} malformed JSON file{} detected:",
                self.malformed_files.len(),
                if self.malformed_files.len() == 1 { "" } else { "s" }
            );
            for path in &self.malformed_files {
                println!("    {}", path.display());
            }
        }

        println!();
    }
}

async fn count_audit_entries(path: &Path, report: &mut StatusReport) -> Result<u64> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::io(path, e).into()),
    };

    let mut entries = 0u64;
    let mut damaged = false;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<AuditEntry>(line) {
            Ok(_) => entries += 1,
            Err(_) => damaged = true,
        }
    }
    if damaged {
        report.malformed_files.push(path.to_path_buf());
    }
    Ok(entries)
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e).into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(dir, e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
