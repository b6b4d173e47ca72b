//! Deduplicated narrative index with audit trail.
//!
//! Narratives are the topics bookmarks get clustered under. The index is a
//! single JSON document mutated only inside [`LockedStore`] transactions,
//! so concurrent upserts across many bookmarks are strictly serialized and
//! no update is ever lost. Uniqueness is one narrative per distinct
//! *normalized* label — `"AI Development"` and `"ai development"` are the
//! same topic.
//!
//! The incremental upsert and the from-scratch rebuild share one
//! `apply_assignment` routine, which is what makes the rebuild invariant
//! hold: replaying the persisted processed-bookmark records yields the
//! same per-narrative counts as the incremental path, independent of
//! update order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::context::StoreContext;
use crate::error::StoreError;
use crate::models::{CandidateRef, Confidence, NarrativeAssignment};
use crate::store::{DocumentSchema, LockedStore};
use crate::traits::ProcessedRecordSource;

/// Lifecycle state of a narrative. Archival and merging are not in scope,
/// so narratives only ever exist as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeStatus {
    Active,
}

/// One deduplicated topic and its bookmark membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Narrative {
    pub id: String,
    pub slug: String,
    /// Display label, exactly as first seen.
    pub label: String,
    /// Canonical form used as the dedup key; never displayed.
    pub normalized_label: String,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    pub status: NarrativeStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub bookmark_count: u64,
    /// Bounded window of member bookmark IDs, most-recent-last.
    #[serde(default)]
    pub recent_bookmark_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_summary: Option<String>,
}

/// The persisted index document: narrative id → narrative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeIndexDoc {
    pub version: u32,
    pub narratives: BTreeMap<String, Narrative>,
}

impl Default for NarrativeIndexDoc {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            narratives: BTreeMap::new(),
        }
    }
}

impl DocumentSchema for NarrativeIndexDoc {
    const VERSION: u32 = 1;
}

/// Result of an upsert that matched or created a narrative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// The resolved narrative — may differ from the assignment's
    /// `narrative_id` when dedup matched by label.
    pub narrative_id: String,
    /// The resolved narrative's display label. Persist this with the
    /// processed record so a rebuild replays the same decision.
    pub label: String,
    pub created: bool,
}

/// One classification decision, recorded append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub bookmark_id: String,
    pub candidates_presented: Vec<CandidateRef>,
    pub decision: AuditDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_confidence_candidate: Option<CandidateRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditDecision {
    pub narrative_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative_label: Option<String>,
    pub narrative_confidence: Confidence,
}

/// Summary returned by [`NarrativeIndex::rebuild`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildSummary {
    pub replayed: u64,
    pub skipped: u64,
    pub narratives: usize,
}

/// Canonical dedup key for a label: lowercase, ASCII word characters,
/// hyphens and single spaces only. Non-ASCII letters are dropped, not
/// transliterated.
pub fn normalize_label(label: &str) -> String {
    let lowered = label.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// URL-safe slug: lowercase, non-alphanumeric runs become one hyphen, no
/// leading/trailing hyphens. Input with no alphanumerics slugs to "".
pub fn slugify(label: &str) -> String {
    let mut out = String::new();
    let mut pending_hyphen = false;
    for c in label.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// The four-case upsert, shared verbatim by the incremental path and the
/// rebuild so their results cannot drift.
fn apply_assignment(
    doc: &mut NarrativeIndexDoc,
    bookmark_id: &str,
    assignment: &NarrativeAssignment,
    now: DateTime<Utc>,
    recent_cap: usize,
) -> Option<UpsertOutcome> {
    // Case 1: assignment names a narrative we already have.
    if let Some(id) = assignment.narrative_id.as_deref() {
        if let Some(narrative) = doc.narratives.get_mut(id) {
            touch(narrative, bookmark_id, now, recent_cap);
            return Some(UpsertOutcome {
                narrative_id: id.to_string(),
                label: narrative.label.clone(),
                created: false,
            });
        }
    }

    // Case 2: no usable label — refuse to create. This is what keeps
    // label-less classifier output from minting junk narratives.
    let label = assignment
        .narrative_label
        .as_deref()
        .map(str::trim)
        .unwrap_or("");
    if label.is_empty() {
        return None;
    }

    // Case 3: dedup by normalized label, not exact string.
    let normalized = normalize_label(label);
    if let Some(existing) = doc
        .narratives
        .values_mut()
        .find(|n| n.normalized_label == normalized)
    {
        touch(existing, bookmark_id, now, recent_cap);
        return Some(UpsertOutcome {
            narrative_id: existing.id.clone(),
            label: existing.label.clone(),
            created: false,
        });
    }

    // Case 4: new narrative.
    let id = Uuid::new_v4().to_string();
    let narrative = Narrative {
        id: id.clone(),
        slug: slugify(label),
        label: label.to_string(),
        normalized_label: normalized,
        aliases: BTreeSet::new(),
        status: NarrativeStatus::Active,
        created_at: now,
        last_updated_at: now,
        bookmark_count: 1,
        recent_bookmark_ids: vec![bookmark_id.to_string()],
        current_summary: None,
    };
    doc.narratives.insert(id.clone(), narrative);
    Some(UpsertOutcome {
        narrative_id: id,
        label: label.to_string(),
        created: true,
    })
}

fn touch(narrative: &mut Narrative, bookmark_id: &str, now: DateTime<Utc>, recent_cap: usize) {
    narrative.bookmark_count += 1;
    narrative.recent_bookmark_ids.push(bookmark_id.to_string());
    let len = narrative.recent_bookmark_ids.len();
    if len > recent_cap {
        narrative.recent_bookmark_ids.drain(0..len - recent_cap);
    }
    narrative.last_updated_at = now;
}

/// The narrative catalog, built entirely on [`LockedStore`] transactions.
pub struct NarrativeIndex {
    ctx: Arc<StoreContext>,
    store: LockedStore,
}

impl NarrativeIndex {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self {
            store: LockedStore::new(Arc::clone(&ctx)),
            ctx,
        }
    }

    fn index_path(&self) -> PathBuf {
        self.ctx.narrative_index_path()
    }

    /// Apply one classification result to the index inside a transaction.
    ///
    /// Returns `None` when the assignment had neither a known narrative id
    /// nor a usable label (nothing was created).
    pub async fn upsert_from_assignment(
        &self,
        bookmark_id: &str,
        assignment: &NarrativeAssignment,
    ) -> Result<Option<UpsertOutcome>> {
        let cap = self.ctx.config().narratives.recent_ids_cap;
        let bookmark_id = bookmark_id.to_string();
        let assignment = assignment.clone();
        self.store
            .transact::<NarrativeIndexDoc, _, _>(&self.index_path(), move |doc| {
                Ok(apply_assignment(doc, &bookmark_id, &assignment, Utc::now(), cap))
            })
            .await
    }

    /// Locked snapshot of the whole index.
    pub async fn snapshot(&self) -> Result<NarrativeIndexDoc> {
        self.store.snapshot(&self.index_path()).await
    }

    /// Candidates to present to the classifier: every active narrative.
    pub async fn candidates(&self) -> Result<Vec<CandidateRef>> {
        let doc = self.snapshot().await?;
        Ok(doc
            .narratives
            .values()
            .map(|n| CandidateRef {
                id: n.id.clone(),
                label: n.label.clone(),
            })
            .collect())
    }

    /// Rebuild the index from scratch by replaying all persisted
    /// processed-bookmark records, in `(processed_at, bookmark_id)` order.
    ///
    /// The index is a pure function of those records: a rebuild reaches
    /// the same per-narrative `bookmark_count` as the incremental upserts
    /// that produced them.
    pub async fn rebuild(&self, source: &dyn ProcessedRecordSource) -> Result<RebuildSummary> {
        let mut records = source.processed_records().await?;
        records.sort_by(|a, b| {
            a.processed_at
                .cmp(&b.processed_at)
                .then_with(|| a.bookmark_id.cmp(&b.bookmark_id))
        });

        let cap = self.ctx.config().narratives.recent_ids_cap;
        self.store
            .transact::<NarrativeIndexDoc, _, _>(&self.index_path(), move |doc| {
                let mut fresh = NarrativeIndexDoc::default();
                let mut replayed = 0u64;
                let mut skipped = 0u64;
                for record in &records {
                    let applied = apply_assignment(
                        &mut fresh,
                        &record.bookmark_id,
                        &record.assignment,
                        record.processed_at,
                        cap,
                    );
                    match applied {
                        Some(_) => replayed += 1,
                        None => skipped += 1,
                    }
                }
                let narratives = fresh.narratives.len();
                *doc = fresh;
                Ok(RebuildSummary {
                    replayed,
                    skipped,
                    narratives,
                })
            })
            .await
    }

    /// Append one entry to the NDJSON audit log.
    ///
    /// No read-modify-write needed: the line is built in full, then handed
    /// to the kernel in a single append-mode write and flushed, so
    /// concurrent appenders never interleave within a line.
    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let path = self.ctx.audit_log_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }
}
