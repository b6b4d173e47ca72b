//! Shared data models for the curation pipeline.
//!
//! These types cross module boundaries: raw bookmarks coming out of the
//! scraper, classification results coming out of the language model, and
//! the processed-bookmark records that tie the two together on disk.
//!
//! Persisted shapes serialize in camelCase to match the on-disk JSON layout
//! shared with the rest of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw bookmark produced by the scraping collaborator before processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Stable string identifier assigned by the source platform.
    pub id: String,
    pub author: Option<String>,
    pub text: String,
    pub url: Option<String>,
    pub bookmarked_at: DateTime<Utc>,
}

/// Confidence reported by the classifier for a narrative assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Classification result for one bookmark.
///
/// `narrative_id` points at an existing narrative when the classifier
/// matched one; `narrative_label` proposes a (possibly new) topic label.
/// Either may be absent — the upsert path decides what to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeAssignment {
    pub narrative_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative_label: Option<String>,
    pub narrative_confidence: Confidence,
}

/// A narrative candidate shown to the classifier, or recorded in the audit
/// trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRef {
    pub id: String,
    pub label: String,
}

/// A bookmark that has been classified and persisted, with its resolved
/// assignment. These records are the source of truth the narrative index
/// can be rebuilt from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedBookmark {
    pub bookmark_id: String,
    pub processed_at: DateTime<Utc>,
    pub assignment: NarrativeAssignment,
}
