//! Collaborator seams for the surrounding pipeline.
//!
//! The scraping CLI and the language-model classifier live outside this
//! crate; pollers wire real implementations in, tests wire in fakes. The
//! store only depends on these interfaces.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use curio_store::models::{Bookmark, CandidateRef, Confidence, NarrativeAssignment};
//! use curio_store::traits::NarrativeClassifier;
//!
//! pub struct FixedClassifier;
//!
//! #[async_trait]
//! impl NarrativeClassifier for FixedClassifier {
//!     async fn classify(
//!         &self,
//!         _bookmark: &Bookmark,
//!         _candidates: &[CandidateRef],
//!     ) -> Result<NarrativeAssignment> {
//!         Ok(NarrativeAssignment {
//!             narrative_id: None,
//!             narrative_label: Some("AI Development".into()),
//!             narrative_confidence: Confidence::High,
//!         })
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Bookmark, CandidateRef, NarrativeAssignment, ProcessedBookmark};

/// Produces raw bookmarks for one account, newest first.
#[async_trait]
pub trait BookmarkSource: Send + Sync {
    /// Source name, for logs and status output.
    fn name(&self) -> &str;

    /// Fetch bookmarks for `username`, optionally only those newer than
    /// `since_id` (the account's persisted checkpoint).
    async fn fetch_bookmarks(
        &self,
        username: &str,
        since_id: Option<&str>,
    ) -> Result<Vec<Bookmark>>;
}

/// Assigns a bookmark to a narrative, given the candidates currently in
/// the index.
#[async_trait]
pub trait NarrativeClassifier: Send + Sync {
    async fn classify(
        &self,
        bookmark: &Bookmark,
        candidates: &[CandidateRef],
    ) -> Result<NarrativeAssignment>;
}

/// Source of the persisted processed-bookmark records the narrative index
/// is rebuilt from. Implemented by the per-account state store.
#[async_trait]
pub trait ProcessedRecordSource: Send + Sync {
    async fn processed_records(&self) -> Result<Vec<ProcessedBookmark>>;
}
