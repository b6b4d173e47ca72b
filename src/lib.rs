//! # Curio Store
//!
//! Locked local JSON store for a personal content-curation pipeline.
//!
//! Many independent processes — pollers, backfills, status reporters,
//! test runs — read, mutate, and persist shared JSON state with no
//! database: the filesystem is the durability and concurrency substrate.
//! The store provides atomic visibility, no lost updates, no partial
//! writes, and no permanent deadlock from crashed holders, using only
//! primitive filesystem operations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ NarrativeIdx │   │ AccountStore │   │ FailureLedger │
//! └──────┬───────┘   └──────┬───────┘   └──────┬────────┘
//!        └───────────┬──────┴──────────────────┘
//!                    ▼
//!             ┌─────────────┐    lock → read → mutate
//!             │ LockedStore │    → atomic write → release
//!             └──────┬──────┘
//!        ┌───────────┼───────────┐
//!        ▼           ▼           ▼
//!   ┌─────────┐ ┌─────────┐ ┌─────────┐
//!   │ FileLock│ │SafeRead │ │ Atomic  │
//!   │ sidecar │ │         │ │ Write   │
//!   └─────────┘ └─────────┘ └─────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Transactions against the same document are linearized by an
//!   advisory, crash-tolerant file lock; stale locks from dead holders
//!   are reclaimed, live locks are never stolen.
//! - Writes are temp-file-then-rename: readers never observe a partial
//!   document.
//! - A missing document reads as its default; a damaged one surfaces as a
//!   distinct corrupt-document error, never a silent default.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`context`] | Explicit store context: paths, tuning, probe |
//! | [`error`] | Storage error taxonomy |
//! | [`lock`] | Crash-tolerant advisory file lock |
//! | [`docfile`] | Safe reads, atomic writes |
//! | [`store`] | Lock-guarded document transactions |
//! | [`models`] | Shared pipeline data types |
//! | [`narrative`] | Deduplicated narrative index + audit log |
//! | [`account`] | Per-account poll state |
//! | [`failure`] | Retry/backoff/poison-pill ledger |
//! | [`status`] | Data-directory health report |
//! | [`traits`] | Collaborator seams (scraper, classifier) |

pub mod account;
pub mod config;
pub mod context;
pub mod docfile;
pub mod error;
pub mod failure;
pub mod lock;
pub mod models;
pub mod narrative;
pub mod status;
pub mod store;
pub mod traits;

pub use account::{AccountState, AccountStore};
pub use config::{load_config, Config};
pub use context::StoreContext;
pub use error::StoreError;
pub use failure::{FailureLedger, FailureRecord, SkipDecision, SkipType};
pub use lock::{FileLock, LockGuard, ProcessProbe, SystemProbe};
pub use models::{Bookmark, CandidateRef, Confidence, NarrativeAssignment, ProcessedBookmark};
pub use narrative::{
    normalize_label, slugify, AuditDecision, AuditEntry, Narrative, NarrativeIndex,
    NarrativeIndexDoc, RebuildSummary, UpsertOutcome,
};
pub use status::{run_status, StatusReport};
pub use store::{DocumentSchema, LockedStore};
