//! Failure ledger: retry attempts, backoff windows, poison pills.
//!
//! One record per (account, item) key, persisted as its own JSON document
//! through [`LockedStore`]. Each recorded failure increments the attempt
//! count and pushes the next-retry time out exponentially; once attempts
//! reach the retry budget the item becomes a poison pill and is excluded
//! permanently. Clearing the record (on successful processing) is the only
//! way back to a clean state.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FailureConfig;
use crate::context::StoreContext;
use crate::store::{DocumentSchema, LockedStore};

/// Persisted record of repeated failures for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub account: String,
    pub item_id: String,
    pub error_type: String,
    pub error_message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub attempts: u32,
    pub poison_pill: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FailureDoc {
    pub(crate) version: u32,
    pub(crate) record: Option<FailureRecord>,
}

impl Default for FailureDoc {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            record: None,
        }
    }
}

impl DocumentSchema for FailureDoc {
    const VERSION: u32 = 1;
}

/// Why an item should (or should not) be skipped this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipType {
    Backoff,
    PoisonPill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipDecision {
    pub should_skip: bool,
    pub skip_type: Option<SkipType>,
}

impl SkipDecision {
    fn retry() -> Self {
        Self {
            should_skip: false,
            skip_type: None,
        }
    }

    fn skip(skip_type: SkipType) -> Self {
        Self {
            should_skip: true,
            skip_type: Some(skip_type),
        }
    }
}

/// Exponential backoff for the nth attempt, capped.
fn backoff(attempts: u32, config: &FailureConfig) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let secs = config
        .base_backoff_secs
        .saturating_mul(1u64 << exp)
        .min(config.max_backoff_secs);
    Duration::seconds(secs as i64)
}

/// Tracks per-item failures across poll cycles.
pub struct FailureLedger {
    ctx: Arc<StoreContext>,
    store: LockedStore,
}

impl FailureLedger {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self {
            store: LockedStore::new(Arc::clone(&ctx)),
            ctx,
        }
    }

    /// Record one more failure for the item and return the updated record.
    pub async fn record_failure(
        &self,
        account: &str,
        item_id: &str,
        error_type: &str,
        error_message: &str,
    ) -> Result<FailureRecord> {
        let path = self.ctx.failure_record_path(account, item_id);
        let config = self.ctx.config().failures.clone();
        let account = account.to_string();
        let item_id = item_id.to_string();
        let error_type = error_type.to_string();
        let error_message = error_message.to_string();

        self.store
            .transact::<FailureDoc, _, _>(&path, move |doc| {
                let now = Utc::now();
                let record = match doc.record.take() {
                    Some(mut existing) => {
                        existing.attempts += 1;
                        existing.last_seen = now;
                        existing.error_type = error_type;
                        existing.error_message = error_message;
                        existing.next_retry_at = now + backoff(existing.attempts, &config);
                        existing.poison_pill = existing.attempts >= config.max_retries;
                        existing
                    }
                    None => FailureRecord {
                        account,
                        item_id,
                        error_type,
                        error_message,
                        first_seen: now,
                        last_seen: now,
                        next_retry_at: now + backoff(1, &config),
                        attempts: 1,
                        poison_pill: 1 >= config.max_retries,
                    },
                };
                doc.record = Some(record.clone());
                Ok(record)
            })
            .await
    }

    /// Should this item be skipped right now, and why.
    pub async fn should_skip_retry(&self, account: &str, item_id: &str) -> Result<SkipDecision> {
        let path = self.ctx.failure_record_path(account, item_id);
        let doc: FailureDoc = self.store.snapshot(&path).await?;

        let Some(record) = doc.record else {
            return Ok(SkipDecision::retry());
        };
        if record.poison_pill {
            return Ok(SkipDecision::skip(SkipType::PoisonPill));
        }
        if Utc::now() < record.next_retry_at {
            return Ok(SkipDecision::skip(SkipType::Backoff));
        }
        Ok(SkipDecision::retry())
    }

    /// Delete the record entirely — the transition back to a clean state
    /// after the item finally processes.
    pub async fn clear_failure(&self, account: &str, item_id: &str) -> Result<()> {
        self.store
            .remove(&self.ctx.failure_record_path(account, item_id))
            .await
    }

    /// Unlocked peek at a record, for status reporting.
    pub async fn peek(&self, account: &str, item_id: &str) -> Result<Option<FailureRecord>> {
        let path = self.ctx.failure_record_path(account, item_id);
        let doc: FailureDoc = self.store.read_unlocked(&path).await?;
        Ok(doc.record)
    }
}
