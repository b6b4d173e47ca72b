//! Concurrency and durability properties of the locked store.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::task::JoinSet;

use curio_store::models::{Confidence, NarrativeAssignment};
use curio_store::{AccountStore, Config, FailureLedger, NarrativeIndex, StoreContext};

fn setup() -> (TempDir, Arc<StoreContext>) {
    let tmp = TempDir::new().unwrap();
    let ctx = StoreContext::new(Config::with_data_dir(tmp.path()));
    (tmp, ctx)
}

fn by_label(label: &str) -> NarrativeAssignment {
    NarrativeAssignment {
        narrative_id: None,
        narrative_label: Some(label.to_string()),
        narrative_confidence: Confidence::High,
    }
}

#[tokio::test]
async fn test_concurrent_upserts_lose_no_updates() {
    let (_tmp, ctx) = setup();
    let index = Arc::new(NarrativeIndex::new(ctx));

    let created = index
        .upsert_from_assignment("b0", &by_label("Rust"))
        .await
        .unwrap()
        .unwrap();

    let mut tasks = JoinSet::new();
    for i in 1..=5 {
        let index = Arc::clone(&index);
        let assignment = NarrativeAssignment {
            narrative_id: Some(created.narrative_id.clone()),
            narrative_label: None,
            narrative_confidence: Confidence::Medium,
        };
        tasks.spawn(async move {
            index
                .upsert_from_assignment(&format!("b{i}"), &assignment)
                .await
                .unwrap()
                .unwrap()
        });
    }
    while let Some(outcome) = tasks.join_next().await {
        assert!(!outcome.unwrap().created);
    }

    let doc = index.snapshot().await.unwrap();
    let narrative = &doc.narratives[&created.narrative_id];
    assert_eq!(narrative.bookmark_count, 6, "all 5 concurrent updates must land");
    assert_eq!(narrative.recent_bookmark_ids.len(), 6);
}

#[tokio::test]
async fn test_concurrent_label_upserts_create_one_narrative() {
    let (_tmp, ctx) = setup();
    let index = Arc::new(NarrativeIndex::new(ctx));

    let mut tasks = JoinSet::new();
    for i in 0..8 {
        let index = Arc::clone(&index);
        tasks.spawn(async move {
            index
                .upsert_from_assignment(&format!("b{i}"), &by_label("Distributed Systems"))
                .await
                .unwrap()
                .unwrap()
        });
    }
    let mut created = 0;
    while let Some(outcome) = tasks.join_next().await {
        if outcome.unwrap().created {
            created += 1;
        }
    }

    assert_eq!(created, 1, "exactly one task may create the narrative");
    let doc = index.snapshot().await.unwrap();
    assert_eq!(doc.narratives.len(), 1);
    assert_eq!(doc.narratives.values().next().unwrap().bookmark_count, 8);
}

#[tokio::test]
async fn test_different_keys_do_not_contend() {
    let (_tmp, ctx) = setup();
    let accounts = Arc::new(AccountStore::new(Arc::clone(&ctx)));
    let ledger = Arc::new(FailureLedger::new(ctx));

    let mut tasks = JoinSet::new();
    for i in 0..4 {
        let accounts = Arc::clone(&accounts);
        tasks.spawn(async move {
            let user = format!("user{i}");
            accounts
                .record_processed(&user, "b1", &by_label("Rust"))
                .await
                .unwrap();
            accounts.checkpoint(&user, Some("b1")).await.unwrap();
        });
    }
    for i in 0..4 {
        let ledger = Arc::clone(&ledger);
        tasks.spawn(async move {
            let user = format!("user{i}");
            ledger
                .record_failure(&user, "b2", "fetch_error", "boom")
                .await
                .unwrap();
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    let names = accounts.usernames().await.unwrap();
    assert_eq!(names.len(), 4);
    for name in names {
        let state = accounts.load(&name).await.unwrap();
        assert_eq!(state.processed.len(), 1);
        assert_eq!(state.newest_seen_id.as_deref(), Some("b1"));
        let decision = ledger.should_skip_retry(&name, "b2").await.unwrap();
        assert!(decision.should_skip);
    }
}

#[tokio::test]
async fn test_no_lock_sidecars_left_behind() {
    let (tmp, ctx) = setup();
    let index = NarrativeIndex::new(Arc::clone(&ctx));

    for i in 0..3 {
        index
            .upsert_from_assignment(&format!("b{i}"), &by_label("Rust"))
            .await
            .unwrap()
            .unwrap();
    }

    // Uncontended store: every sidecar must have been removed on release.
    let mut stack = vec![tmp.path().to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                assert!(!name.ends_with(".lock"), "leftover sidecar: {name}");
                assert!(!name.ends_with(".tmp"), "leftover temp file: {name}");
            }
        }
    }
}
