//! Integration tests for the event store against a live database.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use ledger_core::event_store::EventStore;
use ledger_core::guard::{ReplayGuard, SequenceMode};
use ledger_core::model::{Actor, ProposedEvent};

mod common;

fn proposed(aggregate_id: Uuid, expected_version: i64) -> ProposedEvent {
    ProposedEvent::new(
        "AccountOpened",
        "Account",
        aggregate_id,
        expected_version,
        json!({"balance": 0}),
        Actor::System { id: "test".into() },
    )
    .with_timestamp(Utc::now())
}

#[tokio::test]
async fn append_and_query_round_trips() {
    let Some(pool) = common::setup_test_db().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let guard = Arc::new(ReplayGuard::new(
        pool.clone(),
        std::time::Duration::from_secs(300),
        std::time::Duration::from_secs(86_400),
    ));
    let store = EventStore::new(pool, guard);

    let aggregate_id = Uuid::new_v4();
    let event = store
        .append(proposed(aggregate_id, 1), SequenceMode::Strict)
        .await
        .expect("first append should succeed");

    assert_eq!(event.aggregate_version, 1);

    let events = store
        .get_events_for_aggregate(aggregate_id, 0, None)
        .await
        .expect("query should succeed");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, event.id);
}

#[tokio::test]
async fn concurrent_append_with_stale_version_is_rejected() {
    let Some(pool) = common::setup_test_db().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let guard = Arc::new(ReplayGuard::new(
        pool.clone(),
        std::time::Duration::from_secs(300),
        std::time::Duration::from_secs(86_400),
    ));
    let store = EventStore::new(pool, guard);

    let aggregate_id = Uuid::new_v4();
    store
        .append(proposed(aggregate_id, 1), SequenceMode::Strict)
        .await
        .expect("first append should succeed");

    let stale = store
        .append(proposed(aggregate_id, 1), SequenceMode::Strict)
        .await;
    assert!(stale.is_err(), "re-appending version 1 should conflict");
}

#[tokio::test]
async fn chain_verification_detects_no_corruption_on_a_clean_log() {
    let Some(pool) = common::setup_test_db().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let guard = Arc::new(ReplayGuard::new(
        pool.clone(),
        std::time::Duration::from_secs(300),
        std::time::Duration::from_secs(86_400),
    ));
    let store = EventStore::new(pool, guard);

    let aggregate_id = Uuid::new_v4();
    store
        .append(proposed(aggregate_id, 1), SequenceMode::Strict)
        .await
        .unwrap();
    store
        .append(proposed(aggregate_id, 2), SequenceMode::Strict)
        .await
        .unwrap();

    let result = store.verify_chain(Some(aggregate_id)).await.unwrap();
    assert!(result.is_valid);
    assert_eq!(result.events_checked, 2);
}
