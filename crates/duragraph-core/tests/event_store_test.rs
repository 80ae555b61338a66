// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event store and outbox tests: optimistic concurrency, atomic outbox staging, relay.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use serde_json::json;

use duragraph_core::error::{CoreError, Result};
use duragraph_core::event_store::{AGGREGATE_THREAD, NewEvent, UnitOfWork};
use duragraph_core::outbox::{OutboxEnvelope, OutboxRelay, OutboxRelayConfig, Publisher};
use duragraph_core::persistence::Persistence;

/// Publisher that fails its first `failures` deliveries.
struct FlakyPublisher {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Publisher for FlakyPublisher {
    async fn publish(&self, _topic: &str, _envelope: &OutboxEnvelope) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(CoreError::internal("publish", "broker unavailable"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_stale_expected_version_conflicts() {
    let ctx = TestContext::new().await;
    let events = ctx.plane.events();

    let version = events
        .append(
            "ledger",
            "acct-1",
            0,
            vec![NewEvent::new("ledger.opened", json!({"owner": "ada"}))],
        )
        .await
        .unwrap();
    assert_eq!(version, 1);

    // Two writers that both read version 1.
    events
        .append(
            "ledger",
            "acct-1",
            1,
            vec![NewEvent::new("ledger.credited", json!({"amount": 5}))],
        )
        .await
        .unwrap();
    let err = events
        .append(
            "ledger",
            "acct-1",
            1,
            vec![NewEvent::new("ledger.debited", json!({"amount": 3}))],
        )
        .await
        .unwrap_err();
    match err {
        CoreError::ConcurrencyConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected concurrency conflict, got {:?}", other),
    }

    let stream = events.load("ledger", "acct-1").await.unwrap();
    let types: Vec<_> = stream.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, ["ledger.opened", "ledger.credited"]);
    assert_eq!(events.version("ledger", "acct-1").await.unwrap(), 2);
}

#[tokio::test]
async fn test_outbox_row_per_event_and_nothing_on_failure() {
    let ctx = TestContext::new().await;
    let persistence = ctx.plane.persistence();
    let baseline = persistence
        .fetch_unpublished(1000, Utc::now())
        .await
        .unwrap()
        .len();

    let mut uow = UnitOfWork::new();
    uow.append(
        "ledger",
        "acct-2",
        0,
        vec![
            NewEvent::new("ledger.opened", json!({})),
            NewEvent::new("ledger.credited", json!({"amount": 1})),
        ],
    );
    uow.append(
        "ledger",
        "acct-3",
        0,
        vec![NewEvent::new("ledger.opened", json!({}))],
    );
    ctx.plane.events().commit(uow).await.unwrap();

    let rows = persistence.fetch_unpublished(1000, Utc::now()).await.unwrap();
    assert_eq!(rows.len(), baseline + 3);

    // One stale stream sinks the whole unit of work, including the fresh stream.
    let mut uow = UnitOfWork::new();
    uow.append(
        "ledger",
        "acct-4",
        0,
        vec![NewEvent::new("ledger.opened", json!({}))],
    );
    uow.append(
        "ledger",
        "acct-2",
        0,
        vec![NewEvent::new("ledger.credited", json!({"amount": 2}))],
    );
    let err = ctx.plane.events().commit(uow).await.unwrap_err();
    assert!(err.is_retryable());

    assert_eq!(ctx.plane.events().version("ledger", "acct-4").await.unwrap(), 0);
    let rows = persistence.fetch_unpublished(1000, Utc::now()).await.unwrap();
    assert_eq!(rows.len(), baseline + 3);
}

#[tokio::test]
async fn test_relay_publishes_in_order_and_marks_rows() {
    let ctx = TestContext::new().await;
    let mut rx = ctx.plane.subscribe();
    let thread_id = ctx.create_thread().await;
    ctx.plane
        .threads()
        .update(&thread_id, json!({"topic": "weather"}))
        .await
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let stats = ctx.plane.relay().relay_once().await.unwrap();
        if stats.published == 0 {
            break;
        }
    }
    while let Ok((_, envelope)) = rx.try_recv() {
        if envelope.aggregate_type == AGGREGATE_THREAD {
            seen.push(envelope.event_type);
        }
    }
    assert_eq!(seen, ["thread.created", "thread.metadata_updated"]);

    let left = ctx
        .plane
        .persistence()
        .fetch_unpublished(1000, Utc::now())
        .await
        .unwrap();
    assert!(left.is_empty());
}

#[tokio::test]
async fn test_failed_delivery_is_retried_after_backoff() {
    let ctx = TestContext::new().await;
    let persistence = ctx.plane.persistence().clone();
    // Drain what the context setup produced.
    ctx.plane.relay().relay_once().await.unwrap();

    ctx.create_thread().await;

    let publisher = Arc::new(FlakyPublisher {
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    let relay = OutboxRelay::new(
        persistence.clone(),
        publisher.clone(),
        OutboxRelayConfig::default(),
    );

    let stats = relay.relay_once().await.unwrap();
    assert_eq!(stats.failed, 1);

    // Not due again until the backoff passes.
    assert!(persistence.fetch_unpublished(10, Utc::now()).await.unwrap().is_empty());
    let later = Utc::now() + chrono::Duration::minutes(2);
    let due = persistence.fetch_unpublished(10, later).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].attempts, 1);
    assert!(due[0].last_error.as_deref().unwrap().contains("broker unavailable"));
}
