// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend tests. Require TEST_DATABASE_URL.

mod common;

use common::*;
use serde_json::json;

use duragraph_core::event_store::NewEvent;
use duragraph_core::run::MultitaskStrategy;
use duragraph_core::worker::WorkerEventKind;

#[tokio::test]
async fn test_postgres_run_lifecycle() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::postgres().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let worker_id = format!("pg-worker-{}", uuid::Uuid::new_v4());
    ctx.register_worker(&worker_id, 1).await;
    let thread_id = ctx.create_thread().await;
    let run = ctx
        .create_run(&thread_id, MultitaskStrategy::Reject)
        .await
        .unwrap();

    // Other tests share the database; drain until our run shows up.
    let mut claimed = false;
    for _ in 0..50 {
        let tasks = ctx.plane.runs().poll(&worker_id, 1).await;
        if tasks.iter().any(|t| t.run_id == run.run_id) {
            claimed = true;
            break;
        }
        for task in tasks {
            ctx.report(
                &worker_id,
                &task.run_id,
                WorkerEventKind::RunCompleted { output: json!({}) },
            )
            .await;
        }
    }
    assert!(claimed);

    ctx.report(&worker_id, &run.run_id, checkpoint_event(json!({"n": 1}), 0))
        .await;
    ctx.report(
        &worker_id,
        &run.run_id,
        WorkerEventKind::RunCompleted {
            output: json!({"n": 1}),
        },
    )
    .await;

    assert_eq!(ctx.run_status(&run.run_id).await, "success");
    let state = ctx.plane.checkpoints().get_state(&thread_id, "").await.unwrap();
    assert_eq!(state.values["n"], json!(1));
}

#[tokio::test]
async fn test_postgres_optimistic_concurrency() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::postgres().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let id = uuid::Uuid::new_v4().to_string();
    let events = ctx.plane.events();
    events
        .append("ledger", &id, 0, vec![NewEvent::new("ledger.opened", json!({}))])
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        events.append("ledger", &id, 1, vec![NewEvent::new("ledger.credited", json!({}))]),
        events.append("ledger", &id, 1, vec![NewEvent::new("ledger.debited", json!({}))]),
    );
    assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
    let err = if a.is_err() { a } else { b }.unwrap_err();
    assert_eq!(err.error_code(), "CONCURRENCY_CONFLICT");
    assert_eq!(events.version("ledger", &id).await.unwrap(), 2);
}
