// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker registry, capacity and liveness tests.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;

use duragraph_core::run::MultitaskStrategy;
use duragraph_core::worker::{
    Capabilities, GraphDefinition, Heartbeat, LivenessMonitor, LivenessMonitorConfig,
    NodeDefinition, Registration, WorkerRegistry, WorkerStatus,
};

#[tokio::test]
async fn test_registration_returns_protocol_urls() {
    let ctx = TestContext::new().await;
    let response = ctx
        .plane
        .registry()
        .register(Registration {
            worker_id: "py-worker-1".into(),
            name: "python".into(),
            capabilities: Capabilities {
                graphs: vec![GRAPH.into()],
                max_concurrent_runs: 3,
            },
            graph_definitions: vec![GraphDefinition {
                graph_id: GRAPH.into(),
                name: "Chat".into(),
                description: String::new(),
                nodes: vec![NodeDefinition {
                    id: "llm".into(),
                    node_type: "llm".into(),
                    config: Some(json!({"model": "small"})),
                }],
                edges: vec![],
                entry_point: "llm".into(),
            }],
        })
        .await
        .unwrap();

    assert_eq!(
        response.poll_url,
        "http://cp.test/api/v1/workers/py-worker-1/poll"
    );
    assert_eq!(
        response.events_url,
        "http://cp.test/api/v1/workers/py-worker-1/events"
    );
    let def = ctx.plane.registry().graph_definition(GRAPH).await.unwrap();
    assert_eq!(def.entry_point, "llm");
}

#[tokio::test]
async fn test_capacity_spread_across_workers() {
    let ctx = TestContext::new().await;
    ctx.register_worker("w1", 1).await;
    ctx.register_worker("w2", 2).await;

    for _ in 0..4 {
        let thread_id = ctx.create_thread().await;
        ctx.create_run(&thread_id, MultitaskStrategy::Reject)
            .await
            .unwrap();
    }

    assert_eq!(ctx.plane.runs().poll("w1", 10).await.len(), 1);
    assert_eq!(ctx.plane.runs().poll("w2", 10).await.len(), 2);
    assert!(ctx.plane.runs().poll("w1", 10).await.is_empty());
    assert_eq!(ctx.plane.queue().depth(GRAPH).await, 1);

    let w2 = ctx.plane.registry().get("w2").await.unwrap();
    assert_eq!(w2.active_runs, 2);
    assert!(!w2.has_capacity());
}

#[tokio::test]
async fn test_heartbeat_and_deregistration() {
    let ctx = TestContext::new().await;
    ctx.register_worker("w1", 2).await;

    let worker = ctx
        .plane
        .registry()
        .heartbeat(
            "w1",
            Heartbeat {
                status: WorkerStatus::Running,
                active_runs: 1,
                total_runs: 7,
                failed_runs: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Running);
    assert_eq!(worker.total_runs, 7);

    ctx.plane.registry().deregister("w1").await.unwrap();
    let err = ctx
        .plane
        .registry()
        .heartbeat("w1", Heartbeat::default())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(ctx.plane.runs().poll("w1", 1).await.is_empty());
}

#[tokio::test]
async fn test_stale_worker_is_skipped_then_marked_offline() {
    let registry = std::sync::Arc::new(WorkerRegistry::new(
        "http://cp.test",
        Duration::from_millis(50),
    ));
    registry
        .register(Registration {
            worker_id: "w1".into(),
            name: String::new(),
            capabilities: Capabilities {
                graphs: vec![GRAPH.into()],
                max_concurrent_runs: 1,
            },
            graph_definitions: vec![],
        })
        .await
        .unwrap();
    assert_eq!(registry.healthy_workers().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(registry.healthy_workers().await.is_empty());
    assert!(registry.find_worker_for_graph(GRAPH).await.is_none());

    let monitor = LivenessMonitor::new(
        registry.clone(),
        LivenessMonitorConfig {
            poll_interval: Duration::from_millis(10),
        },
    );
    assert_eq!(monitor.check_once().await, 1);
    assert_eq!(registry.get("w1").await.unwrap().status, WorkerStatus::Offline);
    // Still registered; a heartbeat brings it back.
    registry
        .heartbeat("w1", Heartbeat::default())
        .await
        .unwrap();
    assert_eq!(registry.healthy_workers().await.len(), 1);
}
