// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for duragraph-core integration tests.
//!
//! Provides TestContext wrapping a ControlPlane over a private in-memory SQLite database,
//! or over PostgreSQL when TEST_DATABASE_URL is set.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use duragraph_core::assistant::NewAssistant;
use duragraph_core::persistence::{Persistence, PostgresPersistence, RunRecord, SqlitePersistence};
use duragraph_core::run::{CreateRun, MultitaskStrategy, RunServiceConfig};
use duragraph_core::runtime::ControlPlane;
use duragraph_core::worker::{Capabilities, Registration, WorkerEvent, WorkerEventKind};

/// Graph every test assistant points at.
pub const GRAPH: &str = "chat";

/// Test context around a built (not started) control plane.
pub struct TestContext {
    pub plane: ControlPlane,
    pub assistant_id: String,
}

impl TestContext {
    /// Control plane over a fresh in-memory SQLite database.
    pub async fn new() -> Self {
        let persistence = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to create in-memory database"),
        );
        Self::with_persistence(persistence).await
    }

    /// Control plane over TEST_DATABASE_URL. Returns None when it is unset or unreachable.
    pub async fn postgres() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = sqlx::PgPool::connect(&database_url).await.ok()?;
        duragraph_core::migrations::run_postgres(&pool).await.ok()?;
        Some(Self::with_persistence(Arc::new(PostgresPersistence::new(pool))).await)
    }

    async fn with_persistence(persistence: Arc<dyn Persistence>) -> Self {
        let plane = ControlPlane::builder()
            .persistence(persistence)
            .base_url("http://cp.test")
            .worker_liveness(Duration::from_secs(30))
            .run_config(RunServiceConfig {
                join_timeout: Duration::from_secs(2),
                join_poll_interval: Duration::from_millis(20),
                create_attempts: 3,
            })
            .build()
            .expect("Failed to build control plane");

        let assistant = plane
            .assistants()
            .create(NewAssistant {
                graph_id: GRAPH.to_string(),
                name: Some("chat bot".to_string()),
                ..Default::default()
            })
            .await
            .expect("Failed to create assistant");

        Self {
            plane,
            assistant_id: assistant.assistant_id,
        }
    }

    /// Register a worker serving the test graph.
    pub async fn register_worker(&self, worker_id: &str, max_concurrent_runs: i32) {
        self.plane
            .registry()
            .register(Registration {
                worker_id: worker_id.to_string(),
                name: format!("{} worker", worker_id),
                capabilities: Capabilities {
                    graphs: vec![GRAPH.to_string()],
                    max_concurrent_runs,
                },
                graph_definitions: vec![],
            })
            .await
            .expect("Failed to register worker");
    }

    /// Create a thread with a unique id.
    pub async fn create_thread(&self) -> String {
        self.plane
            .threads()
            .create(Some(format!("thread-{}", Uuid::new_v4())), json!({}))
            .await
            .expect("Failed to create thread")
            .thread_id
    }

    pub async fn create_run(
        &self,
        thread_id: &str,
        strategy: MultitaskStrategy,
    ) -> duragraph_core::error::Result<RunRecord> {
        self.plane
            .runs()
            .create(CreateRun {
                thread_id: Some(thread_id.to_string()),
                assistant_id: self.assistant_id.clone(),
                input: json!({"messages": [{"role": "user", "content": "hello"}]}),
                multitask_strategy: strategy,
                ..Default::default()
            })
            .await
    }

    /// Report an event as `worker_id`, failing the test on error.
    pub async fn report(&self, worker_id: &str, run_id: &str, kind: WorkerEventKind) {
        self.plane
            .runs()
            .handle_worker_event(worker_id, WorkerEvent::new(run_id, kind))
            .await
            .expect("Failed to handle worker event");
    }

    pub async fn run_status(&self, run_id: &str) -> String {
        self.plane
            .runs()
            .get(run_id)
            .await
            .expect("Failed to get run")
            .status
    }

    pub async fn thread_status(&self, thread_id: &str) -> String {
        self.plane
            .threads()
            .get(thread_id)
            .await
            .expect("Failed to get thread")
            .status
    }
}

/// Checkpoint event with the given values and no explicit ids.
pub fn checkpoint_event(values: Value, step: i64) -> WorkerEventKind {
    WorkerEventKind::Checkpoint {
        checkpoint_ns: String::new(),
        checkpoint_id: None,
        parent_checkpoint_id: None,
        channel_values: values,
        channel_versions: Value::Null,
        versions_seen: Value::Null,
        pending_sends: Value::Null,
        metadata: json!({ "step": step }),
        task_id: None,
        writes: vec![],
    }
}

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
