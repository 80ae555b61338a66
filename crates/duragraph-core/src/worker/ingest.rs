// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbox consumer that keeps the task queue in line with run events.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::TaskQueue;
use crate::error::Result;
use crate::event_store::AGGREGATE_RUN;
use crate::outbox::{OutboxEnvelope, Publisher};

/// Drops queued tasks of runs that were cancelled or deleted.
///
/// The run service removes tasks itself when it cancels a run; this publisher covers runs
/// changed by another control-plane process sharing the same database.
pub struct TaskQueueIngest {
    queue: Arc<TaskQueue>,
}

impl TaskQueueIngest {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Publisher for TaskQueueIngest {
    async fn publish(&self, _topic: &str, envelope: &OutboxEnvelope) -> Result<()> {
        if envelope.aggregate_type != AGGREGATE_RUN {
            return Ok(());
        }
        if matches!(
            envelope.event_type.as_str(),
            "run.cancelled" | "run.deleted"
        ) && self.queue.remove_run(&envelope.aggregate_id).await
        {
            debug!(
                run_id = %envelope.aggregate_id,
                event_type = %envelope.event_type,
                "Dropped queued task"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{TaskKind, WorkerTask};
    use chrono::Utc;
    use serde_json::json;

    fn envelope(aggregate_type: &str, event_type: &str, id: &str) -> OutboxEnvelope {
        OutboxEnvelope {
            event_id: "e".into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: id.into(),
            event_type: event_type.into(),
            payload: json!({}),
            metadata: json!({}),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_queue() {
        let queue = Arc::new(TaskQueue::new());
        queue
            .push(WorkerTask {
                task_id: WorkerTask::task_id_for("r1"),
                kind: TaskKind::Start,
                run_id: "r1".into(),
                thread_id: "t".into(),
                assistant_id: "a".into(),
                graph_id: "agent".into(),
                input: json!({}),
                config: json!({}),
                resume: None,
                checkpoint_id: None,
                created_at: Utc::now(),
            })
            .await;
        let ingest = TaskQueueIngest::new(queue.clone());

        ingest
            .publish("t", &envelope("run", "run.started", "r1"))
            .await
            .unwrap();
        ingest
            .publish("t", &envelope("thread", "run.cancelled", "r1"))
            .await
            .unwrap();
        assert!(queue.contains("r1").await);

        ingest
            .publish("t", &envelope("run", "run.cancelled", "r1"))
            .await
            .unwrap();
        assert!(!queue.contains("r1").await);
    }
}
