// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker protocol messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Capabilities, GraphDefinition, WorkerStatus};
use crate::checkpoint::PendingWrite;

/// Registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub worker_id: String,
    #[serde(default)]
    pub name: String,
    pub capabilities: Capabilities,
    #[serde(default)]
    pub graph_definitions: Vec<GraphDefinition>,
}

/// Registration response with the endpoints the worker talks to afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub worker_id: String,
    pub heartbeat_url: String,
    pub poll_url: String,
    pub deregister_url: String,
    pub events_url: String,
    pub registered_at: DateTime<Utc>,
}

impl RegistrationResponse {
    pub(crate) fn for_worker(base_url: &str, worker_id: &str, registered_at: DateTime<Utc>) -> Self {
        let base = format!("{}/api/v1/workers/{}", base_url.trim_end_matches('/'), worker_id);
        Self {
            worker_id: worker_id.to_string(),
            heartbeat_url: format!("{}/heartbeat", base),
            poll_url: format!("{}/poll", base),
            deregister_url: format!("{}/deregister", base),
            events_url: format!("{}/events", base),
            registered_at,
        }
    }
}

/// Heartbeat with self-reported load counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Heartbeat {
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default)]
    pub active_runs: i32,
    #[serde(default)]
    pub total_runs: i32,
    #[serde(default)]
    pub failed_runs: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    #[serde(default = "default_max_tasks")]
    pub max_tasks: i32,
}

fn default_max_tasks() -> i32 {
    1
}

/// Event reported by a worker about a run it executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub run_id: String,
    #[serde(flatten)]
    pub kind: WorkerEventKind,
}

impl WorkerEvent {
    pub fn new(run_id: impl Into<String>, kind: WorkerEventKind) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WorkerEventKind {
    NodeStarted {
        node_id: String,
    },
    NodeCompleted {
        node_id: String,
        #[serde(default)]
        output: Value,
    },
    /// Step boundary snapshot. The parent defaults to the thread's latest checkpoint.
    Checkpoint {
        #[serde(default)]
        checkpoint_ns: String,
        #[serde(default)]
        checkpoint_id: Option<String>,
        #[serde(default)]
        parent_checkpoint_id: Option<String>,
        #[serde(default)]
        channel_values: Value,
        #[serde(default)]
        channel_versions: Value,
        #[serde(default)]
        versions_seen: Value,
        #[serde(default)]
        pending_sends: Value,
        #[serde(default)]
        metadata: Value,
        /// Task writes staged against this checkpoint.
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        writes: Vec<PendingWrite>,
    },
    RunInterrupted {
        node_id: String,
        reason: String,
        #[serde(default)]
        state: Value,
        #[serde(default)]
        tool_calls: Vec<Value>,
    },
    RunCompleted {
        #[serde(default)]
        output: Value,
    },
    RunFailed {
        error: String,
    },
    RunTimeout {
        #[serde(default)]
        error: Option<String>,
    },
}

impl WorkerEventKind {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::Checkpoint { .. } => "checkpoint",
            Self::RunInterrupted { .. } => "run_interrupted",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunTimeout { .. } => "run_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registration_urls() {
        let resp = RegistrationResponse::for_worker("http://cp:8080/", "w-1", Utc::now());
        assert_eq!(resp.heartbeat_url, "http://cp:8080/api/v1/workers/w-1/heartbeat");
        assert_eq!(resp.poll_url, "http://cp:8080/api/v1/workers/w-1/poll");
        assert_eq!(resp.deregister_url, "http://cp:8080/api/v1/workers/w-1/deregister");
        assert_eq!(resp.events_url, "http://cp:8080/api/v1/workers/w-1/events");
    }

    #[test]
    fn test_worker_event_wire_format() {
        let event: WorkerEvent = serde_json::from_value(json!({
            "run_id": "r-1",
            "event_type": "run_failed",
            "error": "tool exploded: 500"
        }))
        .unwrap();
        assert_eq!(
            event.kind,
            WorkerEventKind::RunFailed {
                error: "tool exploded: 500".into()
            }
        );

        let event: WorkerEvent = serde_json::from_value(json!({
            "run_id": "r-1",
            "event_type": "checkpoint",
            "channel_values": {"messages": []}
        }))
        .unwrap();
        assert_eq!(event.kind.name(), "checkpoint");
    }

    #[test]
    fn test_poll_request_defaults_to_one() {
        let req: PollRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.max_tasks, 1);
    }
}
