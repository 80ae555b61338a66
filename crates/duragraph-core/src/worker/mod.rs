// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker registry and pull-based task distribution.
//!
//! Workers are independently deployed executors. They register the graphs they can run,
//! send heartbeats, and poll for tasks; the control plane never pushes work to them.
//!
//! ```text
//!  worker ── register ──► WorkerRegistry (soft state: capacity, heartbeats, graphs)
//!         ── heartbeat ─►       │
//!         ── poll ──────► RunService::poll ──► TaskQueue (keyed by graph_id)
//!         ── events ────► RunService::handle_worker_event ──► Run aggregate
//! ```
//!
//! Registry state lives in memory and is rebuilt from re-registration after a restart.

mod ingest;
mod monitor;
mod protocol;
mod queue;
mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub use ingest::TaskQueueIngest;
pub use monitor::{LivenessMonitor, LivenessMonitorConfig};
pub use protocol::{
    Heartbeat, PollRequest, Registration, RegistrationResponse, WorkerEvent, WorkerEventKind,
};
pub use queue::{TaskKind, TaskQueue, WorkerTask};
pub use registry::WorkerRegistry;

/// Worker status as self-reported, or `offline` once liveness is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Ready,
    Running,
    Idle,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Offline => "offline",
        }
    }
}

/// What a worker can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    /// Graph ids this worker can run.
    #[serde(default)]
    pub graphs: Vec<String>,
    pub max_concurrent_runs: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Graph structure as published by a worker, keyed by `graph_id` without versioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub graph_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    #[serde(default)]
    pub entry_point: String,
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub name: String,
    pub status: WorkerStatus,
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub graph_definitions: Vec<GraphDefinition>,
    pub active_runs: i32,
    pub total_runs: i32,
    pub failed_runs: i32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Whether the worker declared `graph_id`.
    pub fn can_execute(&self, graph_id: &str) -> bool {
        self.capabilities.graphs.iter().any(|g| g == graph_id)
    }

    /// `active_runs < max_concurrent_runs`.
    pub fn has_capacity(&self) -> bool {
        self.active_runs < self.capabilities.max_concurrent_runs
    }

    /// Free run slots.
    pub fn remaining_capacity(&self) -> i32 {
        (self.capabilities.max_concurrent_runs - self.active_runs).max(0)
    }

    /// Heartbeat younger than `threshold` as of `now`.
    pub fn is_healthy_at(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => now - self.last_heartbeat < threshold,
            Err(_) => true,
        }
    }

    pub fn is_healthy(&self, threshold: Duration) -> bool {
        self.is_healthy_at(threshold, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(active: i32, max: i32) -> Worker {
        let now = Utc::now();
        Worker {
            worker_id: "w".into(),
            name: "w".into(),
            status: WorkerStatus::Ready,
            capabilities: Capabilities {
                graphs: vec!["agent".into()],
                max_concurrent_runs: max,
            },
            graph_definitions: vec![],
            active_runs: active,
            total_runs: 0,
            failed_runs: 0,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    #[test]
    fn test_capacity() {
        assert!(worker(0, 2).has_capacity());
        assert!(!worker(2, 2).has_capacity());
        assert_eq!(worker(1, 3).remaining_capacity(), 2);
        assert_eq!(worker(5, 3).remaining_capacity(), 0);
    }

    #[test]
    fn test_liveness_threshold() {
        let mut w = worker(0, 1);
        let now = Utc::now();
        w.last_heartbeat = now - chrono::Duration::seconds(10);
        assert!(w.is_healthy_at(Duration::from_secs(30), now));
        assert!(!w.is_healthy_at(Duration::from_secs(10), now));
    }

    #[test]
    fn test_can_execute() {
        let w = worker(0, 1);
        assert!(w.can_execute("agent"));
        assert!(!w.can_execute("other"));
    }

    #[test]
    fn test_graph_definition_wire_format() {
        let def: GraphDefinition = serde_json::from_value(serde_json::json!({
            "graph_id": "agent",
            "nodes": [{"id": "llm", "type": "llm"}],
            "edges": [{"source": "llm", "target": "end", "condition": "done"}],
            "entry_point": "llm"
        }))
        .unwrap();
        assert_eq!(def.nodes[0].node_type, "llm");
        assert_eq!(def.edges[0].condition.as_deref(), Some("done"));
        assert!(def.name.is_empty());
    }
}
