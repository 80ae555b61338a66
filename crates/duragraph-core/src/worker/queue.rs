// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pollable task queue keyed by graph id.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

/// Whether a task starts a run or continues an interrupted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Start,
    Resume,
}

/// Unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub run_id: String,
    pub thread_id: String,
    pub assistant_id: String,
    pub graph_id: String,
    pub input: Value,
    pub config: Value,
    /// Resume payload: tool outputs or the resume command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,
    /// Checkpoint to continue from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkerTask {
    /// Task id derived from the run id.
    pub fn task_id_for(run_id: &str) -> String {
        format!("task-{}", run_id)
    }
}

#[derive(Default)]
struct Inner {
    by_graph: HashMap<String, VecDeque<WorkerTask>>,
    runs: HashSet<String>,
}

/// FIFO queues per graph, holding at most one task per run.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Returns false if a task for the same run is already queued.
    pub async fn push(&self, task: WorkerTask) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.runs.insert(task.run_id.clone()) {
            return false;
        }
        inner
            .by_graph
            .entry(task.graph_id.clone())
            .or_default()
            .push_back(task);
        true
    }

    /// Remove up to `max` tasks for the given graphs, oldest first across graphs.
    pub async fn take(&self, graphs: &[String], max: usize) -> Vec<WorkerTask> {
        let mut inner = self.inner.lock().await;
        let mut taken = Vec::new();
        while taken.len() < max {
            let oldest = graphs
                .iter()
                .filter_map(|g| {
                    inner
                        .by_graph
                        .get(g)
                        .and_then(|q| q.front())
                        .map(|t| (t.created_at, g.clone()))
                })
                .min_by_key(|(created_at, _)| *created_at);
            let Some((_, graph)) = oldest else {
                break;
            };
            if let Some(task) = inner.by_graph.get_mut(&graph).and_then(VecDeque::pop_front) {
                inner.runs.remove(&task.run_id);
                taken.push(task);
            }
        }
        inner.by_graph.retain(|_, q| !q.is_empty());
        taken
    }

    /// Drop the queued task of a run. Returns whether one was queued.
    pub async fn remove_run(&self, run_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.runs.remove(run_id) {
            return false;
        }
        for queue in inner.by_graph.values_mut() {
            queue.retain(|t| t.run_id != run_id);
        }
        inner.by_graph.retain(|_, q| !q.is_empty());
        true
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.inner.lock().await.runs.contains(run_id)
    }

    /// Number of queued tasks for one graph.
    pub async fn depth(&self, graph_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .by_graph
            .get(graph_id)
            .map_or(0, VecDeque::len)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.runs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(run_id: &str, graph_id: &str, age_secs: i64) -> WorkerTask {
        WorkerTask {
            task_id: WorkerTask::task_id_for(run_id),
            kind: TaskKind::Start,
            run_id: run_id.to_string(),
            thread_id: "t".into(),
            assistant_id: "a".into(),
            graph_id: graph_id.to_string(),
            input: json!({}),
            config: json!({}),
            resume: None,
            checkpoint_id: None,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_push_deduplicates_by_run() {
        let q = TaskQueue::new();
        assert!(q.push(task("r1", "agent", 0)).await);
        assert!(!q.push(task("r1", "agent", 0)).await);
        assert_eq!(q.len().await, 1);
        assert_eq!(q.depth("agent").await, 1);
    }

    #[tokio::test]
    async fn test_take_only_eligible_graphs_oldest_first() {
        let q = TaskQueue::new();
        q.push(task("r1", "agent", 5)).await;
        q.push(task("r2", "other", 10)).await;
        q.push(task("r3", "search", 20)).await;
        q.push(task("r4", "agent", 1)).await;

        let graphs = vec!["agent".to_string(), "other".to_string()];
        let taken: Vec<String> = q
            .take(&graphs, 2)
            .await
            .into_iter()
            .map(|t| t.run_id)
            .collect();
        assert_eq!(taken, vec!["r2", "r1"]);
        assert!(!q.contains("r1").await);
        assert!(q.contains("r3").await);

        let rest = q.take(&graphs, 10).await;
        assert_eq!(rest.len(), 1);
        assert!(q.take(&graphs, 10).await.is_empty());
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_run() {
        let q = TaskQueue::new();
        q.push(task("r1", "agent", 0)).await;
        assert!(q.remove_run("r1").await);
        assert!(!q.remove_run("r1").await);
        assert!(q.is_empty().await);
        assert!(q.push(task("r1", "agent", 0)).await);
    }
}
