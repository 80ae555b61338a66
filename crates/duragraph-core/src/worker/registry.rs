// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory worker registry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{GraphDefinition, Heartbeat, Registration, RegistrationResponse, Worker, WorkerStatus};
use crate::error::{CoreError, Result};

/// Registry of workers keyed by id.
///
/// The registry is authoritative only for liveness classification. Counters are whatever
/// the worker last reported, adjusted locally as tasks are handed out and finished.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Worker>>,
    base_url: String,
    liveness_threshold: Duration,
}

impl WorkerRegistry {
    pub fn new(base_url: impl Into<String>, liveness_threshold: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            base_url: base_url.into(),
            liveness_threshold,
        }
    }

    /// Heartbeat age above which a worker is unhealthy.
    pub fn liveness_threshold(&self) -> Duration {
        self.liveness_threshold
    }

    /// Register or re-register a worker. Re-registration replaces the previous entry,
    /// including its graph definitions.
    pub async fn register(&self, reg: Registration) -> Result<RegistrationResponse> {
        if reg.worker_id.trim().is_empty() {
            return Err(CoreError::invalid_input("worker_id", "must not be empty"));
        }
        if reg.capabilities.max_concurrent_runs <= 0 {
            return Err(CoreError::invalid_input(
                "capabilities.max_concurrent_runs",
                "must be positive",
            ));
        }
        if let Some(def) = reg
            .graph_definitions
            .iter()
            .find(|d| d.graph_id.trim().is_empty())
        {
            return Err(CoreError::invalid_input(
                "graph_definitions.graph_id",
                format!("graph definition '{}' has no graph_id", def.name),
            ));
        }

        let now = Utc::now();
        let worker = Worker {
            worker_id: reg.worker_id.clone(),
            name: if reg.name.is_empty() {
                reg.worker_id.clone()
            } else {
                reg.name
            },
            status: WorkerStatus::Ready,
            capabilities: reg.capabilities,
            graph_definitions: reg.graph_definitions,
            active_runs: 0,
            total_runs: 0,
            failed_runs: 0,
            last_heartbeat: now,
            registered_at: now,
        };

        info!(
            worker_id = %worker.worker_id,
            graphs = ?worker.capabilities.graphs,
            max_concurrent_runs = worker.capabilities.max_concurrent_runs,
            "Worker registered"
        );
        self.workers
            .write()
            .await
            .insert(worker.worker_id.clone(), worker);

        Ok(RegistrationResponse::for_worker(
            &self.base_url,
            &reg.worker_id,
            now,
        ))
    }

    /// Record a heartbeat.
    pub async fn heartbeat(&self, worker_id: &str, hb: Heartbeat) -> Result<Worker> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::not_found("worker", worker_id))?;
        worker.status = hb.status;
        worker.active_runs = hb.active_runs.max(0);
        worker.total_runs = hb.total_runs.max(0);
        worker.failed_runs = hb.failed_runs.max(0);
        worker.last_heartbeat = Utc::now();
        debug!(worker_id = %worker_id, active_runs = worker.active_runs, "Heartbeat");
        Ok(worker.clone())
    }

    /// Remove a worker explicitly.
    pub async fn deregister(&self, worker_id: &str) -> Result<()> {
        match self.workers.write().await.remove(worker_id) {
            Some(_) => {
                info!(worker_id = %worker_id, "Worker deregistered");
                Ok(())
            }
            None => Err(CoreError::not_found("worker", worker_id)),
        }
    }

    pub async fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// All workers, or only the healthy ones, ordered by id.
    pub async fn list(&self, healthy_only: bool) -> Vec<Worker> {
        let now = Utc::now();
        let mut workers: Vec<Worker> = self
            .workers
            .read()
            .await
            .values()
            .filter(|w| !healthy_only || w.is_healthy_at(self.liveness_threshold, now))
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    /// Workers whose heartbeat is younger than the liveness threshold.
    pub async fn healthy_workers(&self) -> Vec<Worker> {
        self.list(true).await
    }

    /// A healthy worker with capacity for `graph_id`, if any.
    pub async fn find_worker_for_graph(&self, graph_id: &str) -> Option<Worker> {
        let now = Utc::now();
        self.workers
            .read()
            .await
            .values()
            .filter(|w| {
                w.can_execute(graph_id)
                    && w.has_capacity()
                    && w.is_healthy_at(self.liveness_threshold, now)
            })
            .min_by_key(|w| w.active_runs)
            .cloned()
    }

    /// Definition of `graph_id` from the most recently registered worker that publishes it.
    pub async fn graph_definition(&self, graph_id: &str) -> Option<GraphDefinition> {
        self.workers
            .read()
            .await
            .values()
            .filter_map(|w| {
                w.graph_definitions
                    .iter()
                    .find(|d| d.graph_id == graph_id)
                    .map(|d| (w.registered_at, d))
            })
            .max_by_key(|(registered_at, _)| *registered_at)
            .map(|(_, d)| d.clone())
    }

    /// Claim up to `wanted` run slots on a healthy worker. Returns the graphs it serves and
    /// the number of slots granted; slots not used must be given back with [`Self::release`].
    pub(crate) async fn reserve(&self, worker_id: &str, wanted: i32) -> Option<(Vec<String>, i32)> {
        let now = Utc::now();
        let mut workers = self.workers.write().await;
        let worker = workers.get_mut(worker_id)?;
        if !worker.is_healthy_at(self.liveness_threshold, now) || !worker.has_capacity() {
            return None;
        }
        let granted = wanted.min(worker.remaining_capacity());
        worker.active_runs += granted;
        Some((worker.capabilities.graphs.clone(), granted))
    }

    /// Give back unused slots without counting a run.
    pub(crate) async fn unreserve(&self, worker_id: &str, slots: i32) {
        if slots <= 0 {
            return;
        }
        if let Some(worker) = self.workers.write().await.get_mut(worker_id) {
            worker.active_runs = (worker.active_runs - slots).max(0);
        }
    }

    /// A run executed by the worker ended.
    pub async fn release(&self, worker_id: &str, failed: bool) {
        if let Some(worker) = self.workers.write().await.get_mut(worker_id) {
            worker.active_runs = (worker.active_runs - 1).max(0);
            worker.total_runs += 1;
            if failed {
                worker.failed_runs += 1;
            }
        }
    }

    /// Mark workers with a stale heartbeat offline. They stay registered.
    pub async fn mark_stale_offline(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut marked = Vec::new();
        for worker in self.workers.write().await.values_mut() {
            if worker.status != WorkerStatus::Offline
                && !worker.is_healthy_at(self.liveness_threshold, now)
            {
                warn!(
                    worker_id = %worker.worker_id,
                    last_heartbeat = %worker.last_heartbeat,
                    "Worker heartbeat is stale, marking offline"
                );
                worker.status = WorkerStatus::Offline;
                marked.push(worker.worker_id.clone());
            }
        }
        marked
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn set_last_heartbeat(&self, worker_id: &str, at: DateTime<Utc>) {
        if let Some(worker) = self.workers.write().await.get_mut(worker_id) {
            worker.last_heartbeat = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Capabilities;

    fn registration(id: &str, graphs: &[&str], max: i32) -> Registration {
        Registration {
            worker_id: id.to_string(),
            name: String::new(),
            capabilities: Capabilities {
                graphs: graphs.iter().map(|g| g.to_string()).collect(),
                max_concurrent_runs: max,
            },
            graph_definitions: vec![],
        }
    }

    fn definition(graph_id: &str, entry: &str) -> GraphDefinition {
        GraphDefinition {
            graph_id: graph_id.to_string(),
            name: graph_id.to_string(),
            description: String::new(),
            nodes: vec![],
            edges: vec![],
            entry_point: entry.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_returns_protocol_urls() {
        let registry = WorkerRegistry::new("http://cp", Duration::from_secs(30));
        let resp = registry
            .register(registration("w-1", &["agent"], 2))
            .await
            .unwrap();
        assert_eq!(resp.poll_url, "http://cp/api/v1/workers/w-1/poll");

        let w = registry.get("w-1").await.unwrap();
        assert_eq!(w.name, "w-1");
        assert_eq!(w.status, WorkerStatus::Ready);
        assert_eq!(w.last_heartbeat, w.registered_at);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let registry = WorkerRegistry::new("http://cp", Duration::from_secs(30));
        let err = registry
            .register(registration("", &["agent"], 1))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        let err = registry
            .register(registration("w", &["agent"], 0))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker() {
        let registry = WorkerRegistry::new("http://cp", Duration::from_secs(30));
        let err = registry
            .heartbeat("ghost", Heartbeat::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert_eq!(
            registry.deregister("ghost").await.unwrap_err().error_code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_stale_worker_excluded_but_not_removed() {
        let registry = WorkerRegistry::new("http://cp", Duration::from_secs(30));
        registry.register(registration("fresh", &["agent"], 1)).await.unwrap();
        registry.register(registration("stale", &["agent"], 1)).await.unwrap();
        registry
            .set_last_heartbeat("stale", Utc::now() - chrono::Duration::seconds(60))
            .await;

        let healthy: Vec<String> = registry
            .healthy_workers()
            .await
            .into_iter()
            .map(|w| w.worker_id)
            .collect();
        assert_eq!(healthy, vec!["fresh"]);
        assert_eq!(registry.list(false).await.len(), 2);

        let marked = registry.mark_stale_offline(Utc::now()).await;
        assert_eq!(marked, vec!["stale"]);
        assert_eq!(registry.get("stale").await.unwrap().status, WorkerStatus::Offline);
        assert!(registry.mark_stale_offline(Utc::now()).await.is_empty());
        assert!(registry.reserve("stale", 1).await.is_none());

        registry
            .heartbeat(
                "stale",
                Heartbeat {
                    status: WorkerStatus::Idle,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(registry.healthy_workers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_reserve_respects_capacity() {
        let registry = WorkerRegistry::new("http://cp", Duration::from_secs(30));
        registry.register(registration("w", &["agent"], 2)).await.unwrap();

        let (graphs, granted) = registry.reserve("w", 5).await.unwrap();
        assert_eq!(graphs, vec!["agent"]);
        assert_eq!(granted, 2);
        assert!(registry.reserve("w", 1).await.is_none());
        assert!(registry.find_worker_for_graph("agent").await.is_none());

        registry.unreserve("w", 1).await;
        registry.release("w", true).await;
        let w = registry.get("w").await.unwrap();
        assert_eq!(w.active_runs, 0);
        assert_eq!(w.total_runs, 1);
        assert_eq!(w.failed_runs, 1);
        assert!(registry.find_worker_for_graph("agent").await.is_some());
    }

    #[tokio::test]
    async fn test_latest_registration_supersedes_graph_definition() {
        let registry = WorkerRegistry::new("http://cp", Duration::from_secs(30));
        let mut first = registration("w-1", &["agent"], 1);
        first.graph_definitions = vec![definition("agent", "old")];
        registry.register(first).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut second = registration("w-2", &["agent"], 1);
        second.graph_definitions = vec![definition("agent", "new")];
        registry.register(second).await.unwrap();

        let def = registry.graph_definition("agent").await.unwrap();
        assert_eq!(def.entry_point, "new");
        assert!(registry.graph_definition("missing").await.is_none());
    }
}
