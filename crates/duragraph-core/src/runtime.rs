// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable control plane.
//!
//! [`ControlPlane`] wires the services over one persistence backend and owns the
//! background loops (outbox relay, liveness monitor). Embed it in an existing tokio
//! application, or run the `duragraph-core` binary which does the same from environment
//! configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use duragraph_core::persistence::SqlitePersistence;
//! use duragraph_core::runtime::ControlPlane;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("data/duragraph.db").await?);
//!
//!     let plane = ControlPlane::builder()
//!         .persistence(persistence)
//!         .base_url("http://localhost:8080")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve the API using plane.runs(), plane.threads(), ...
//!
//!     plane.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::assistant::AssistantService;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::event_store::EventStore;
use crate::outbox::{
    BroadcastPublisher, FanoutPublisher, OutboxEnvelope, OutboxRelay, OutboxRelayConfig,
    Publisher, TracingPublisher,
};
use crate::persistence::Persistence;
use crate::run::{RunService, RunServiceConfig};
use crate::thread::ThreadService;
use crate::worker::{
    LivenessMonitor, LivenessMonitorConfig, TaskQueue, TaskQueueIngest, WorkerRegistry,
};

/// Builder for a [`ControlPlane`].
pub struct ControlPlaneBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    base_url: String,
    worker_liveness: Duration,
    liveness: LivenessMonitorConfig,
    relay: OutboxRelayConfig,
    runs: RunServiceConfig,
    publishers: Vec<Arc<dyn Publisher>>,
    event_bus_capacity: usize,
}

impl std::fmt::Debug for ControlPlaneBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("base_url", &self.base_url)
            .field("worker_liveness", &self.worker_liveness)
            .field("relay", &self.relay)
            .field("publishers", &self.publishers.len())
            .finish()
    }
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            base_url: "http://localhost:8080".to_string(),
            worker_liveness: Duration::from_secs(30),
            liveness: LivenessMonitorConfig::default(),
            relay: OutboxRelayConfig::default(),
            runs: RunServiceConfig::default(),
            publishers: Vec::new(),
            event_bus_capacity: 1024,
        }
    }
}

impl ControlPlaneBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every tunable from environment configuration. The persistence backend is still
    /// set separately.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new()
            .base_url(config.base_url.clone())
            .worker_liveness(config.worker_liveness);
        builder.relay.poll_interval = config.relay_interval;
        builder.relay.batch_size = config.relay_batch_size;
        builder.relay.retention =
            Duration::from_secs(config.outbox_retention_days.max(0) as u64 * 24 * 60 * 60);
        builder.runs.join_timeout = config.join_timeout;
        builder
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Public base URL handed to workers in registration responses.
    ///
    /// Default: `http://localhost:8080`
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Heartbeat age after which a worker is unhealthy.
    ///
    /// Default: 30 seconds
    pub fn worker_liveness(mut self, threshold: Duration) -> Self {
        self.worker_liveness = threshold;
        self
    }

    pub fn liveness_config(mut self, config: LivenessMonitorConfig) -> Self {
        self.liveness = config;
        self
    }

    pub fn relay_config(mut self, config: OutboxRelayConfig) -> Self {
        self.relay = config;
        self
    }

    pub fn run_config(mut self, config: RunServiceConfig) -> Self {
        self.runs = config;
        self
    }

    /// Add a destination for relayed outbox events, next to the built-in ones.
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// Build the control plane. Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlane> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        if self.worker_liveness.is_zero() {
            anyhow::bail!("worker liveness threshold must be greater than zero");
        }

        let events = EventStore::new(persistence.clone());
        let threads = ThreadService::new(events.clone(), persistence.clone());
        let assistants = AssistantService::new(events.clone(), persistence.clone());
        let checkpoints = CheckpointStore::new(events.clone(), persistence.clone());
        let registry = Arc::new(WorkerRegistry::new(self.base_url, self.worker_liveness));
        let queue = Arc::new(TaskQueue::new());
        let runs = RunService::new(
            events.clone(),
            persistence.clone(),
            threads.clone(),
            assistants.clone(),
            checkpoints.clone(),
            registry.clone(),
            queue.clone(),
            self.runs,
        );

        let bus = Arc::new(BroadcastPublisher::new(self.event_bus_capacity));
        let fanout = self.publishers.into_iter().fold(
            FanoutPublisher::new()
                .with(Arc::new(TracingPublisher))
                .with(bus.clone())
                .with(Arc::new(TaskQueueIngest::new(queue.clone()))),
            |fanout, publisher| fanout.with(publisher),
        );
        let relay = Arc::new(OutboxRelay::new(
            persistence.clone(),
            Arc::new(fanout),
            self.relay,
        ));
        let monitor = Arc::new(LivenessMonitor::new(registry.clone(), self.liveness));

        Ok(ControlPlane {
            persistence,
            events,
            threads,
            assistants,
            checkpoints,
            runs,
            registry,
            queue,
            bus,
            relay,
            monitor,
            tasks: Vec::new(),
        })
    }
}

/// The durable graph-run control plane.
///
/// Services are usable as soon as the plane is built; [`start`](Self::start) recovers the
/// task queue and spawns the background loops, [`shutdown`](Self::shutdown) stops them.
pub struct ControlPlane {
    persistence: Arc<dyn Persistence>,
    events: EventStore,
    threads: ThreadService,
    assistants: AssistantService,
    checkpoints: CheckpointStore,
    runs: RunService,
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    bus: Arc<BroadcastPublisher>,
    relay: Arc<OutboxRelay>,
    monitor: Arc<LivenessMonitor>,
    tasks: Vec<(&'static str, Arc<Notify>, JoinHandle<()>)>,
}

impl ControlPlane {
    /// Create a new builder for configuring the control plane.
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    /// Rebuild the task queue from the database and spawn the relay and liveness loops.
    pub async fn start(mut self) -> Result<Self> {
        let recovered = self.runs.recover().await?;

        let relay = self.relay.clone();
        let relay_shutdown = relay.shutdown_handle();
        let relay_handle = tokio::spawn(async move { relay.run().await });
        self.tasks.push(("outbox relay", relay_shutdown, relay_handle));

        let monitor = self.monitor.clone();
        let monitor_shutdown = monitor.shutdown_handle();
        let monitor_handle = tokio::spawn(async move { monitor.run().await });
        self.tasks
            .push(("liveness monitor", monitor_shutdown, monitor_handle));

        info!(recovered_tasks = recovered, "Control plane started");
        Ok(self)
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn threads(&self) -> &ThreadService {
        &self.threads
    }

    pub fn assistants(&self) -> &AssistantService {
        &self.assistants
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn runs(&self) -> &RunService {
        &self.runs
    }

    /// Worker registration, heartbeats and deregistration.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn relay(&self) -> &Arc<OutboxRelay> {
        &self.relay
    }

    pub fn monitor(&self) -> &Arc<LivenessMonitor> {
        &self.monitor
    }

    /// Receive every outbox event the relay publishes from now on, with its topic.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, OutboxEnvelope)> {
        self.bus.subscribe()
    }

    /// Whether all background loops are still running.
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|(_, _, h)| !h.is_finished())
    }

    /// Signal the background loops to stop and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("Control plane shutting down...");

        for (_, shutdown, _) in &self.tasks {
            shutdown.notify_one();
        }

        let mut failed = None;
        for (name, _, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!(task = name, "Background task panicked: {}", e);
                failed.get_or_insert(name);
            }
        }

        match failed {
            Some(name) => Err(anyhow::anyhow!("{} task panicked", name)),
            None => {
                info!("Control plane shutdown complete");
                Ok(())
            }
        }
    }
}
