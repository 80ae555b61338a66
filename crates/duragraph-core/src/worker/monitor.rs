// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background liveness monitor.
//!
//! Workers whose last heartbeat is older than the liveness threshold are marked `offline`.
//! They stay registered: a later heartbeat brings them back, and deregistration is always
//! explicit. Polling already ignores stale workers, so the monitor only makes the
//! classification visible in listings.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::WorkerRegistry;

/// Configuration for the liveness monitor.
#[derive(Debug, Clone)]
pub struct LivenessMonitorConfig {
    /// How often to scan the registry.
    pub poll_interval: Duration,
}

impl Default for LivenessMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Periodically marks stale workers offline.
pub struct LivenessMonitor {
    registry: Arc<WorkerRegistry>,
    config: LivenessMonitorConfig,
    shutdown: Arc<Notify>,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<WorkerRegistry>, config: LivenessMonitorConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            liveness_threshold_secs = self.registry.liveness_threshold().as_secs(),
            "Liveness monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Liveness monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.check_once().await;
                }
            }
        }

        info!("Liveness monitor stopped");
    }

    /// One scan. Returns how many workers were marked offline.
    pub async fn check_once(&self) -> usize {
        let marked = self.registry.mark_stale_offline(Utc::now()).await;
        if marked.is_empty() {
            debug!("No stale workers");
        } else {
            info!(count = marked.len(), workers = ?marked, "Marked stale workers offline");
        }
        marked.len()
    }
}
