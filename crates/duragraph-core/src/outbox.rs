// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbox relay: drains staged events and publishes them downstream.
//!
//! The relay is independent of the request path. Each pass fetches unpublished rows whose
//! retry time has passed, publishes them, then marks each row published or failed. A failed
//! row is retried after `2^attempts` minutes, capped at one hour. Delivery is at-least-once,
//! so consumers deduplicate on `event_id`.
//!
//! A second, slower timer deletes published rows older than the retention window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::persistence::{OutboxRecord, Persistence};

/// Longest delay between two delivery attempts, in minutes.
pub const MAX_BACKOFF_MINUTES: i64 = 60;

/// Delay before the next delivery attempt after `attempts` failures.
pub fn backoff_delay(attempts: i32) -> chrono::Duration {
    let minutes = if (0..6).contains(&attempts) {
        (1i64 << attempts).min(MAX_BACKOFF_MINUTES)
    } else if attempts < 0 {
        1
    } else {
        MAX_BACKOFF_MINUTES
    };
    chrono::Duration::minutes(minutes)
}

/// Topic for an event: `duragraph.{category}.{aggregate}.{event}`.
///
/// The category is `runs` for runs, `executions` for executions and `events` for every other
/// aggregate. A dotted event type that repeats the aggregate (`run.created`) contributes only
/// its suffix.
pub fn topic_for(aggregate_type: &str, event_type: &str) -> String {
    let category = match aggregate_type {
        "run" => "runs",
        "execution" => "executions",
        _ => "events",
    };
    let event = event_type
        .strip_prefix(aggregate_type)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(event_type);
    format!("duragraph.{}.{}.{}", category, aggregate_type, event)
}

/// Message published for each outbox row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl From<&OutboxRecord> for OutboxEnvelope {
    fn from(row: &OutboxRecord) -> Self {
        Self {
            event_id: row.event_id.clone(),
            aggregate_type: row.aggregate_type.clone(),
            aggregate_id: row.aggregate_id.clone(),
            event_type: row.event_type.clone(),
            payload: row.payload.clone(),
            metadata: row.metadata.clone(),
            timestamp: row.created_at,
        }
    }
}

/// Destination for relayed events.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one envelope. An error leaves the row unpublished for a later retry.
    async fn publish(&self, topic: &str, envelope: &OutboxEnvelope) -> Result<()>;
}

/// Publisher that only logs.
#[derive(Debug, Default, Clone)]
pub struct TracingPublisher;

#[async_trait]
impl Publisher for TracingPublisher {
    async fn publish(&self, topic: &str, envelope: &OutboxEnvelope) -> Result<()> {
        info!(
            topic = %topic,
            event_id = %envelope.event_id,
            aggregate_id = %envelope.aggregate_id,
            "Relayed event"
        );
        Ok(())
    }
}

/// In-process bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<(String, OutboxEnvelope)>,
}

impl BroadcastPublisher {
    /// Create a bus holding up to `capacity` undelivered messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to every subsequently published message.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, OutboxEnvelope)> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, topic: &str, envelope: &OutboxEnvelope) -> Result<()> {
        // No subscribers is not a delivery failure.
        let _ = self.tx.send((topic.to_string(), envelope.clone()));
        Ok(())
    }
}

/// Publishes to every inner publisher; fails if any of them fails.
#[derive(Clone, Default)]
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl FanoutPublisher {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination.
    pub fn with(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// Number of destinations.
    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    /// Whether there are no destinations.
    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

#[async_trait]
impl Publisher for FanoutPublisher {
    async fn publish(&self, topic: &str, envelope: &OutboxEnvelope) -> Result<()> {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(topic, envelope).await {
                warn!(topic = %topic, event_id = %envelope.event_id, error = %e, "Publisher failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Configuration for the outbox relay.
#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    /// Delay between relay passes.
    pub poll_interval: Duration,
    /// Rows fetched per pass.
    pub batch_size: i64,
    /// Published rows older than this are deleted.
    pub retention: Duration,
    /// How often the retention cleanup runs.
    pub cleanup_interval: Duration,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Rows published and marked.
    pub published: usize,
    /// Rows that failed and were rescheduled.
    pub failed: usize,
}

/// Background loop that drains the outbox.
pub struct OutboxRelay {
    persistence: Arc<dyn Persistence>,
    publisher: Arc<dyn Publisher>,
    config: OutboxRelayConfig,
    shutdown: Arc<Notify>,
}

impl OutboxRelay {
    /// Create a new relay.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        publisher: Arc<dyn Publisher>,
        config: OutboxRelayConfig,
    ) -> Self {
        Self {
            persistence,
            publisher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the relay loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            retention_secs = self.config.retention.as_secs(),
            "Outbox relay started"
        );

        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Outbox relay received shutdown signal");
                    break;
                }

                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!(error = %e, "Failed to clean up published outbox rows");
                    }
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.relay_once().await {
                        error!(error = %e, "Outbox relay pass failed");
                    }
                }
            }
        }

        info!("Outbox relay stopped");
    }

    /// Publish one batch of due rows.
    pub async fn relay_once(&self) -> Result<RelayStats> {
        let now = Utc::now();
        let rows = self
            .persistence
            .fetch_unpublished(self.config.batch_size, now)
            .await?;

        if rows.is_empty() {
            debug!("No outbox rows due");
            return Ok(RelayStats::default());
        }

        let mut stats = RelayStats::default();
        for row in &rows {
            let topic = topic_for(&row.aggregate_type, &row.event_type);
            let envelope = OutboxEnvelope::from(row);

            match self.publisher.publish(&topic, &envelope).await {
                Ok(()) => {
                    self.persistence.mark_published(row.id, Utc::now()).await?;
                    stats.published += 1;
                }
                Err(e) => {
                    warn!(
                        outbox_id = row.id,
                        event_id = %row.event_id,
                        attempts = row.attempts + 1,
                        error = %e,
                        "Failed to publish outbox row, scheduling retry"
                    );
                    self.persistence
                        .mark_failed(row.id, &e.to_string(), Utc::now())
                        .await?;
                    stats.failed += 1;
                }
            }
        }

        debug!(
            published = stats.published,
            failed = stats.failed,
            "Outbox relay pass complete"
        );
        Ok(stats)
    }

    /// Delete published rows older than the retention window.
    pub async fn cleanup(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| CoreError::internal("cleanup", format!("Invalid retention: {}", e)))?;
        let removed = self
            .persistence
            .cleanup_published(Utc::now() - retention)
            .await?;
        if removed > 0 {
            info!(removed, "Deleted published outbox rows past retention");
        }
        Ok(removed)
    }
}
