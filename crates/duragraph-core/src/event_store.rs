// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event store with transactional outbox.
//!
//! Every aggregate change is expressed as events appended to the aggregate's stream with an
//! expected prior version. The append, the outbox rows for each event and the projection
//! rows derived from the new state are written in one transaction, so an event is never
//! durable without also being staged for delivery.
//!
//! ```text
//!   service ──► UnitOfWork { appends, projections } ──► Persistence::commit
//!                                                            │  one transaction
//!                          ┌─────────────────────────────────┼──────────────────┐
//!                          ▼                                 ▼                  ▼
//!                   event_streams + events               outbox         runs / threads / ...
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::persistence::{EventRecord, Persistence, ProjectionWrite};

/// Aggregate type of runs.
pub const AGGREGATE_RUN: &str = "run";
/// Aggregate type of threads.
pub const AGGREGATE_THREAD: &str = "thread";
/// Aggregate type of assistants.
pub const AGGREGATE_ASSISTANT: &str = "assistant";
/// Aggregate type of interrupts.
pub const AGGREGATE_INTERRUPT: &str = "interrupt";

/// A serializable domain event with a dotted type name such as `run.created`.
pub trait DomainEvent: Serialize {
    /// Event type stored with the event and used for topic routing.
    fn event_type(&self) -> &'static str;
}

/// Event about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Globally unique identifier; consumers deduplicate on it.
    pub event_id: String,
    /// Dotted event type.
    pub event_type: String,
    /// Event payload.
    pub payload: Value,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    /// Create an event with a fresh time-ordered identifier.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: uuid::Uuid::now_v7().to_string(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Serialize a domain event.
    pub fn from_domain<E: DomainEvent>(event: &E) -> Result<Self> {
        Ok(Self::new(event.event_type(), serde_json::to_value(event)?))
    }
}

/// Events to append to one stream, guarded by the stream's expected version.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamAppend {
    /// Aggregate type of the stream.
    pub aggregate_type: String,
    /// Aggregate identifier of the stream.
    pub aggregate_id: String,
    /// Version the caller last observed; 0 for a new stream.
    pub expected_version: i64,
    /// Events in order. The first one gets version `expected_version + 1`.
    pub events: Vec<NewEvent>,
}

/// Atomic write set: stream appends plus the projection writes derived from them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOfWork {
    /// Stream appends, each checked against its expected version.
    pub appends: Vec<StreamAppend>,
    /// Projection changes applied after the appends.
    pub projections: Vec<ProjectionWrite>,
}

impl UnitOfWork {
    /// Create an empty unit of work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage events for a stream.
    pub fn append(
        &mut self,
        aggregate_type: &str,
        aggregate_id: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> &mut Self {
        self.appends.push(StreamAppend {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            expected_version,
            events,
        });
        self
    }

    /// Stage a projection change.
    pub fn project(&mut self, write: ProjectionWrite) -> &mut Self {
        self.projections.push(write);
        self
    }

    /// Total number of events staged.
    pub fn event_count(&self) -> usize {
        self.appends.iter().map(|a| a.events.len()).sum()
    }

    /// Merge another unit of work into this one.
    pub fn extend(&mut self, other: UnitOfWork) {
        self.appends.extend(other.appends);
        self.projections.extend(other.projections);
    }

    fn validate(&self) -> Result<()> {
        for append in &self.appends {
            if append.events.is_empty() {
                return Err(CoreError::invalid_input(
                    "events",
                    format!(
                        "append to {} '{}' carries no events",
                        append.aggregate_type, append.aggregate_id
                    ),
                ));
            }
            if append.expected_version < 0 {
                return Err(CoreError::invalid_input(
                    "expected_version",
                    "must not be negative",
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for append in &self.appends {
            if !seen.insert((&append.aggregate_type, &append.aggregate_id)) {
                return Err(CoreError::invalid_input(
                    "appends",
                    format!(
                        "stream {} '{}' appears twice",
                        append.aggregate_type, append.aggregate_id
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Facade over the persistence layer for event-sourced aggregates.
#[derive(Clone)]
pub struct EventStore {
    persistence: Arc<dyn Persistence>,
}

impl EventStore {
    /// Create an event store over a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Append events to a single stream. Returns the new stream version.
    pub async fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<i64> {
        let count = events.len() as i64;
        let mut uow = UnitOfWork::new();
        uow.append(aggregate_type, aggregate_id, expected_version, events);
        self.commit(uow).await?;
        Ok(expected_version + count)
    }

    /// Commit a unit of work atomically.
    pub async fn commit(&self, uow: UnitOfWork) -> Result<()> {
        uow.validate()?;
        self.persistence.commit(&uow).await?;
        debug!(
            streams = uow.appends.len(),
            events = uow.event_count(),
            projections = uow.projections.len(),
            "Committed unit of work"
        );
        Ok(())
    }

    /// Load every event of a stream in version order.
    pub async fn load(&self, aggregate_type: &str, aggregate_id: &str) -> Result<Vec<EventRecord>> {
        self.persistence
            .load_events(aggregate_type, aggregate_id)
            .await
    }

    /// Current version of a stream, 0 if it does not exist.
    pub async fn version(&self, aggregate_type: &str, aggregate_id: &str) -> Result<i64> {
        self.persistence
            .stream_version(aggregate_type, aggregate_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use serde_json::json;

    async fn store() -> (EventStore, Arc<SqlitePersistence>) {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.expect("in-memory db"));
        (EventStore::new(persistence.clone()), persistence)
    }

    #[derive(Serialize)]
    struct Pinged {
        n: u32,
    }

    impl DomainEvent for Pinged {
        fn event_type(&self) -> &'static str {
            "test.pinged"
        }
    }

    #[tokio::test]
    async fn test_append_assigns_sequential_versions() {
        let (store, _) = store().await;

        let v = store
            .append(
                "test",
                "a",
                0,
                vec![
                    NewEvent::from_domain(&Pinged { n: 1 }).unwrap(),
                    NewEvent::from_domain(&Pinged { n: 2 }).unwrap(),
                ],
            )
            .await
            .expect("append");
        assert_eq!(v, 2);

        let v = store
            .append("test", "a", 2, vec![NewEvent::new("test.pinged", json!({"n": 3}))])
            .await
            .expect("append");
        assert_eq!(v, 3);

        let events = store.load("test", "a").await.unwrap();
        let versions: Vec<i64> = events.iter().map(|e| e.event_version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(events[0].payload, json!({"n": 1}));
        assert_eq!(events[0].metadata["event_type"], "test.pinged");
        assert_eq!(events[0].metadata["aggregate_type"], "test");
        assert_eq!(store.version("test", "a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let (store, _) = store().await;
        store
            .append("test", "a", 0, vec![NewEvent::new("test.pinged", json!({}))])
            .await
            .unwrap();

        let err = store
            .append("test", "a", 0, vec![NewEvent::new("test.pinged", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        let err = store
            .append("test", "b", 3, vec![NewEvent::new("test.pinged", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConcurrencyConflict {
                expected: 3,
                actual: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_every_event_has_an_outbox_row() {
        let (store, persistence) = store().await;
        let events = vec![
            NewEvent::new("test.pinged", json!({"n": 1})),
            NewEvent::new("test.pinged", json!({"n": 2})),
        ];
        let ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();
        store.append("test", "a", 0, events).await.unwrap();

        for id in ids {
            let row = persistence
                .get_outbox_by_event(&id)
                .await
                .unwrap()
                .expect("outbox row");
            assert!(!row.published);
            assert_eq!(row.attempts, 0);
            assert_eq!(row.aggregate_id, "a");
        }
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let (store, persistence) = store().await;
        store
            .append("test", "a", 0, vec![NewEvent::new("test.pinged", json!({}))])
            .await
            .unwrap();

        let fresh = NewEvent::new("test.pinged", json!({}));
        let fresh_id = fresh.event_id.clone();
        let mut uow = UnitOfWork::new();
        uow.append("test", "b", 0, vec![fresh])
            .append("test", "a", 0, vec![NewEvent::new("test.pinged", json!({}))]);

        let err = store.commit(uow).await.unwrap_err();
        assert_eq!(err.error_code(), "CONCURRENCY_CONFLICT");
        assert_eq!(store.version("test", "b").await.unwrap(), 0);
        assert!(
            persistence
                .get_outbox_by_event(&fresh_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_empty_append_is_rejected() {
        let (store, _) = store().await;
        let err = store.append("test", "a", 0, vec![]).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }
}
