// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Thread aggregate and service.
//!
//! A thread is the conversation a run executes against. Its event stream doubles as the
//! arbitration token for multitask strategies: every run attached to the thread appends a
//! `thread.run_attached` event at the version the caller observed, so two concurrent run
//! requests on one thread cannot both pass arbitration.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument};

use crate::error::{CoreError, Result};
use crate::event_store::{AGGREGATE_THREAD, DomainEvent, EventStore, NewEvent, UnitOfWork};
use crate::persistence::{EventRecord, ListRunsFilter, Persistence, ProjectionWrite, ThreadRecord};
use crate::run::RunStatus;

use std::sync::Arc;

/// Projected thread status, derived from the runs executing on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// No run is executing.
    Idle,
    /// A run is executing.
    Busy,
    /// A run is paused waiting for input.
    Interrupted,
    /// The last run failed.
    Error,
}

impl ThreadStatus {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }

    /// Thread status implied by a run entering `status`.
    pub fn for_run_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Queued | RunStatus::InProgress => Self::Busy,
            RunStatus::Interrupted | RunStatus::RequiresAction => Self::Interrupted,
            RunStatus::Error | RunStatus::Timeout => Self::Error,
            RunStatus::Success | RunStatus::Cancelled => Self::Idle,
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "interrupted" => Ok(Self::Interrupted),
            "error" => Ok(Self::Error),
            other => Err(CoreError::invalid_input(
                "status",
                format!("unknown thread status '{}'", other),
            )),
        }
    }
}

/// Events on a thread stream.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadEvent {
    Created {
        thread_id: String,
        metadata: Value,
        created_at: DateTime<Utc>,
    },
    MetadataUpdated {
        metadata: Value,
        updated_at: DateTime<Utc>,
    },
    RunAttached {
        run_id: String,
        multitask_strategy: String,
        attached_at: DateTime<Utc>,
    },
    Deleted {
        deleted_at: DateTime<Utc>,
    },
}

impl DomainEvent for ThreadEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "thread.created",
            Self::MetadataUpdated { .. } => "thread.metadata_updated",
            Self::RunAttached { .. } => "thread.run_attached",
            Self::Deleted { .. } => "thread.deleted",
        }
    }
}

/// Event-sourced thread aggregate.
#[derive(Debug, Clone)]
pub struct Thread {
    id: String,
    metadata: Map<String, Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted: bool,
    version: i64,
    pending: Vec<ThreadEvent>,
}

fn as_object(value: Value, field: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        _ => Err(CoreError::invalid_input(field, "must be a JSON object")),
    }
}

impl Thread {
    fn blank(id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            metadata: Map::new(),
            created_at,
            updated_at: created_at,
            deleted: false,
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Start a new thread. A fresh id is generated when none is given.
    pub fn create(thread_id: Option<String>, metadata: Value) -> Result<Self> {
        let id = match thread_id {
            Some(id) if id.trim().is_empty() => {
                return Err(CoreError::invalid_input("thread_id", "must not be empty"));
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        let metadata = Value::Object(as_object(metadata, "metadata")?);
        let now = Utc::now();

        let mut thread = Self::blank(id.clone(), now);
        thread.record(ThreadEvent::Created {
            thread_id: id,
            metadata,
            created_at: now,
        });
        Ok(thread)
    }

    /// Rebuild a thread from its stream.
    pub fn from_events(records: &[EventRecord]) -> Result<Self> {
        let mut thread: Option<Self> = None;
        for record in records {
            let event: ThreadEvent = serde_json::from_value(record.payload.clone())?;
            if thread.is_none() {
                let ThreadEvent::Created {
                    thread_id,
                    created_at,
                    ..
                } = &event
                else {
                    return Err(CoreError::internal(
                        "rehydrate_thread",
                        format!("stream {} does not start with thread.created", record.stream_id),
                    ));
                };
                thread = Some(Self::blank(thread_id.clone(), *created_at));
            }
            if let Some(t) = thread.as_mut() {
                t.apply(&event);
                t.version = record.event_version;
            }
        }
        thread.ok_or_else(|| CoreError::internal("rehydrate_thread", "empty stream"))
    }

    fn apply(&mut self, event: &ThreadEvent) {
        match event {
            ThreadEvent::Created { metadata, .. } => {
                if let Value::Object(map) = metadata {
                    self.metadata = map.clone();
                }
            }
            ThreadEvent::MetadataUpdated {
                metadata,
                updated_at,
            } => {
                if let Value::Object(map) = metadata {
                    for (k, v) in map {
                        self.metadata.insert(k.clone(), v.clone());
                    }
                }
                self.updated_at = *updated_at;
            }
            ThreadEvent::RunAttached { attached_at, .. } => self.updated_at = *attached_at,
            ThreadEvent::Deleted { deleted_at } => {
                self.deleted = true;
                self.updated_at = *deleted_at;
            }
        }
    }

    fn record(&mut self, event: ThreadEvent) {
        self.apply(&event);
        self.pending.push(event);
    }

    fn ensure_live(&self, operation: &str) -> Result<()> {
        if self.deleted {
            return Err(CoreError::invalid_state("deleted", operation));
        }
        Ok(())
    }

    /// Merge keys into the thread metadata.
    pub fn update_metadata(&mut self, patch: Value) -> Result<()> {
        self.ensure_live("update thread")?;
        let patch = as_object(patch, "metadata")?;
        self.record(ThreadEvent::MetadataUpdated {
            metadata: Value::Object(patch),
            updated_at: Utc::now(),
        });
        Ok(())
    }

    /// Claim the thread for a new run.
    pub fn attach_run(&mut self, run_id: &str, multitask_strategy: &str) -> Result<()> {
        self.ensure_live("attach run")?;
        self.record(ThreadEvent::RunAttached {
            run_id: run_id.to_string(),
            multitask_strategy: multitask_strategy.to_string(),
            attached_at: Utc::now(),
        });
        Ok(())
    }

    /// Mark the thread deleted.
    pub fn delete(&mut self) -> Result<()> {
        self.ensure_live("delete thread")?;
        self.record(ThreadEvent::Deleted {
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Version of the stream the aggregate was loaded at (excludes pending events).
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the thread was created for a single stateless run.
    pub fn is_stateless(&self) -> bool {
        self.metadata.get("stateless") == Some(&Value::Bool(true))
    }

    /// Projection row for this thread. Status is owned by the run lifecycle.
    pub fn to_record(&self) -> ThreadRecord {
        ThreadRecord {
            thread_id: self.id.clone(),
            status: ThreadStatus::Idle.as_str().to_string(),
            metadata: Value::Object(self.metadata.clone()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Move pending events and the matching projection write into `uow`.
    pub fn stage(&mut self, uow: &mut UnitOfWork) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let events = self
            .pending
            .iter()
            .map(NewEvent::from_domain)
            .collect::<Result<Vec<_>>>()?;
        let count = events.len() as i64;
        uow.append(AGGREGATE_THREAD, &self.id, self.version, events);

        let metadata_changed = self.pending.iter().any(|e| {
            matches!(
                e,
                ThreadEvent::Created { .. } | ThreadEvent::MetadataUpdated { .. }
            )
        });
        if self.deleted {
            uow.project(ProjectionWrite::DeleteThread {
                thread_id: self.id.clone(),
            });
        } else if metadata_changed {
            uow.project(ProjectionWrite::UpsertThread(self.to_record()));
        }

        self.pending.clear();
        self.version += count;
        Ok(())
    }
}

/// Thread operations.
#[derive(Clone)]
pub struct ThreadService {
    events: EventStore,
    persistence: Arc<dyn Persistence>,
}

impl ThreadService {
    /// Create a new thread service.
    pub fn new(events: EventStore, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            events,
            persistence,
        }
    }

    /// Create a thread.
    #[instrument(skip(self, metadata))]
    pub async fn create(&self, thread_id: Option<String>, metadata: Value) -> Result<ThreadRecord> {
        let mut thread = Thread::create(thread_id, metadata)?;
        if self.events.version(AGGREGATE_THREAD, thread.id()).await? > 0 {
            return Err(CoreError::AlreadyExists {
                resource: "thread",
                id: thread.id().to_string(),
            });
        }

        let mut uow = UnitOfWork::new();
        thread.stage(&mut uow)?;
        self.events.commit(uow).await.map_err(|e| match e {
            CoreError::ConcurrencyConflict { aggregate_id, .. } => CoreError::AlreadyExists {
                resource: "thread",
                id: aggregate_id,
            },
            other => other,
        })?;

        info!(thread_id = %thread.id(), "Thread created");
        Ok(thread.to_record())
    }

    /// Create the ephemeral thread backing a stateless run.
    pub async fn create_stateless(&self) -> Result<ThreadRecord> {
        self.create(None, json!({ "stateless": true })).await
    }

    /// Load the aggregate. Deleted threads are reported as not found.
    pub async fn load(&self, thread_id: &str) -> Result<Thread> {
        let records = self.events.load(AGGREGATE_THREAD, thread_id).await?;
        if records.is_empty() {
            return Err(CoreError::not_found("thread", thread_id));
        }
        let thread = Thread::from_events(&records)?;
        if thread.is_deleted() {
            return Err(CoreError::not_found("thread", thread_id));
        }
        Ok(thread)
    }

    /// Read the thread projection.
    pub async fn get(&self, thread_id: &str) -> Result<ThreadRecord> {
        self.persistence
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| CoreError::not_found("thread", thread_id))
    }

    /// List threads, newest first.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ThreadRecord>> {
        let limit = if limit <= 0 { 100 } else { limit };
        self.persistence.list_threads(limit, offset.max(0)).await
    }

    /// Merge metadata into a thread.
    #[instrument(skip(self, metadata))]
    pub async fn update(&self, thread_id: &str, metadata: Value) -> Result<ThreadRecord> {
        let mut thread = self.load(thread_id).await?;
        thread.update_metadata(metadata)?;
        let mut uow = UnitOfWork::new();
        thread.stage(&mut uow)?;
        self.events.commit(uow).await?;
        self.get(thread_id).await
    }

    /// Delete a thread and everything projected for it. Rejected while a run is active.
    #[instrument(skip(self))]
    pub async fn delete(&self, thread_id: &str) -> Result<()> {
        let mut thread = self.load(thread_id).await?;

        let active = self
            .persistence
            .list_runs(&ListRunsFilter {
                thread_id: Some(thread_id.to_string()),
                statuses: RunStatus::ACTIVE.iter().map(|s| s.to_string()).collect(),
                limit: 1,
                offset: 0,
            })
            .await?;
        if let Some(run) = active.first() {
            return Err(CoreError::invalid_state(
                format!("run {} is {}", run.run_id, run.status),
                "delete thread",
            ));
        }

        thread.delete()?;
        let mut uow = UnitOfWork::new();
        thread.stage(&mut uow)?;
        self.events.commit(uow).await?;

        info!(thread_id = %thread_id, "Thread deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;

    async fn service() -> ThreadService {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.expect("in-memory db"));
        ThreadService::new(EventStore::new(persistence.clone()), persistence)
    }

    #[test]
    fn test_thread_status_follows_run_status() {
        assert_eq!(
            ThreadStatus::for_run_status(RunStatus::InProgress),
            ThreadStatus::Busy
        );
        assert_eq!(
            ThreadStatus::for_run_status(RunStatus::RequiresAction),
            ThreadStatus::Interrupted
        );
        assert_eq!(
            ThreadStatus::for_run_status(RunStatus::Timeout),
            ThreadStatus::Error
        );
        assert_eq!(
            ThreadStatus::for_run_status(RunStatus::Cancelled),
            ThreadStatus::Idle
        );
        assert_eq!("busy".parse::<ThreadStatus>().unwrap(), ThreadStatus::Busy);
        assert!("sleeping".parse::<ThreadStatus>().is_err());
    }

    #[test]
    fn test_metadata_must_be_an_object() {
        let err = Thread::create(None, json!([1, 2])).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        let err = Thread::create(Some("  ".to_string()), Value::Null).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_create_get_update_thread() {
        let svc = service().await;
        let created = svc
            .create(Some("t-1".to_string()), json!({"owner": "ops"}))
            .await
            .expect("create");
        assert_eq!(created.status, "idle");

        let updated = svc
            .update("t-1", json!({"topic": "billing"}))
            .await
            .expect("update");
        assert_eq!(updated.metadata, json!({"owner": "ops", "topic": "billing"}));
        assert_eq!(updated.status, "idle");

        let thread = svc.load("t-1").await.unwrap();
        assert_eq!(thread.version(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_thread_id_already_exists() {
        let svc = service().await;
        svc.create(Some("t-1".to_string()), Value::Null).await.unwrap();
        let err = svc
            .create(Some("t-1".to_string()), Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn test_deleted_thread_is_gone() {
        let svc = service().await;
        svc.create(Some("t-1".to_string()), Value::Null).await.unwrap();
        svc.delete("t-1").await.expect("delete");

        assert_eq!(svc.get("t-1").await.unwrap_err().error_code(), "NOT_FOUND");
        assert_eq!(svc.load("t-1").await.unwrap_err().error_code(), "NOT_FOUND");
        assert_eq!(
            svc.delete("t-1").await.unwrap_err().error_code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_stateless_thread_is_marked() {
        let svc = service().await;
        let record = svc.create_stateless().await.unwrap();
        let thread = svc.load(&record.thread_id).await.unwrap();
        assert!(thread.is_stateless());
    }
}
