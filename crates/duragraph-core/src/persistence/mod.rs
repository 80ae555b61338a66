// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for duragraph-core.
//!
//! The relational store is the single source of truth. Aggregates write through
//! [`Persistence::commit`], which appends events, stages outbox rows and applies
//! projection writes in one transaction. Checkpoints are written directly.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CoreError;
use crate::event_store::{StreamAppend, UnitOfWork};

/// Stream identifier for an aggregate.
pub fn stream_id(aggregate_type: &str, aggregate_id: &str) -> String {
    format!("{}:{}", aggregate_type, aggregate_id)
}

/// Metadata stored beside every event payload.
pub(crate) fn event_metadata(aggregate_type: &str, event_type: &str) -> Value {
    serde_json::json!({
        "event_type": event_type,
        "aggregate_type": aggregate_type,
    })
}

/// Conflict error for a stream append.
pub(crate) fn conflict(append: &StreamAppend, actual: i64) -> CoreError {
    CoreError::ConcurrencyConflict {
        aggregate_type: append.aggregate_type.clone(),
        aggregate_id: append.aggregate_id.clone(),
        expected: append.expected_version,
        actual,
    }
}

/// `(checkpoint_ns, checkpoint_id, parent_checkpoint_id)` of a stored checkpoint.
pub(crate) type CheckpointLink = (String, String, Option<String>);

/// Parent links to rewrite when the checkpoints in `removed` are dropped.
///
/// `removed` maps `(checkpoint_ns, checkpoint_id)` of each dropped checkpoint to its parent.
/// Every survivor whose parent is dropped is re-linked to its nearest kept ancestor, or
/// becomes a root.
pub(crate) fn relink_parents(
    removed: &HashMap<(String, String), Option<String>>,
    survivors: Vec<CheckpointLink>,
) -> Vec<CheckpointLink> {
    survivors
        .into_iter()
        .filter_map(|(ns, id, parent)| {
            let mut ancestor = parent.clone();
            for _ in 0..removed.len() {
                let Some(up) = ancestor
                    .as_ref()
                    .and_then(|p| removed.get(&(ns.clone(), p.clone())))
                else {
                    break;
                };
                ancestor = up.clone();
            }
            (ancestor != parent).then_some((ns, id, ancestor))
        })
        .collect()
}

// ============================================================================
// Record Types
// ============================================================================

/// Persisted domain event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRecord {
    /// Database primary key.
    pub id: i64,
    /// Globally unique event identifier.
    pub event_id: String,
    /// Stream the event belongs to.
    pub stream_id: String,
    /// Aggregate type (run, thread, assistant, interrupt).
    pub aggregate_type: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Dotted event type, e.g. `run.created`.
    pub event_type: String,
    /// Version of the stream after this event.
    pub event_version: i64,
    /// Event payload.
    pub payload: Value,
    /// Event metadata (`event_type`, `aggregate_type`).
    pub metadata: Value,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// Outbox row staged alongside an event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRecord {
    /// Database primary key.
    pub id: i64,
    /// Event this row delivers.
    pub event_id: String,
    /// Aggregate type of the source event.
    pub aggregate_type: String,
    /// Aggregate identifier of the source event.
    pub aggregate_id: String,
    /// Event type of the source event.
    pub event_type: String,
    /// Copy of the event payload.
    pub payload: Value,
    /// Copy of the event metadata.
    pub metadata: Value,
    /// When the row was staged.
    pub created_at: DateTime<Utc>,
    /// Whether the row has been delivered.
    pub published: bool,
    /// When the row was delivered.
    pub published_at: Option<DateTime<Utc>>,
    /// Failed delivery attempts so far.
    pub attempts: i32,
    /// Last delivery error.
    pub last_error: Option<String>,
    /// Earliest time the next delivery may be attempted.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Run projection row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RunRecord {
    pub run_id: String,
    pub thread_id: String,
    pub assistant_id: String,
    pub status: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub config: Value,
    pub metadata: Value,
    pub multitask_strategy: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Thread projection row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub status: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Assistant projection row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AssistantRecord {
    pub assistant_id: String,
    pub graph_id: String,
    pub name: String,
    pub description: Option<String>,
    pub config: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Interrupt projection row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InterruptRecord {
    pub interrupt_id: String,
    pub run_id: String,
    pub thread_id: String,
    pub node_id: String,
    pub reason: String,
    pub state: Value,
    pub tool_calls: Value,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CheckpointRecord {
    /// Insertion sequence; orders checkpoints within a thread.
    #[sqlx(default)]
    pub seq: i64,
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    /// Run that produced the checkpoint, if any.
    pub run_id: Option<String>,
    pub channel_values: Value,
    pub channel_versions: Value,
    pub versions_seen: Value,
    pub pending_sends: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Staged channel write within a checkpoint step.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CheckpointWriteRecord {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    pub task_id: String,
    pub idx: i32,
    pub channel: String,
    #[sqlx(rename = "type")]
    pub write_type: String,
    pub blob: Value,
    pub created_at: DateTime<Utc>,
}

/// Filter options for listing runs.
#[derive(Debug, Clone, Default)]
pub struct ListRunsFilter {
    /// Only runs on this thread.
    pub thread_id: Option<String>,
    /// Only runs in one of these statuses.
    pub statuses: Vec<String>,
    /// Maximum rows returned (0 means the backend default of 100).
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

impl ListRunsFilter {
    pub(crate) fn effective_limit(&self) -> i64 {
        if self.limit <= 0 { 100 } else { self.limit }
    }
}

/// Projection change applied inside [`Persistence::commit`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionWrite {
    /// Insert or replace a run row.
    UpsertRun(RunRecord),
    /// Remove a run row and its interrupts.
    DeleteRun { run_id: String },
    /// Insert or replace a thread row.
    UpsertThread(ThreadRecord),
    /// Change only the status of a thread.
    SetThreadStatus {
        thread_id: String,
        status: String,
        updated_at: DateTime<Utc>,
    },
    /// Remove a thread with its runs, interrupts and checkpoints.
    DeleteThread { thread_id: String },
    /// Insert or replace an assistant row.
    UpsertAssistant(AssistantRecord),
    /// Remove an assistant row.
    DeleteAssistant { assistant_id: String },
    /// Insert or replace an interrupt row.
    UpsertInterrupt(InterruptRecord),
    /// Store a checkpoint in the same transaction as the events.
    SaveCheckpoint(CheckpointRecord),
    /// Drop the checkpoints and writes a run produced on a thread.
    DeleteRunCheckpoints { thread_id: String, run_id: String },
}

/// Persistence interface used by the control-plane services.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------------
    // Event store
    // ------------------------------------------------------------------------

    /// Append events to one or more streams, stage outbox rows and apply projections atomically.
    ///
    /// Fails with [`CoreError::ConcurrencyConflict`] when any stream is not at its expected
    /// version. Nothing is written in that case.
    async fn commit(&self, uow: &UnitOfWork) -> Result<(), CoreError>;

    async fn load_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<EventRecord>, CoreError>;

    /// Current version of a stream, 0 if it does not exist.
    async fn stream_version(&self, aggregate_type: &str, aggregate_id: &str)
    -> Result<i64, CoreError>;

    // ------------------------------------------------------------------------
    // Outbox
    // ------------------------------------------------------------------------

    /// Unpublished rows whose retry time has passed, oldest first.
    async fn fetch_unpublished(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, CoreError>;

    async fn get_outbox_by_event(&self, event_id: &str) -> Result<Option<OutboxRecord>, CoreError>;

    async fn mark_published(&self, id: i64, now: DateTime<Utc>) -> Result<(), CoreError>;

    /// Record a failed delivery and schedule the next attempt with capped exponential backoff.
    async fn mark_failed(&self, id: i64, error: &str, now: DateTime<Utc>)
    -> Result<(), CoreError>;

    /// Delete published rows older than `older_than`. Returns the number of rows removed.
    async fn cleanup_published(&self, older_than: DateTime<Utc>) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    /// Insert a checkpoint, or overwrite the data columns of an existing one with the same
    /// identity. `parent_checkpoint_id` is never changed by an overwrite.
    async fn save_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<(), CoreError>;

    async fn get_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError>;

    async fn latest_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError>;

    /// Walk the parent chain starting at `start_checkpoint_id`, newest first.
    async fn checkpoint_chain(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        start_checkpoint_id: &str,
        limit: i64,
    ) -> Result<Vec<CheckpointRecord>, CoreError>;

    async fn put_writes(&self, writes: &[CheckpointWriteRecord]) -> Result<(), CoreError>;

    async fn list_writes(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<CheckpointWriteRecord>, CoreError>;

    // ------------------------------------------------------------------------
    // Projections
    // ------------------------------------------------------------------------

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError>;

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>, CoreError>;

    async fn list_threads(&self, limit: i64, offset: i64) -> Result<Vec<ThreadRecord>, CoreError>;

    async fn get_assistant(&self, assistant_id: &str)
    -> Result<Option<AssistantRecord>, CoreError>;

    async fn list_assistants(
        &self,
        graph_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AssistantRecord>, CoreError>;

    async fn get_unresolved_interrupt(
        &self,
        run_id: &str,
    ) -> Result<Option<InterruptRecord>, CoreError>;

    async fn list_interrupts(&self, run_id: &str) -> Result<Vec<InterruptRecord>, CoreError>;

    /// Check database connectivity.
    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}
