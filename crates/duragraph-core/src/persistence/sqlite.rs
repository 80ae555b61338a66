// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::error::{CoreError, is_unique_violation};
use crate::event_store::{StreamAppend, UnitOfWork};
use crate::outbox::backoff_delay;

use super::{
    AssistantRecord, CheckpointRecord, CheckpointWriteRecord, EventRecord, InterruptRecord,
    ListRunsFilter, OutboxRecord, Persistence, ProjectionWrite, RunRecord, ThreadRecord,
    CheckpointLink, conflict, event_metadata, relink_parents, stream_id,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/duragraph.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::internal(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Private in-memory database. Single connection, so every caller sees the same data.
    pub async fn in_memory() -> Result<Self, CoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| {
                CoreError::internal("connect", format!("Failed to connect to {}: {}", url, e))
            })?;

        crate::migrations::SQLITE
            .run(&pool)
            .await
            .map_err(|e| CoreError::internal("migrate", format!("Failed to run migrations: {}", e)))?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Write path helpers (run inside the commit transaction)
// ============================================================================

async fn append_stream(conn: &mut SqliteConnection, append: &StreamAppend) -> Result<(), CoreError> {
    let sid = stream_id(&append.aggregate_type, &append.aggregate_id);
    let now = Utc::now();

    let current: Option<i64> =
        sqlx::query_scalar("SELECT version FROM event_streams WHERE stream_id = ?1")
            .bind(&sid)
            .fetch_optional(&mut *conn)
            .await?;

    let actual = current.unwrap_or(0);
    if actual != append.expected_version {
        return Err(conflict(append, actual));
    }

    let new_version = append.expected_version + append.events.len() as i64;

    if current.is_none() {
        let inserted = sqlx::query(
            r#"
            INSERT INTO event_streams (stream_id, aggregate_type, aggregate_id, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(&sid)
        .bind(&append.aggregate_type)
        .bind(&append.aggregate_id)
        .bind(new_version)
        .bind(now)
        .execute(&mut *conn)
        .await;

        if let Err(e) = inserted {
            return Err(if is_unique_violation(&e) {
                conflict(append, append.expected_version + 1)
            } else {
                e.into()
            });
        }
    } else {
        let updated = sqlx::query(
            r#"
            UPDATE event_streams
            SET version = ?1, updated_at = ?2
            WHERE stream_id = ?3 AND version = ?4
            "#,
        )
        .bind(new_version)
        .bind(now)
        .bind(&sid)
        .bind(append.expected_version)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(conflict(append, append.expected_version + 1));
        }
    }

    for (offset, event) in append.events.iter().enumerate() {
        let version = append.expected_version + offset as i64 + 1;
        let metadata = event_metadata(&append.aggregate_type, &event.event_type);

        let inserted = sqlx::query(
            r#"
            INSERT INTO events (event_id, stream_id, aggregate_type, aggregate_id, event_type,
                                event_version, payload, metadata, occurred_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&event.event_id)
        .bind(&sid)
        .bind(&append.aggregate_type)
        .bind(&append.aggregate_id)
        .bind(&event.event_type)
        .bind(version)
        .bind(&event.payload)
        .bind(&metadata)
        .bind(event.occurred_at)
        .execute(&mut *conn)
        .await;

        if let Err(e) = inserted {
            return Err(if is_unique_violation(&e) {
                conflict(append, version)
            } else {
                e.into()
            });
        }

        sqlx::query(
            r#"
            INSERT INTO outbox (event_id, aggregate_type, aggregate_id, event_type, payload,
                                metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&event.event_id)
        .bind(&append.aggregate_type)
        .bind(&append.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&metadata)
        .bind(event.occurred_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn upsert_checkpoint(
    conn: &mut SqliteConnection,
    cp: &CheckpointRecord,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO checkpoints (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id,
                                 run_id, channel_values, channel_versions, versions_seen,
                                 pending_sends, metadata, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id) DO UPDATE SET
            channel_values = excluded.channel_values,
            channel_versions = excluded.channel_versions,
            versions_seen = excluded.versions_seen,
            pending_sends = excluded.pending_sends,
            metadata = excluded.metadata
        "#,
    )
    .bind(&cp.thread_id)
    .bind(&cp.checkpoint_ns)
    .bind(&cp.checkpoint_id)
    .bind(&cp.parent_checkpoint_id)
    .bind(&cp.run_id)
    .bind(&cp.channel_values)
    .bind(&cp.channel_versions)
    .bind(&cp.versions_seen)
    .bind(&cp.pending_sends)
    .bind(&cp.metadata)
    .bind(cp.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn apply_projection(
    conn: &mut SqliteConnection,
    write: &ProjectionWrite,
) -> Result<(), CoreError> {
    match write {
        ProjectionWrite::UpsertRun(run) => {
            sqlx::query(
                r#"
                INSERT INTO runs (run_id, thread_id, assistant_id, status, input, output, error,
                                  config, metadata, multitask_strategy, created_at, started_at,
                                  completed_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT (run_id) DO UPDATE SET
                    status = excluded.status,
                    output = excluded.output,
                    error = excluded.error,
                    metadata = excluded.metadata,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&run.run_id)
            .bind(&run.thread_id)
            .bind(&run.assistant_id)
            .bind(&run.status)
            .bind(&run.input)
            .bind(&run.output)
            .bind(&run.error)
            .bind(&run.config)
            .bind(&run.metadata)
            .bind(&run.multitask_strategy)
            .bind(run.created_at)
            .bind(run.started_at)
            .bind(run.completed_at)
            .bind(run.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        ProjectionWrite::DeleteRun { run_id } => {
            sqlx::query("DELETE FROM interrupts WHERE run_id = ?1")
                .bind(run_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query("DELETE FROM runs WHERE run_id = ?1")
                .bind(run_id)
                .execute(&mut *conn)
                .await?;
        }
        ProjectionWrite::UpsertThread(thread) => {
            sqlx::query(
                r#"
                INSERT INTO threads (thread_id, status, metadata, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (thread_id) DO UPDATE SET
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&thread.thread_id)
            .bind(&thread.status)
            .bind(&thread.metadata)
            .bind(thread.created_at)
            .bind(thread.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        ProjectionWrite::SetThreadStatus {
            thread_id,
            status,
            updated_at,
        } => {
            sqlx::query("UPDATE threads SET status = ?1, updated_at = ?2 WHERE thread_id = ?3")
                .bind(status)
                .bind(updated_at)
                .bind(thread_id)
                .execute(&mut *conn)
                .await?;
        }
        ProjectionWrite::DeleteThread { thread_id } => {
            for sql in [
                "DELETE FROM checkpoint_writes WHERE thread_id = ?1",
                "DELETE FROM checkpoints WHERE thread_id = ?1",
                "DELETE FROM interrupts WHERE thread_id = ?1",
                "DELETE FROM runs WHERE thread_id = ?1",
                "DELETE FROM threads WHERE thread_id = ?1",
            ] {
                sqlx::query(sql)
                    .bind(thread_id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        ProjectionWrite::UpsertAssistant(assistant) => {
            sqlx::query(
                r#"
                INSERT INTO assistants (assistant_id, graph_id, name, description, config,
                                        metadata, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (assistant_id) DO UPDATE SET
                    graph_id = excluded.graph_id,
                    name = excluded.name,
                    description = excluded.description,
                    config = excluded.config,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&assistant.assistant_id)
            .bind(&assistant.graph_id)
            .bind(&assistant.name)
            .bind(&assistant.description)
            .bind(&assistant.config)
            .bind(&assistant.metadata)
            .bind(assistant.created_at)
            .bind(assistant.updated_at)
            .execute(&mut *conn)
            .await?;
        }
        ProjectionWrite::DeleteAssistant { assistant_id } => {
            sqlx::query("DELETE FROM assistants WHERE assistant_id = ?1")
                .bind(assistant_id)
                .execute(&mut *conn)
                .await?;
        }
        ProjectionWrite::UpsertInterrupt(interrupt) => {
            sqlx::query(
                r#"
                INSERT INTO interrupts (interrupt_id, run_id, thread_id, node_id, reason, state,
                                        tool_calls, resolved, resolved_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT (interrupt_id) DO UPDATE SET
                    resolved = excluded.resolved,
                    resolved_at = excluded.resolved_at
                "#,
            )
            .bind(&interrupt.interrupt_id)
            .bind(&interrupt.run_id)
            .bind(&interrupt.thread_id)
            .bind(&interrupt.node_id)
            .bind(&interrupt.reason)
            .bind(&interrupt.state)
            .bind(&interrupt.tool_calls)
            .bind(interrupt.resolved)
            .bind(interrupt.resolved_at)
            .bind(interrupt.created_at)
            .execute(&mut *conn)
            .await?;
        }
        ProjectionWrite::SaveCheckpoint(cp) => upsert_checkpoint(conn, cp).await?,
        ProjectionWrite::DeleteRunCheckpoints { thread_id, run_id } => {
            let removed: HashMap<(String, String), Option<String>> =
                sqlx::query_as::<_, CheckpointLink>(
                    "SELECT checkpoint_ns, checkpoint_id, parent_checkpoint_id FROM checkpoints \
                     WHERE thread_id = ?1 AND run_id = ?2",
                )
                .bind(thread_id)
                .bind(run_id)
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .map(|(ns, id, parent)| ((ns, id), parent))
                .collect();
            if !removed.is_empty() {
                let survivors = sqlx::query_as::<_, CheckpointLink>(
                    "SELECT checkpoint_ns, checkpoint_id, parent_checkpoint_id FROM checkpoints \
                     WHERE thread_id = ?1 AND (run_id IS NULL OR run_id <> ?2) \
                     AND parent_checkpoint_id IS NOT NULL",
                )
                .bind(thread_id)
                .bind(run_id)
                .fetch_all(&mut *conn)
                .await?;
                for (ns, id, parent) in relink_parents(&removed, survivors) {
                    sqlx::query(
                        "UPDATE checkpoints SET parent_checkpoint_id = ?1 \
                         WHERE thread_id = ?2 AND checkpoint_ns = ?3 AND checkpoint_id = ?4",
                    )
                    .bind(parent)
                    .bind(thread_id)
                    .bind(ns)
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                }
            }
            sqlx::query(
                r#"
                DELETE FROM checkpoint_writes
                WHERE thread_id = ?1 AND checkpoint_id IN (
                    SELECT checkpoint_id FROM checkpoints WHERE thread_id = ?1 AND run_id = ?2
                )
                "#,
            )
            .bind(thread_id)
            .bind(run_id)
            .execute(&mut *conn)
            .await?;
            sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1 AND run_id = ?2")
                .bind(thread_id)
                .bind(run_id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

const RUN_COLUMNS: &str = "run_id, thread_id, assistant_id, status, input, output, error, config, \
     metadata, multitask_strategy, created_at, started_at, completed_at, updated_at";

const CHECKPOINT_COLUMNS: &str = "seq, thread_id, checkpoint_ns, checkpoint_id, \
     parent_checkpoint_id, run_id, channel_values, channel_versions, versions_seen, \
     pending_sends, metadata, created_at";

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn commit(&self, uow: &UnitOfWork) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        for append in &uow.appends {
            append_stream(&mut tx, append).await?;
        }
        for write in &uow.projections {
            apply_projection(&mut tx, write).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<EventRecord>, CoreError> {
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, event_id, stream_id, aggregate_type, aggregate_id, event_type,
                   event_version, payload, metadata, occurred_at
            FROM events
            WHERE stream_id = ?1
            ORDER BY event_version ASC
            "#,
        )
        .bind(stream_id(aggregate_type, aggregate_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn stream_version(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<i64, CoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM event_streams WHERE stream_id = ?1")
                .bind(stream_id(aggregate_type, aggregate_id))
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }

    async fn fetch_unpublished(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, CoreError> {
        let records = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT id, event_id, aggregate_type, aggregate_id, event_type, payload, metadata,
                   created_at, published, published_at, attempts, last_error, next_retry_at
            FROM outbox
            WHERE published = 0 AND (next_retry_at IS NULL OR next_retry_at <= ?1)
            ORDER BY id ASC
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn get_outbox_by_event(&self, event_id: &str) -> Result<Option<OutboxRecord>, CoreError> {
        let record = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT id, event_id, aggregate_type, aggregate_id, event_type, payload, metadata,
                   created_at, published, published_at, attempts, last_error, next_retry_at
            FROM outbox
            WHERE event_id = ?1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_published(&self, id: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query("UPDATE outbox SET published = 1, published_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let attempts: Option<i32> = sqlx::query_scalar("SELECT attempts FROM outbox WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let attempts = attempts.ok_or_else(|| CoreError::not_found("outbox", id.to_string()))?;

        sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = ?1, last_error = ?2, next_retry_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(attempts + 1)
        .bind(error)
        .bind(now + backoff_delay(attempts))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_published(&self, older_than: DateTime<Utc>) -> Result<u64, CoreError> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE published = 1 AND published_at < ?1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn save_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_checkpoint(&mut conn, checkpoint).await
    }

    async fn get_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints \
             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3"
        );
        let record = sqlx::query_as::<_, CheckpointRecord>(&sql)
            .bind(thread_id)
            .bind(checkpoint_ns)
            .bind(checkpoint_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn latest_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints \
             WHERE thread_id = ?1 AND checkpoint_ns = ?2 ORDER BY seq DESC LIMIT 1"
        );
        let record = sqlx::query_as::<_, CheckpointRecord>(&sql)
            .bind(thread_id)
            .bind(checkpoint_ns)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn checkpoint_chain(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        start_checkpoint_id: &str,
        limit: i64,
    ) -> Result<Vec<CheckpointRecord>, CoreError> {
        let records = sqlx::query_as::<_, CheckpointRecord>(
            r#"
            WITH RECURSIVE chain (seq, checkpoint_id, parent_checkpoint_id, depth) AS (
                SELECT seq, checkpoint_id, parent_checkpoint_id, 0
                FROM checkpoints
                WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
                UNION ALL
                SELECT c.seq, c.checkpoint_id, c.parent_checkpoint_id, chain.depth + 1
                FROM checkpoints c
                JOIN chain ON c.checkpoint_id = chain.parent_checkpoint_id
                WHERE c.thread_id = ?1 AND c.checkpoint_ns = ?2 AND chain.depth + 1 < ?4
            )
            SELECT c.seq, c.thread_id, c.checkpoint_ns, c.checkpoint_id, c.parent_checkpoint_id,
                   c.run_id, c.channel_values, c.channel_versions, c.versions_seen,
                   c.pending_sends, c.metadata, c.created_at
            FROM chain
            JOIN checkpoints c ON c.seq = chain.seq
            ORDER BY chain.depth ASC
            "#,
        )
        .bind(thread_id)
        .bind(checkpoint_ns)
        .bind(start_checkpoint_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn put_writes(&self, writes: &[CheckpointWriteRecord]) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for w in writes {
            sqlx::query(
                r#"
                INSERT INTO checkpoint_writes (thread_id, checkpoint_ns, checkpoint_id, task_id,
                                               idx, channel, type, blob, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id, task_id, idx) DO UPDATE SET
                    channel = excluded.channel,
                    type = excluded.type,
                    blob = excluded.blob
                "#,
            )
            .bind(&w.thread_id)
            .bind(&w.checkpoint_ns)
            .bind(&w.checkpoint_id)
            .bind(&w.task_id)
            .bind(w.idx)
            .bind(&w.channel)
            .bind(&w.write_type)
            .bind(&w.blob)
            .bind(w.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_writes(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<CheckpointWriteRecord>, CoreError> {
        let records = sqlx::query_as::<_, CheckpointWriteRecord>(
            r#"
            SELECT thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, type, blob,
                   created_at
            FROM checkpoint_writes
            WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
            ORDER BY task_id ASC, idx ASC
            "#,
        )
        .bind(thread_id)
        .bind(checkpoint_ns)
        .bind(checkpoint_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1"));

        if let Some(thread_id) = &filter.thread_id {
            qb.push(" AND thread_id = ").push_bind(thread_id);
        }
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status);
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY created_at ASC, run_id ASC LIMIT ")
            .push_bind(filter.effective_limit())
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let records = qb.build_query_as::<RunRecord>().fetch_all(&self.pool).await?;
        Ok(records)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>, CoreError> {
        let record = sqlx::query_as::<_, ThreadRecord>(
            "SELECT thread_id, status, metadata, created_at, updated_at FROM threads WHERE thread_id = ?1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_threads(&self, limit: i64, offset: i64) -> Result<Vec<ThreadRecord>, CoreError> {
        let records = sqlx::query_as::<_, ThreadRecord>(
            r#"
            SELECT thread_id, status, metadata, created_at, updated_at
            FROM threads
            ORDER BY created_at DESC, thread_id ASC
            LIMIT ?1 OFFSET ?2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_assistant(
        &self,
        assistant_id: &str,
    ) -> Result<Option<AssistantRecord>, CoreError> {
        let record = sqlx::query_as::<_, AssistantRecord>(
            r#"
            SELECT assistant_id, graph_id, name, description, config, metadata, created_at,
                   updated_at
            FROM assistants
            WHERE assistant_id = ?1
            "#,
        )
        .bind(assistant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_assistants(
        &self,
        graph_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AssistantRecord>, CoreError> {
        let records = sqlx::query_as::<_, AssistantRecord>(
            r#"
            SELECT assistant_id, graph_id, name, description, config, metadata, created_at,
                   updated_at
            FROM assistants
            WHERE (?1 IS NULL OR graph_id = ?1)
            ORDER BY created_at DESC, assistant_id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(graph_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_unresolved_interrupt(
        &self,
        run_id: &str,
    ) -> Result<Option<InterruptRecord>, CoreError> {
        let record = sqlx::query_as::<_, InterruptRecord>(
            r#"
            SELECT interrupt_id, run_id, thread_id, node_id, reason, state, tool_calls, resolved,
                   resolved_at, created_at
            FROM interrupts
            WHERE run_id = ?1 AND resolved = 0
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_interrupts(&self, run_id: &str) -> Result<Vec<InterruptRecord>, CoreError> {
        let records = sqlx::query_as::<_, InterruptRecord>(
            r#"
            SELECT interrupt_id, run_id, thread_id, node_id, reason, state, tool_calls, resolved,
                   resolved_at, created_at
            FROM interrupts
            WHERE run_id = ?1
            ORDER BY created_at ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
