// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint store.
//!
//! Checkpoints are immutable snapshots of a thread's channel state. Each one names its
//! parent, so the checkpoints of a thread form a DAG: history is a walk up the parent chain,
//! and forking a thread copies one checkpoint into a new thread as its root.
//!
//! Channel state is stored as a JSON object. A few reserved channels carry execution
//! bookkeeping written by workers and are surfaced separately in [`ThreadState`]:
//!
//! - `__next__`: array of node names scheduled to run next
//! - `__tasks__`: array of pending task objects
//! - `__metadata__`: object merged into the state metadata

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument};

use crate::error::{CoreError, Result};
use crate::event_store::{AGGREGATE_THREAD, EventStore, UnitOfWork};
use crate::persistence::{
    CheckpointRecord, CheckpointWriteRecord, Persistence, ProjectionWrite, ThreadRecord,
};
use crate::thread::Thread;

/// Reserved channel holding the nodes scheduled next.
pub const NEXT_CHANNEL: &str = "__next__";
/// Reserved channel holding pending tasks.
pub const TASKS_CHANNEL: &str = "__tasks__";
/// Reserved channel holding extra state metadata.
pub const METADATA_CHANNEL: &str = "__metadata__";

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: i64 = 10;

fn is_reserved(channel: &str) -> bool {
    matches!(channel, NEXT_CHANNEL | TASKS_CHANNEL | METADATA_CHANNEL)
}

/// Snapshot of a thread's execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    /// Namespace; empty for the root graph, set for sub-graphs.
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    /// Run that produced the checkpoint.
    pub run_id: Option<String>,
    pub channel_values: Map<String, Value>,
    pub channel_versions: Value,
    /// Per-node channel versions already consumed.
    pub versions_seen: Value,
    pub pending_sends: Value,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Empty checkpoint with a fresh time-ordered id and no parent.
    pub fn new(thread_id: impl Into<String>, checkpoint_ns: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: checkpoint_ns.into(),
            checkpoint_id: uuid::Uuid::now_v7().to_string(),
            parent_checkpoint_id: None,
            run_id: None,
            channel_values: Map::new(),
            channel_versions: json!({}),
            versions_seen: json!({}),
            pending_sends: json!([]),
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    /// New checkpoint following `parent`, carrying over its channel state. The child
    /// belongs to no run until the caller sets `run_id`.
    pub fn child_of(parent: &Checkpoint) -> Self {
        let mut child = Self::new(&parent.thread_id, &parent.checkpoint_ns);
        child.parent_checkpoint_id = Some(parent.checkpoint_id.clone());
        child.channel_values = parent.channel_values.clone();
        child.channel_versions = parent.channel_versions.clone();
        child.versions_seen = parent.versions_seen.clone();
        child
    }

    /// Step counter recorded in metadata, -1 when absent.
    pub fn step(&self) -> i64 {
        self.metadata
            .get("step")
            .and_then(Value::as_i64)
            .unwrap_or(-1)
    }

    /// Overwrite channels with the keys of `values`.
    pub fn merge_values(&mut self, values: &Map<String, Value>) {
        for (k, v) in values {
            self.channel_values.insert(k.clone(), v.clone());
        }
    }

    pub(crate) fn to_record(&self) -> CheckpointRecord {
        CheckpointRecord {
            seq: 0,
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: self.checkpoint_id.clone(),
            parent_checkpoint_id: self.parent_checkpoint_id.clone(),
            run_id: self.run_id.clone(),
            channel_values: Value::Object(self.channel_values.clone()),
            channel_versions: self.channel_versions.clone(),
            versions_seen: self.versions_seen.clone(),
            pending_sends: self.pending_sends.clone(),
            metadata: Value::Object(self.metadata.clone()),
            created_at: self.created_at,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.thread_id.is_empty() {
            return Err(CoreError::invalid_input("thread_id", "must not be empty"));
        }
        if self.checkpoint_id.is_empty() {
            return Err(CoreError::invalid_input("checkpoint_id", "must not be empty"));
        }
        if self.parent_checkpoint_id.as_deref() == Some(self.checkpoint_id.as_str()) {
            return Err(CoreError::invalid_input(
                "parent_checkpoint_id",
                "a checkpoint cannot be its own parent",
            ));
        }
        Ok(())
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl From<CheckpointRecord> for Checkpoint {
    fn from(r: CheckpointRecord) -> Self {
        Self {
            thread_id: r.thread_id,
            checkpoint_ns: r.checkpoint_ns,
            checkpoint_id: r.checkpoint_id,
            parent_checkpoint_id: r.parent_checkpoint_id,
            run_id: r.run_id,
            channel_values: into_object(r.channel_values),
            channel_versions: r.channel_versions,
            versions_seen: r.versions_seen,
            pending_sends: r.pending_sends,
            metadata: into_object(r.metadata),
            created_at: r.created_at,
        }
    }
}

/// One staged channel mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub channel: String,
    /// Value type tag, e.g. `json` or `error`.
    #[serde(rename = "type", default = "default_write_type")]
    pub write_type: String,
    pub value: Value,
}

fn default_write_type() -> String {
    "json".to_string()
}

/// Stored checkpoint write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointWrite {
    pub task_id: String,
    pub idx: i32,
    pub channel: String,
    #[serde(rename = "type")]
    pub write_type: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
}

impl From<CheckpointWriteRecord> for CheckpointWrite {
    fn from(r: CheckpointWriteRecord) -> Self {
        Self {
            task_id: r.task_id,
            idx: r.idx,
            channel: r.channel,
            write_type: r.write_type,
            value: r.blob,
            created_at: r.created_at,
        }
    }
}

/// Thread state as seen by callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThreadState {
    /// Channel values without the reserved bookkeeping channels.
    pub values: Map<String, Value>,
    pub next: Vec<String>,
    pub tasks: Vec<Value>,
    pub checkpoint_id: Option<String>,
    pub checkpoint_ns: String,
    pub parent_checkpoint_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl ThreadState {
    /// State of a thread that has no checkpoint yet.
    pub fn empty(checkpoint_ns: &str) -> Self {
        Self {
            checkpoint_ns: checkpoint_ns.to_string(),
            ..Self::default()
        }
    }
}

impl From<&Checkpoint> for ThreadState {
    fn from(cp: &Checkpoint) -> Self {
        let mut values = Map::new();
        for (k, v) in &cp.channel_values {
            if !is_reserved(k) {
                values.insert(k.clone(), v.clone());
            }
        }

        let next = cp
            .channel_values
            .get(NEXT_CHANNEL)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let tasks = cp
            .channel_values
            .get(TASKS_CHANNEL)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter(|t| t.is_object()).cloned().collect())
            .unwrap_or_default();

        let mut metadata = cp
            .channel_values
            .get(METADATA_CHANNEL)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (k, v) in &cp.metadata {
            metadata.insert(k.clone(), v.clone());
        }

        Self {
            values,
            next,
            tasks,
            checkpoint_id: Some(cp.checkpoint_id.clone()),
            checkpoint_ns: cp.checkpoint_ns.clone(),
            parent_checkpoint_id: cp.parent_checkpoint_id.clone(),
            metadata,
            created_at: Some(cp.created_at),
        }
    }
}

/// Read and write access to checkpoints.
#[derive(Clone)]
pub struct CheckpointStore {
    events: EventStore,
    persistence: Arc<dyn Persistence>,
}

impl CheckpointStore {
    pub fn new(events: EventStore, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            events,
            persistence,
        }
    }

    /// Store a checkpoint. Saving the same identity again overwrites its channel data but
    /// keeps the parent it was first saved with.
    #[instrument(skip(self, checkpoint), fields(thread_id = %checkpoint.thread_id, checkpoint_id = %checkpoint.checkpoint_id))]
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.validate()?;
        self.persistence
            .save_checkpoint(&checkpoint.to_record())
            .await?;
        debug!("Checkpoint saved");
        Ok(())
    }

    /// Most recently created checkpoint of a namespace.
    pub async fn find_latest(&self, thread_id: &str, checkpoint_ns: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .persistence
            .latest_checkpoint(thread_id, checkpoint_ns)
            .await?
            .map(Checkpoint::from))
    }

    pub async fn get(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint> {
        self.persistence
            .get_checkpoint(thread_id, checkpoint_ns, checkpoint_id)
            .await?
            .map(Checkpoint::from)
            .ok_or_else(|| CoreError::not_found("checkpoint", checkpoint_id))
    }

    /// Checkpoints newest first along the parent chain.
    ///
    /// Without `before` the walk starts at the latest checkpoint. With `before` it starts at
    /// that checkpoint's parent, so passing the last id of one page yields the next page.
    pub async fn find_history(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        limit: i64,
        before: Option<&str>,
    ) -> Result<Vec<Checkpoint>> {
        let limit = if limit <= 0 {
            DEFAULT_HISTORY_LIMIT
        } else {
            limit
        };

        let start = match before {
            Some(cursor) => self
                .get(thread_id, checkpoint_ns, cursor)
                .await?
                .parent_checkpoint_id,
            None => self
                .find_latest(thread_id, checkpoint_ns)
                .await?
                .map(|cp| cp.checkpoint_id),
        };
        let Some(start) = start else {
            return Ok(Vec::new());
        };

        let chain = self
            .persistence
            .checkpoint_chain(thread_id, checkpoint_ns, &start, limit)
            .await?;
        Ok(chain.into_iter().map(Checkpoint::from).collect())
    }

    /// Current state of a thread. A thread without checkpoints has an empty state.
    pub async fn get_state(&self, thread_id: &str, checkpoint_ns: &str) -> Result<ThreadState> {
        Ok(match self.find_latest(thread_id, checkpoint_ns).await? {
            Some(cp) => ThreadState::from(&cp),
            None => ThreadState::empty(checkpoint_ns),
        })
    }

    /// State as of a specific checkpoint.
    pub async fn get_state_at(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<ThreadState> {
        let cp = self.get(thread_id, checkpoint_ns, checkpoint_id).await?;
        Ok(ThreadState::from(&cp))
    }

    /// Write a new checkpoint whose values are the latest values overlaid with `values`,
    /// attributed to `as_node`.
    #[instrument(skip(self, values))]
    pub async fn update_state(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<Checkpoint> {
        let values = match values {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(CoreError::invalid_input("values", "must be a JSON object")),
        };

        let latest = self.find_latest(thread_id, checkpoint_ns).await?;
        let mut cp = match &latest {
            Some(parent) => Checkpoint::child_of(parent),
            None => Checkpoint::new(thread_id, checkpoint_ns),
        };
        cp.merge_values(&values);

        let step = latest.as_ref().map(Checkpoint::step).unwrap_or(-1) + 1;
        let writer = as_node.unwrap_or("__input__");
        cp.metadata.insert("source".into(), json!("update"));
        cp.metadata.insert("step".into(), json!(step));
        cp.metadata
            .insert("writes".into(), json!({ writer: Value::Object(values) }));
        if let Some(node) = as_node {
            cp.metadata.insert("as_node".into(), json!(node));
        }

        self.save(&cp).await?;
        Ok(cp)
    }

    /// Snapshot the latest state as a new checkpoint, or start an empty one.
    #[instrument(skip(self))]
    pub async fn create_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        run_id: Option<&str>,
    ) -> Result<Checkpoint> {
        let latest = self.find_latest(thread_id, checkpoint_ns).await?;
        let mut cp = match &latest {
            Some(parent) => Checkpoint::child_of(parent),
            None => Checkpoint::new(thread_id, checkpoint_ns),
        };
        cp.run_id = run_id.map(str::to_string);
        let step = latest.as_ref().map(Checkpoint::step).unwrap_or(-1) + 1;
        cp.metadata.insert("source".into(), json!("checkpoint"));
        cp.metadata.insert("step".into(), json!(step));

        self.save(&cp).await?;
        Ok(cp)
    }

    /// Stage writes of one task against a checkpoint. `idx` follows the order given.
    pub async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
        task_id: &str,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        if task_id.is_empty() {
            return Err(CoreError::invalid_input("task_id", "must not be empty"));
        }
        self.get(thread_id, checkpoint_ns, checkpoint_id).await?;

        let now = Utc::now();
        let records: Vec<CheckpointWriteRecord> = writes
            .into_iter()
            .enumerate()
            .map(|(idx, w)| CheckpointWriteRecord {
                thread_id: thread_id.to_string(),
                checkpoint_ns: checkpoint_ns.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
                task_id: task_id.to_string(),
                idx: idx as i32,
                channel: w.channel,
                write_type: w.write_type,
                blob: w.value,
                created_at: now,
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        self.persistence.put_writes(&records).await
    }

    /// Writes against a checkpoint ordered by task then index.
    pub async fn list_writes(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<CheckpointWrite>> {
        Ok(self
            .persistence
            .list_writes(thread_id, checkpoint_ns, checkpoint_id)
            .await?
            .into_iter()
            .map(CheckpointWrite::from)
            .collect())
    }

    /// Fork a thread. The new thread copies the source metadata and gets one root
    /// checkpoint holding a copy of the chosen checkpoint (latest when `checkpoint_id` is
    /// `None`).
    #[instrument(skip(self))]
    pub async fn copy_thread(
        &self,
        source_thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<(ThreadRecord, Option<Checkpoint>)> {
        let records = self.events.load(AGGREGATE_THREAD, source_thread_id).await?;
        if records.is_empty() {
            return Err(CoreError::not_found("thread", source_thread_id));
        }
        let source = Thread::from_events(&records)?;
        if source.is_deleted() {
            return Err(CoreError::not_found("thread", source_thread_id));
        }

        let source_cp = match checkpoint_id {
            Some(id) => Some(self.get(source_thread_id, checkpoint_ns, id).await?),
            None => self.find_latest(source_thread_id, checkpoint_ns).await?,
        };

        let mut thread = Thread::create(None, Value::Object(source.metadata().clone()))?;
        let copy = source_cp.map(|src| {
            let mut cp = Checkpoint::new(thread.id(), checkpoint_ns);
            cp.channel_values = src.channel_values.clone();
            cp.channel_versions = src.channel_versions.clone();
            cp.versions_seen = src.versions_seen.clone();
            cp.pending_sends = src.pending_sends.clone();
            cp.metadata = src.metadata.clone();
            cp.metadata.insert("source".into(), json!("fork"));
            cp.metadata.insert(
                "forked_from".into(),
                json!({ "thread_id": src.thread_id, "checkpoint_id": src.checkpoint_id }),
            );
            cp
        });

        let mut uow = UnitOfWork::new();
        thread.stage(&mut uow)?;
        if let Some(cp) = &copy {
            uow.project(ProjectionWrite::SaveCheckpoint(cp.to_record()));
        }
        self.events.commit(uow).await?;

        info!(
            source_thread_id = %source_thread_id,
            thread_id = %thread.id(),
            "Thread copied"
        );
        Ok((thread.to_record(), copy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use crate::thread::ThreadService;

    async fn setup() -> (CheckpointStore, ThreadService) {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.expect("in-memory db"));
        let events = EventStore::new(persistence.clone());
        (
            CheckpointStore::new(events.clone(), persistence.clone()),
            ThreadService::new(events, persistence),
        )
    }

    fn values(v: Value) -> Map<String, Value> {
        into_object(v)
    }

    #[test]
    fn test_state_splits_reserved_channels() {
        let mut cp = Checkpoint::new("t", "");
        cp.channel_values = values(json!({
            "messages": ["hi"],
            "__next__": ["agent", 7, "tools"],
            "__tasks__": [{"id": "task-1", "name": "agent"}, "junk"],
            "__metadata__": {"step": 1, "source": "loop"}
        }));
        cp.metadata = values(json!({"step": 3}));

        let state = ThreadState::from(&cp);
        assert_eq!(Value::Object(state.values), json!({"messages": ["hi"]}));
        assert_eq!(state.next, vec!["agent", "tools"]);
        assert_eq!(state.tasks, vec![json!({"id": "task-1", "name": "agent"})]);
        assert_eq!(state.metadata["step"], 3);
        assert_eq!(state.metadata["source"], "loop");
    }

    #[tokio::test]
    async fn test_empty_thread_has_empty_state() {
        let (store, _) = setup().await;
        let state = store.get_state("nobody", "").await.unwrap();
        assert!(state.values.is_empty());
        assert!(state.checkpoint_id.is_none());

        let err = store.get_state_at("nobody", "", "cp").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_update_state_merges_over_latest() {
        let (store, _) = setup().await;
        let c1 = store
            .update_state("t", "", json!({"a": 1, "b": 1}), None)
            .await
            .unwrap();
        let c2 = store
            .update_state("t", "", json!({"b": 2}), Some("reviewer"))
            .await
            .unwrap();

        assert_eq!(c2.parent_checkpoint_id.as_deref(), Some(c1.checkpoint_id.as_str()));
        let state = store.get_state("t", "").await.unwrap();
        assert_eq!(Value::Object(state.values), json!({"a": 1, "b": 2}));
        assert_eq!(state.metadata["source"], "update");
        assert_eq!(state.metadata["as_node"], "reviewer");
        assert_eq!(state.metadata["step"], 1);
        assert_eq!(state.metadata["writes"], json!({"reviewer": {"b": 2}}));
    }

    #[tokio::test]
    async fn test_user_checkpoints_belong_to_no_run() {
        let (store, _) = setup().await;
        let from_run = store.create_checkpoint("t", "", Some("run-1")).await.unwrap();
        assert_eq!(from_run.run_id.as_deref(), Some("run-1"));

        let edit = store
            .update_state("t", "", json!({"note": "manual"}), None)
            .await
            .unwrap();
        assert!(edit.run_id.is_none());
        let snapshot = store.create_checkpoint("t", "", None).await.unwrap();
        assert!(snapshot.run_id.is_none());
        assert!(store.get("t", "", &edit.checkpoint_id).await.unwrap().run_id.is_none());
    }

    #[tokio::test]
    async fn test_history_pages_along_parent_chain() {
        let (store, _) = setup().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let cp = store
                .update_state("t", "", json!({ "i": i }), None)
                .await
                .unwrap();
            ids.push(cp.checkpoint_id);
        }
        // A sibling namespace must not leak into the chain.
        store.update_state("t", "sub", json!({}), None).await.unwrap();

        let page = store.find_history("t", "", 2, None).await.unwrap();
        let got: Vec<&str> = page.iter().map(|c| c.checkpoint_id.as_str()).collect();
        assert_eq!(got, vec![ids[4].as_str(), ids[3].as_str()]);

        let page = store
            .find_history("t", "", 10, Some(&ids[3]))
            .await
            .unwrap();
        let got: Vec<&str> = page.iter().map(|c| c.checkpoint_id.as_str()).collect();
        assert_eq!(got, vec![ids[2].as_str(), ids[1].as_str(), ids[0].as_str()]);
        assert!(page.last().unwrap().parent_checkpoint_id.is_none());

        assert!(
            store
                .find_history("t", "", 10, Some(&ids[0]))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_resave_keeps_parent() {
        let (store, _) = setup().await;
        let root = store.create_checkpoint("t", "", None).await.unwrap();
        let mut child = Checkpoint::child_of(&root);
        child.channel_values = values(json!({"x": 1}));
        store.save(&child).await.unwrap();

        let mut retry = child.clone();
        retry.parent_checkpoint_id = None;
        retry.channel_values = values(json!({"x": 2}));
        store.save(&retry).await.unwrap();

        let stored = store.get("t", "", &child.checkpoint_id).await.unwrap();
        assert_eq!(stored.channel_values["x"], 2);
        assert_eq!(
            stored.parent_checkpoint_id.as_deref(),
            Some(root.checkpoint_id.as_str())
        );
        assert_eq!(store.find_history("t", "", 10, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_self_parent_is_rejected() {
        let (store, _) = setup().await;
        let mut cp = Checkpoint::new("t", "");
        cp.parent_checkpoint_id = Some(cp.checkpoint_id.clone());
        assert_eq!(store.save(&cp).await.unwrap_err().error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_writes_are_indexed_in_order() {
        let (store, _) = setup().await;
        let cp = store.create_checkpoint("t", "", Some("run-1")).await.unwrap();
        assert_eq!(cp.run_id.as_deref(), Some("run-1"));

        let writes = vec![
            PendingWrite {
                channel: "messages".into(),
                write_type: "json".into(),
                value: json!("a"),
            },
            PendingWrite {
                channel: "count".into(),
                write_type: "json".into(),
                value: json!(1),
            },
        ];
        store
            .put_writes("t", "", &cp.checkpoint_id, "task-b", writes.clone())
            .await
            .unwrap();
        store
            .put_writes("t", "", &cp.checkpoint_id, "task-a", writes[..1].to_vec())
            .await
            .unwrap();

        let listed = store.list_writes("t", "", &cp.checkpoint_id).await.unwrap();
        let keys: Vec<(&str, i32, &str)> = listed
            .iter()
            .map(|w| (w.task_id.as_str(), w.idx, w.channel.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("task-a", 0, "messages"),
                ("task-b", 0, "messages"),
                ("task-b", 1, "count"),
            ]
        );

        let err = store
            .put_writes("t", "", "missing", "task-a", writes)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_copy_thread_forks_from_checkpoint() {
        let (store, threads) = setup().await;
        let t = threads
            .create(None, json!({"owner": "ops"}))
            .await
            .unwrap()
            .thread_id;

        let c1 = store
            .update_state(&t, "", json!({"doc": {"title": "draft"}}), None)
            .await
            .unwrap();
        let c2 = store
            .update_state(&t, "", json!({"doc": {"title": "final"}}), None)
            .await
            .unwrap();
        assert_eq!(c2.parent_checkpoint_id.as_deref(), Some(c1.checkpoint_id.as_str()));

        let (t2, copy) = store
            .copy_thread(&t, "", Some(&c1.checkpoint_id))
            .await
            .unwrap();
        let copy = copy.expect("copied checkpoint");
        assert_ne!(t2.thread_id, t);
        assert_eq!(t2.metadata, json!({"owner": "ops"}));
        assert!(copy.parent_checkpoint_id.is_none());

        let latest = store.find_latest(&t2.thread_id, "").await.unwrap().unwrap();
        assert_eq!(latest.channel_values, c1.channel_values);
        assert_eq!(latest.thread_id, t2.thread_id);

        store
            .update_state(&t2.thread_id, "", json!({"doc": {"title": "forked"}}), None)
            .await
            .unwrap();
        let c1_after = store.get(&t, "", &c1.checkpoint_id).await.unwrap();
        let c2_after = store.get(&t, "", &c2.checkpoint_id).await.unwrap();
        assert_eq!(c1_after.channel_values, c1.channel_values);
        assert_eq!(c2_after.channel_values, c2.channel_values);

        assert!(threads.get(&t2.thread_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_copy_thread_without_checkpoint_or_source() {
        let (store, threads) = setup().await;
        let t = threads.create(None, Value::Null).await.unwrap().thread_id;
        let (_, copy) = store.copy_thread(&t, "", None).await.unwrap();
        assert!(copy.is_none());

        let err = store.copy_thread("missing", "", None).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}
