// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run orchestration: multitask arbitration, task dispatch, worker events and resume.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{
    Interrupt, InterruptReason, MultitaskStrategy, NewRun, Run, RunEvent, RunStatus,
};
use crate::assistant::AssistantService;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{CoreError, Result};
use crate::event_store::{AGGREGATE_INTERRUPT, AGGREGATE_RUN, EventStore, UnitOfWork};
use crate::persistence::{
    InterruptRecord, ListRunsFilter, Persistence, ProjectionWrite, RunRecord,
};
use crate::thread::{ThreadService, ThreadStatus};
use crate::worker::{TaskKind, TaskQueue, WorkerEvent, WorkerEventKind, WorkerRegistry, WorkerTask};

/// Run service tuning.
#[derive(Debug, Clone)]
pub struct RunServiceConfig {
    /// Wait used by join and stream when the caller gives none.
    pub join_timeout: Duration,
    /// Projection polling interval of join and stream.
    pub join_poll_interval: Duration,
    /// Attempts at creating a run when the thread stream moves underneath.
    pub create_attempts: u32,
}

impl Default for RunServiceConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(300),
            join_poll_interval: Duration::from_millis(500),
            create_attempts: 3,
        }
    }
}

/// Request to create a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRun {
    /// Target thread. `None` creates a stateless run on an ephemeral thread.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub assistant_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub multitask_strategy: MultitaskStrategy,
}

/// Command resuming an interrupted run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeCommand {
    /// State merged into the thread before resuming, attributed to the interrupted node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,
    /// Value handed back to the interrupted node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,
    /// Node to continue from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    /// Messages to send to nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub send: Vec<Value>,
}

impl ResumeCommand {
    pub fn is_empty(&self) -> bool {
        self.update.is_none() && self.resume.is_none() && self.goto.is_none() && self.send.is_empty()
    }
}

/// Result of waiting on a run.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub run: RunRecord,
    /// The wait ended before the run finished or paused.
    pub timed_out: bool,
}

/// Event emitted by [`RunService::stream`].
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum RunStreamEvent {
    RunCreated(RunRecord),
    StatusUpdate(RunRecord),
    /// The run finished or paused; the stream closes after this.
    End(RunRecord),
    Timeout { run_id: String },
}

impl RunStreamEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunCreated(_) => "run_created",
            Self::StatusUpdate(_) => "status_update",
            Self::End(_) => "end",
            Self::Timeout { .. } => "timeout",
        }
    }
}

fn parse_status(record: &RunRecord) -> Result<RunStatus> {
    record.status.parse()
}

fn settled(record: &RunRecord) -> bool {
    parse_status(record).is_ok_and(|s| s.is_terminal() || s.is_paused())
}

/// Run lifecycle operations.
///
/// Durable state is the run, thread and interrupt streams. The task queue, the worker
/// registry and the run-to-worker assignments are in-memory and rebuilt by [`Self::recover`]
/// and by worker re-registration.
#[derive(Clone)]
pub struct RunService {
    events: EventStore,
    persistence: Arc<dyn Persistence>,
    threads: ThreadService,
    assistants: AssistantService,
    checkpoints: CheckpointStore,
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    /// run_id -> worker_id of runs handed out by poll.
    assignments: Arc<Mutex<HashMap<String, String>>>,
    config: RunServiceConfig,
}

impl RunService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: EventStore,
        persistence: Arc<dyn Persistence>,
        threads: ThreadService,
        assistants: AssistantService,
        checkpoints: CheckpointStore,
        registry: Arc<WorkerRegistry>,
        queue: Arc<TaskQueue>,
        config: RunServiceConfig,
    ) -> Self {
        Self {
            events,
            persistence,
            threads,
            assistants,
            checkpoints,
            registry,
            queue,
            assignments: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    async fn load(&self, run_id: &str) -> Result<Run> {
        let records = self.events.load(AGGREGATE_RUN, run_id).await?;
        if records.is_empty() {
            return Err(CoreError::not_found("run", run_id));
        }
        let run = Run::from_events(&records)?;
        if run.is_deleted() {
            return Err(CoreError::not_found("run", run_id));
        }
        Ok(run)
    }

    async fn load_interrupt(&self, interrupt_id: &str) -> Result<Interrupt> {
        let records = self.events.load(AGGREGATE_INTERRUPT, interrupt_id).await?;
        if records.is_empty() {
            return Err(CoreError::not_found("interrupt", interrupt_id));
        }
        Interrupt::from_events(&records)
    }

    /// Read the run projection.
    pub async fn get(&self, run_id: &str) -> Result<RunRecord> {
        self.persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run", run_id))
    }

    /// List runs, oldest first.
    pub async fn list(&self, filter: ListRunsFilter) -> Result<Vec<RunRecord>> {
        self.persistence.list_runs(&filter).await
    }

    /// Interrupts raised by a run, oldest first.
    pub async fn list_interrupts(&self, run_id: &str) -> Result<Vec<InterruptRecord>> {
        self.get(run_id).await?;
        self.persistence.list_interrupts(run_id).await
    }

    async fn active_runs(&self, thread_id: &str) -> Result<Vec<RunRecord>> {
        self.persistence
            .list_runs(&ListRunsFilter {
                thread_id: Some(thread_id.to_string()),
                statuses: RunStatus::ACTIVE.iter().map(|s| s.to_string()).collect(),
                limit: 1000,
                offset: 0,
            })
            .await
    }

    async fn graph_for(&self, assistant_id: &str) -> Result<String> {
        Ok(self.assistants.get(assistant_id).await?.graph_id)
    }

    // ========================================================================
    // Creation and arbitration
    // ========================================================================

    /// Create a run, applying the multitask strategy against the thread's active runs.
    ///
    /// Arbitration is serialized through the thread stream: the new run is attached to the
    /// thread in the same unit of work, so two concurrent creations cannot both observe an
    /// idle thread. The loser retries against the new state.
    #[instrument(skip(self, req), fields(assistant_id = %req.assistant_id))]
    pub async fn create(&self, req: CreateRun) -> Result<RunRecord> {
        let graph_id = self.graph_for(&req.assistant_id).await?;
        let thread_id = match &req.thread_id {
            Some(id) => id.clone(),
            None => self.threads.create_stateless().await?.thread_id,
        };

        let mut attempt = 0;
        let (record, cancelled, dispatch) = loop {
            attempt += 1;
            match self.try_create(&req, &thread_id).await {
                Ok(outcome) => break outcome,
                Err(CoreError::ConcurrencyConflict { .. })
                    if attempt < self.config.create_attempts =>
                {
                    debug!(thread_id = %thread_id, attempt, "Thread changed during run creation, retrying");
                }
                Err(e) => {
                    if req.thread_id.is_none() {
                        self.discard_ephemeral_thread(&thread_id).await;
                    }
                    return Err(e);
                }
            }
        };

        for run_id in &cancelled {
            self.queue.remove_run(run_id).await;
            self.release_assignment(run_id, false).await;
        }
        if dispatch {
            self.enqueue_start(&record, &graph_id).await;
        }

        info!(
            run_id = %record.run_id,
            thread_id = %record.thread_id,
            strategy = %req.multitask_strategy,
            cancelled = cancelled.len(),
            dispatched = dispatch,
            "Run created"
        );
        Ok(record)
    }

    async fn discard_ephemeral_thread(&self, thread_id: &str) {
        if let Err(e) = self.threads.delete(thread_id).await {
            warn!(
                thread_id = %thread_id,
                error = %e,
                "Failed to delete thread of a stateless run that was not created"
            );
        }
    }

    async fn try_create(
        &self,
        req: &CreateRun,
        thread_id: &str,
    ) -> Result<(RunRecord, Vec<String>, bool)> {
        let mut thread = self.threads.load(thread_id).await?;
        let active = self.active_runs(thread_id).await?;

        let mut run = Run::create(NewRun {
            run_id: None,
            thread_id: thread_id.to_string(),
            assistant_id: req.assistant_id.clone(),
            input: req.input.clone(),
            config: req.config.clone(),
            metadata: req.metadata.clone(),
            multitask_strategy: req.multitask_strategy,
        })?;
        thread.attach_run(run.id(), req.multitask_strategy.as_str())?;

        let mut uow = UnitOfWork::new();
        let mut cancelled = Vec::new();
        let dispatch = match (active.first(), req.multitask_strategy) {
            (None, _) => true,
            (Some(current), MultitaskStrategy::Reject) => {
                warn!(
                    thread_id = %thread_id,
                    active_run_id = %current.run_id,
                    active_status = %current.status,
                    "Rejecting run on busy thread"
                );
                return Err(CoreError::invalid_state(
                    ThreadStatus::Busy.as_str(),
                    "create run",
                ));
            }
            (Some(_), MultitaskStrategy::Interrupt | MultitaskStrategy::Rollback) => {
                for current in &active {
                    let mut other = self.load(&current.run_id).await?;
                    if other.status().is_terminal() {
                        continue;
                    }
                    if other.status().is_paused() {
                        self.stage_interrupt_cancellation(other.id(), &mut uow).await?;
                    }
                    other.cancel(format!("superseded by run {}", run.id()))?;
                    other.stage(&mut uow)?;
                    if req.multitask_strategy == MultitaskStrategy::Rollback {
                        uow.project(ProjectionWrite::DeleteRunCheckpoints {
                            thread_id: thread_id.to_string(),
                            run_id: other.id().to_string(),
                        });
                    }
                    cancelled.push(other.id().to_string());
                }
                true
            }
            (Some(_), MultitaskStrategy::Enqueue) => {
                run.defer_thread_status();
                false
            }
        };

        thread.stage(&mut uow)?;
        run.stage(&mut uow)?;
        self.events.commit(uow).await?;
        Ok((run.to_record(), cancelled, dispatch))
    }

    async fn enqueue_start(&self, record: &RunRecord, graph_id: &str) {
        let task = WorkerTask {
            task_id: WorkerTask::task_id_for(&record.run_id),
            kind: TaskKind::Start,
            run_id: record.run_id.clone(),
            thread_id: record.thread_id.clone(),
            assistant_id: record.assistant_id.clone(),
            graph_id: graph_id.to_string(),
            input: record.input.clone(),
            config: record.config.clone(),
            resume: None,
            checkpoint_id: None,
            created_at: chrono::Utc::now(),
        };
        if self.queue.push(task).await {
            debug!(run_id = %record.run_id, graph_id = %graph_id, "Start task queued");
        }
    }

    async fn enqueue_resume(
        &self,
        record: &RunRecord,
        graph_id: &str,
        resume: Value,
        checkpoint_id: Option<String>,
    ) {
        let task = WorkerTask {
            task_id: WorkerTask::task_id_for(&record.run_id),
            kind: TaskKind::Resume,
            run_id: record.run_id.clone(),
            thread_id: record.thread_id.clone(),
            assistant_id: record.assistant_id.clone(),
            graph_id: graph_id.to_string(),
            input: record.input.clone(),
            config: record.config.clone(),
            resume: Some(resume),
            checkpoint_id,
            created_at: chrono::Utc::now(),
        };
        if self.queue.push(task).await {
            debug!(run_id = %record.run_id, graph_id = %graph_id, "Resume task queued");
        }
    }

    async fn release_assignment(&self, run_id: &str, failed: bool) {
        let worker = self.assignments.lock().await.remove(run_id);
        if let Some(worker_id) = worker {
            self.registry.release(&worker_id, failed).await;
        }
    }

    /// Bring a thread in line with its remaining active runs after one of them left:
    /// dispatch the oldest waiting run when nothing else runs, and project the status.
    /// Returns whether a task was queued.
    async fn settle_thread(&self, thread_id: &str) -> Result<bool> {
        let active = self.active_runs(thread_id).await?;
        if active.is_empty() {
            return Ok(false);
        }

        let mut dispatched = false;
        let waiting_only = active.iter().all(|r| r.status == RunStatus::Queued.as_str());
        if waiting_only {
            let mut in_flight = false;
            for r in &active {
                if self.queue.contains(&r.run_id).await
                    || self.assignments.lock().await.contains_key(&r.run_id)
                {
                    in_flight = true;
                    break;
                }
            }
            if !in_flight {
                let next = &active[0];
                let graph_id = self.graph_for(&next.assistant_id).await?;
                self.enqueue_start(next, &graph_id).await;
                dispatched = true;
            }
        }

        let paused = active
            .iter()
            .any(|r| parse_status(r).is_ok_and(|s| s.is_paused()));
        let status = if paused {
            ThreadStatus::Interrupted
        } else {
            ThreadStatus::Busy
        };
        let mut uow = UnitOfWork::new();
        uow.project(ProjectionWrite::SetThreadStatus {
            thread_id: thread_id.to_string(),
            status: status.as_str().to_string(),
            updated_at: chrono::Utc::now(),
        });
        self.events.commit(uow).await?;
        Ok(dispatched)
    }

    /// Resolve the open interrupt of a run being cancelled so it does not linger.
    async fn stage_interrupt_cancellation(
        &self,
        run_id: &str,
        uow: &mut UnitOfWork,
    ) -> Result<()> {
        if let Some(open) = self.persistence.get_unresolved_interrupt(run_id).await? {
            let mut interrupt = self.load_interrupt(&open.interrupt_id).await?;
            interrupt.resolve(json!({ "cancelled": true }))?;
            interrupt.stage(uow)?;
        }
        Ok(())
    }

    /// Post-commit bookkeeping once a run reached a terminal status.
    async fn finish(&self, run: &Run, failed: bool) {
        self.release_assignment(run.id(), failed).await;
        if let Err(e) = self.settle_thread(run.thread_id()).await {
            warn!(
                run_id = %run.id(),
                thread_id = %run.thread_id(),
                error = %e,
                "Failed to settle thread after run finished"
            );
        }
    }

    // ========================================================================
    // Caller-driven transitions
    // ========================================================================

    /// Cancel a queued, running or paused run.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: &str, reason: Option<&str>) -> Result<RunRecord> {
        let mut run = self.load(run_id).await?;
        run.cancel(reason.unwrap_or("cancelled by user"))?;

        let mut uow = UnitOfWork::new();
        self.stage_interrupt_cancellation(run_id, &mut uow).await?;
        run.stage(&mut uow)?;
        self.events.commit(uow).await?;

        self.queue.remove_run(run_id).await;
        self.finish(&run, false).await;
        info!(run_id = %run_id, "Run cancelled");
        Ok(run.to_record())
    }

    /// Delete a finished run.
    #[instrument(skip(self))]
    pub async fn delete(&self, run_id: &str) -> Result<()> {
        let mut run = self.load(run_id).await?;
        run.delete()?;
        let mut uow = UnitOfWork::new();
        run.stage(&mut uow)?;
        self.events.commit(uow).await?;
        self.queue.remove_run(run_id).await;
        info!(run_id = %run_id, "Run deleted");
        Ok(())
    }

    /// Wait until the run finishes or pauses, or the timeout passes.
    pub async fn join(&self, run_id: &str, timeout: Option<Duration>) -> Result<JoinOutcome> {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.join_timeout);
        loop {
            let run = self.get(run_id).await?;
            if settled(&run) {
                return Ok(JoinOutcome {
                    run,
                    timed_out: false,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(JoinOutcome {
                    run,
                    timed_out: true,
                });
            }
            tokio::time::sleep(self.config.join_poll_interval.min(deadline - now)).await;
        }
    }

    /// Follow a run's status changes. The receiver yields `run_created` first, then one
    /// `status_update` per observed change, and closes after `end` or `timeout`.
    pub async fn stream(
        &self,
        run_id: &str,
        timeout: Option<Duration>,
    ) -> Result<mpsc::Receiver<RunStreamEvent>> {
        let first = self.get(run_id).await?;
        let (tx, rx) = mpsc::channel(16);
        let service = self.clone();
        let run_id = run_id.to_string();
        let deadline = Instant::now() + timeout.unwrap_or(self.config.join_timeout);

        tokio::spawn(async move {
            if tx.send(RunStreamEvent::RunCreated(first.clone())).await.is_err() {
                return;
            }
            let mut current = first;
            loop {
                if settled(&current) {
                    let _ = tx.send(RunStreamEvent::End(current)).await;
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    let _ = tx.send(RunStreamEvent::Timeout { run_id }).await;
                    return;
                }
                tokio::time::sleep(service.config.join_poll_interval.min(deadline - now)).await;

                let next = match service.get(&run_id).await {
                    Ok(next) => next,
                    Err(e) => {
                        debug!(run_id = %run_id, error = %e, "Run stream stopped");
                        return;
                    }
                };
                if next.status != current.status
                    && !settled(&next)
                    && tx
                        .send(RunStreamEvent::StatusUpdate(next.clone()))
                        .await
                        .is_err()
                {
                    return;
                }
                current = next;
            }
        });
        Ok(rx)
    }

    /// Resume a `requires_action` or `interrupted` run with tool-call outputs.
    #[instrument(skip(self, tool_outputs))]
    pub async fn submit_tool_outputs(
        &self,
        run_id: &str,
        tool_outputs: Vec<Value>,
    ) -> Result<RunRecord> {
        if tool_outputs.is_empty() {
            return Err(CoreError::invalid_input(
                "tool_outputs",
                "at least one tool output is required",
            ));
        }
        let mut run = self.load(run_id).await?;
        if !run.status().is_paused() {
            return Err(CoreError::invalid_state(
                run.status().as_str(),
                "submit tool outputs",
            ));
        }
        let graph_id = self.graph_for(run.assistant_id()).await?;
        let outputs = Value::Array(tool_outputs);

        let mut uow = UnitOfWork::new();
        let interrupt_id = match self.persistence.get_unresolved_interrupt(run_id).await? {
            Some(open) => {
                let mut interrupt = self.load_interrupt(&open.interrupt_id).await?;
                interrupt.resolve(json!({ "tool_outputs": outputs }))?;
                interrupt.stage(&mut uow)?;
                Some(open.interrupt_id)
            }
            None => None,
        };
        run.resume(interrupt_id, Some(outputs.clone()), None)?;
        run.stage(&mut uow)?;
        self.events.commit(uow).await?;

        let record = run.to_record();
        self.enqueue_resume(&record, &graph_id, json!({ "tool_outputs": outputs }), None)
            .await;
        info!(run_id = %run_id, "Tool outputs submitted");
        Ok(record)
    }

    /// Resume an interrupted run with a command. A state update is written as a new
    /// checkpoint before the run continues.
    #[instrument(skip(self, command))]
    pub async fn resume_with_command(
        &self,
        run_id: &str,
        command: ResumeCommand,
    ) -> Result<RunRecord> {
        if command.is_empty() {
            return Err(CoreError::invalid_input(
                "command",
                "one of update, resume, goto or send is required",
            ));
        }
        let mut run = self.load(run_id).await?;
        if !run.status().is_paused() {
            return Err(CoreError::invalid_state(run.status().as_str(), "resume"));
        }
        let graph_id = self.graph_for(run.assistant_id()).await?;
        let open = self.persistence.get_unresolved_interrupt(run_id).await?;

        let checkpoint_id = match &command.update {
            Some(update) => {
                let as_node = open.as_ref().map(|i| i.node_id.as_str());
                let cp = self
                    .checkpoints
                    .update_state(run.thread_id(), "", update.clone(), as_node)
                    .await?;
                Some(cp.checkpoint_id)
            }
            None => None,
        };
        let payload = serde_json::to_value(&command)?;

        let mut uow = UnitOfWork::new();
        let interrupt_id = match open {
            Some(open) => {
                let mut interrupt = self.load_interrupt(&open.interrupt_id).await?;
                interrupt.resolve(json!({ "command": payload }))?;
                interrupt.stage(&mut uow)?;
                Some(open.interrupt_id)
            }
            None => None,
        };
        run.resume(interrupt_id, None, Some(payload.clone()))?;
        run.stage(&mut uow)?;
        self.events.commit(uow).await?;

        let record = run.to_record();
        self.enqueue_resume(&record, &graph_id, json!({ "command": payload }), checkpoint_id)
            .await;
        info!(run_id = %run_id, "Run resumed with command");
        Ok(record)
    }

    // ========================================================================
    // Worker-driven transitions
    // ========================================================================

    /// Hand up to `max_tasks` queued tasks to a worker. Never fails: an unknown, unhealthy
    /// or saturated worker gets an empty list.
    #[instrument(skip(self))]
    pub async fn poll(&self, worker_id: &str, max_tasks: i32) -> Vec<WorkerTask> {
        let wanted = if max_tasks <= 0 { 1 } else { max_tasks };
        let Some((graphs, granted)) = self.registry.reserve(worker_id, wanted).await else {
            return Vec::new();
        };

        let candidates = self.queue.take(&graphs, granted.max(0) as usize).await;
        let mut claimed = Vec::with_capacity(candidates.len());
        // Slots already given back by a cancel that raced the claim.
        let mut released_elsewhere = 0;
        for task in candidates {
            // Assigned before the claim commits, so a cancel right after the commit
            // finds the assignment and frees the slot.
            self.assignments
                .lock()
                .await
                .insert(task.run_id.clone(), worker_id.to_string());
            let outcome = self.claim(&task).await;
            if !matches!(outcome, Ok(true))
                && self.assignments.lock().await.remove(&task.run_id).is_none()
            {
                released_elsewhere += 1;
            }
            match outcome {
                Ok(true) => claimed.push(task),
                Ok(false) => {
                    debug!(run_id = %task.run_id, "Dropping task for run that is no longer runnable");
                }
                Err(e) => {
                    warn!(
                        run_id = %task.run_id,
                        worker_id = %worker_id,
                        error = %e,
                        "Failed to claim task, requeueing"
                    );
                    self.queue.push(task).await;
                }
            }
        }

        self.registry
            .unreserve(
                worker_id,
                granted - claimed.len() as i32 - released_elsewhere,
            )
            .await;
        if !claimed.is_empty() {
            info!(worker_id = %worker_id, tasks = claimed.len(), "Tasks assigned");
        }
        claimed
    }

    /// Move the run of a task into `in_progress`. `Ok(false)` means the task is stale.
    async fn claim(&self, task: &WorkerTask) -> Result<bool> {
        let mut run = match self.load(&task.run_id).await {
            Ok(run) => run,
            Err(CoreError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        match task.kind {
            TaskKind::Start => {
                if run.status() != RunStatus::Queued {
                    return Ok(false);
                }
                run.start()?;
                let mut uow = UnitOfWork::new();
                run.stage(&mut uow)?;
                self.events.commit(uow).await?;
                Ok(true)
            }
            TaskKind::Resume => Ok(run.status() == RunStatus::InProgress),
        }
    }

    /// Apply an event reported by a worker. Events for runs that already finished or were
    /// deleted are ignored. While a run is assigned, only its worker may report on it.
    #[instrument(skip(self, event), fields(run_id = %event.run_id, event_type = event.kind.name()))]
    pub async fn handle_worker_event(&self, worker_id: &str, event: WorkerEvent) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.apply_worker_event(worker_id, &event).await {
                Err(CoreError::ConcurrencyConflict { .. }) if attempt < 3 => {
                    debug!(attempt, "Run changed while applying worker event, retrying");
                }
                other => return other,
            }
        }
    }

    async fn apply_worker_event(&self, worker_id: &str, event: &WorkerEvent) -> Result<()> {
        let mut run = match self.load(&event.run_id).await {
            Ok(run) => run,
            // A deleted run still has its stream; it ended like any finished run.
            Err(CoreError::NotFound { .. })
                if self.events.version(AGGREGATE_RUN, &event.run_id).await? > 0 =>
            {
                debug!(worker_id = %worker_id, "Ignoring worker event for deleted run");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if run.status().is_terminal() {
            debug!(
                worker_id = %worker_id,
                status = %run.status(),
                "Ignoring worker event for finished run"
            );
            return Ok(());
        }

        let owner = self.assignments.lock().await.get(run.id()).cloned();
        if let Some(owner) = owner.filter(|o| o != worker_id) {
            warn!(
                worker_id = %worker_id,
                owner = %owner,
                "Rejecting event from a worker that does not own the run"
            );
            return Err(CoreError::Forbidden);
        }

        match &event.kind {
            WorkerEventKind::NodeStarted { node_id } => {
                debug!(worker_id = %worker_id, node_id = %node_id, "Node started");
            }
            WorkerEventKind::NodeCompleted { node_id, .. } => {
                debug!(worker_id = %worker_id, node_id = %node_id, "Node completed");
            }
            WorkerEventKind::Checkpoint {
                checkpoint_ns,
                checkpoint_id,
                parent_checkpoint_id,
                channel_values,
                channel_versions,
                versions_seen,
                pending_sends,
                metadata,
                task_id,
                writes,
            } => {
                let cp = self
                    .record_checkpoint(
                        &run,
                        CheckpointReport {
                            checkpoint_ns,
                            checkpoint_id: checkpoint_id.clone(),
                            parent_checkpoint_id: parent_checkpoint_id.clone(),
                            channel_values,
                            channel_versions,
                            versions_seen,
                            pending_sends,
                            metadata,
                        },
                    )
                    .await?;
                if let Some(task_id) = task_id.as_deref().filter(|_| !writes.is_empty()) {
                    self.checkpoints
                        .put_writes(
                            &cp.thread_id,
                            &cp.checkpoint_ns,
                            &cp.checkpoint_id,
                            task_id,
                            writes.to_vec(),
                        )
                        .await?;
                }
            }
            WorkerEventKind::RunInterrupted {
                node_id,
                reason,
                state,
                tool_calls,
            } => {
                let reason: InterruptReason = reason.parse()?;
                let mut interrupt = Interrupt::create(
                    run.id(),
                    run.thread_id(),
                    node_id,
                    reason,
                    state.clone(),
                    tool_calls.clone(),
                )?;
                run.interrupt(
                    interrupt.id(),
                    node_id,
                    reason,
                    Value::Array(tool_calls.clone()),
                )?;
                let mut uow = UnitOfWork::new();
                interrupt.stage(&mut uow)?;
                run.stage(&mut uow)?;
                self.events.commit(uow).await?;
                // The worker is done with this task; a resume is a new task.
                self.release_assignment(run.id(), false).await;
                info!(
                    interrupt_id = %interrupt.id(),
                    node_id = %node_id,
                    reason = %reason,
                    "Run interrupted"
                );
            }
            WorkerEventKind::RunCompleted { output } => {
                run.complete(output.clone())?;
                self.commit_terminal(&mut run, false).await?;
                info!(worker_id = %worker_id, "Run completed");
            }
            WorkerEventKind::RunFailed { error } => {
                run.fail(error.clone())?;
                self.commit_terminal(&mut run, true).await?;
                warn!(worker_id = %worker_id, error = %error, "Run failed");
            }
            WorkerEventKind::RunTimeout { error } => {
                run.time_out(error.clone())?;
                self.commit_terminal(&mut run, true).await?;
                warn!(worker_id = %worker_id, "Run timed out");
            }
        }
        Ok(())
    }

    async fn commit_terminal(&self, run: &mut Run, failed: bool) -> Result<()> {
        let mut uow = UnitOfWork::new();
        run.stage(&mut uow)?;
        self.events.commit(uow).await?;
        self.finish(run, failed).await;
        Ok(())
    }

    async fn record_checkpoint(&self, run: &Run, report: CheckpointReport<'_>) -> Result<Checkpoint> {
        let parent = match report.parent_checkpoint_id {
            Some(parent) => Some(parent),
            None => self
                .checkpoints
                .find_latest(run.thread_id(), report.checkpoint_ns)
                .await?
                .map(|cp| cp.checkpoint_id),
        };

        let mut cp = Checkpoint::new(run.thread_id(), report.checkpoint_ns);
        if let Some(id) = report.checkpoint_id {
            cp.checkpoint_id = id;
        }
        cp.parent_checkpoint_id = parent.filter(|p| *p != cp.checkpoint_id);
        cp.run_id = Some(run.id().to_string());
        cp.channel_values = object_or_empty(report.channel_values, "channel_values")?;
        if !report.channel_versions.is_null() {
            cp.channel_versions = report.channel_versions.clone();
        }
        if !report.versions_seen.is_null() {
            cp.versions_seen = report.versions_seen.clone();
        }
        if !report.pending_sends.is_null() {
            cp.pending_sends = report.pending_sends.clone();
        }
        cp.metadata = object_or_empty(report.metadata, "metadata")?;
        cp.metadata
            .entry("source")
            .or_insert_with(|| json!("loop"));
        cp.metadata
            .insert("run_id".into(), Value::String(run.id().to_string()));

        self.checkpoints.save(&cp).await?;
        debug!(checkpoint_id = %cp.checkpoint_id, "Checkpoint recorded");
        Ok(cp)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Rewrite a run's projection row from its event stream. Returns `None` for deleted runs.
    pub async fn rebuild_projection(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let records = self.events.load(AGGREGATE_RUN, run_id).await?;
        if records.is_empty() {
            return Err(CoreError::not_found("run", run_id));
        }
        let run = Run::from_events(&records)?;
        let mut uow = UnitOfWork::new();
        uow.project(run.projection());
        self.events.commit(uow).await?;
        Ok((!run.is_deleted()).then(|| run.to_record()))
    }

    /// Rebuild the in-memory task queue after a restart. Queues the oldest waiting run of
    /// every thread with nothing in flight, and a resume task for every run that was
    /// resumed but never picked up. Returns the number of tasks queued.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        const PAGE: i64 = 100;
        let mut recovered = 0;
        let mut waiting_threads = BTreeSet::new();
        let mut offset = 0;

        loop {
            let page = self
                .persistence
                .list_runs(&ListRunsFilter {
                    thread_id: None,
                    statuses: vec![
                        RunStatus::Queued.as_str().to_string(),
                        RunStatus::InProgress.as_str().to_string(),
                    ],
                    limit: PAGE,
                    offset,
                })
                .await?;
            for record in &page {
                if record.status == RunStatus::Queued.as_str() {
                    waiting_threads.insert(record.thread_id.clone());
                } else if self.requeue_resumed(record).await? {
                    recovered += 1;
                }
            }
            if (page.len() as i64) < PAGE {
                break;
            }
            offset += PAGE;
        }

        for thread_id in waiting_threads {
            if self.settle_thread(&thread_id).await? {
                recovered += 1;
            }
        }

        info!(recovered, "Run recovery finished");
        Ok(recovered)
    }

    async fn requeue_resumed(&self, record: &RunRecord) -> Result<bool> {
        if self.queue.contains(&record.run_id).await
            || self.assignments.lock().await.contains_key(&record.run_id)
        {
            return Ok(false);
        }
        let events = self.events.load(AGGREGATE_RUN, &record.run_id).await?;
        if !Run::was_resumed_last(&events) {
            return Ok(false);
        }
        let Some(last) = events.last() else {
            return Ok(false);
        };
        let resume = match serde_json::from_value::<RunEvent>(last.payload.clone())? {
            RunEvent::Resumed {
                tool_outputs: Some(outputs),
                ..
            } => json!({ "tool_outputs": outputs }),
            RunEvent::Resumed {
                command: Some(command),
                ..
            } => json!({ "command": command }),
            _ => return Ok(false),
        };
        let graph_id = self.graph_for(&record.assistant_id).await?;
        self.enqueue_resume(record, &graph_id, resume, None).await;
        Ok(true)
    }
}

/// Borrowed checkpoint fields of a worker report.
struct CheckpointReport<'a> {
    checkpoint_ns: &'a str,
    checkpoint_id: Option<String>,
    parent_checkpoint_id: Option<String>,
    channel_values: &'a Value,
    channel_versions: &'a Value,
    versions_seen: &'a Value,
    pending_sends: &'a Value,
    metadata: &'a Value,
}

fn object_or_empty(value: &Value, field: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        _ => Err(CoreError::invalid_input(field, "must be a JSON object")),
    }
}
