// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{InterruptReason, MultitaskStrategy, RunStatus};
use crate::error::{CoreError, Result};
use crate::event_store::{AGGREGATE_RUN, DomainEvent, NewEvent, UnitOfWork};
use crate::persistence::{EventRecord, ProjectionWrite, RunRecord};
use crate::thread::ThreadStatus;

/// Parameters of a new run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub run_id: Option<String>,
    pub thread_id: String,
    pub assistant_id: String,
    pub input: Value,
    pub config: Value,
    pub metadata: Value,
    pub multitask_strategy: MultitaskStrategy,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Created {
        run_id: String,
        thread_id: String,
        assistant_id: String,
        input: Value,
        config: Value,
        metadata: Value,
        multitask_strategy: MultitaskStrategy,
        created_at: DateTime<Utc>,
    },
    Started {
        started_at: DateTime<Utc>,
    },
    Completed {
        output: Value,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        completed_at: DateTime<Utc>,
    },
    TimedOut {
        error: String,
        completed_at: DateTime<Utc>,
    },
    Cancelled {
        reason: String,
        completed_at: DateTime<Utc>,
    },
    Interrupted {
        interrupt_id: String,
        node_id: String,
        reason: InterruptReason,
        interrupted_at: DateTime<Utc>,
    },
    RequiresAction {
        interrupt_id: String,
        node_id: String,
        tool_calls: Value,
        interrupted_at: DateTime<Utc>,
    },
    Resumed {
        interrupt_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_outputs: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<Value>,
        resumed_at: DateTime<Utc>,
    },
    Deleted {
        deleted_at: DateTime<Utc>,
    },
}

impl DomainEvent for RunEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "run.created",
            Self::Started { .. } => "run.started",
            Self::Completed { .. } => "run.completed",
            Self::Failed { .. } => "run.failed",
            Self::TimedOut { .. } => "run.timed_out",
            Self::Cancelled { .. } => "run.cancelled",
            Self::Interrupted { .. } => "run.interrupted",
            Self::RequiresAction { .. } => "run.requires_action",
            Self::Resumed { .. } => "run.resumed",
            Self::Deleted { .. } => "run.deleted",
        }
    }
}

fn object(value: Value, field: &str) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Object(Map::new())),
        v @ Value::Object(_) => Ok(v),
        _ => Err(CoreError::invalid_input(field, "must be a JSON object")),
    }
}

/// Event-sourced run. All state changes go through the transition table.
#[derive(Debug, Clone)]
pub struct Run {
    record: RunRecord,
    status: RunStatus,
    /// Status as last committed; drives the thread status projection.
    committed_status: Option<RunStatus>,
    deleted: bool,
    version: i64,
    pending: Vec<RunEvent>,
}

impl Run {
    fn blank(run_id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            record: RunRecord {
                run_id,
                thread_id: String::new(),
                assistant_id: String::new(),
                status: RunStatus::Queued.as_str().to_string(),
                input: Value::Null,
                output: None,
                error: None,
                config: Value::Null,
                metadata: Value::Null,
                multitask_strategy: MultitaskStrategy::Reject.as_str().to_string(),
                created_at,
                started_at: None,
                completed_at: None,
                updated_at: created_at,
            },
            status: RunStatus::Queued,
            committed_status: None,
            deleted: false,
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Validate and record a queued run.
    pub fn create(new: NewRun) -> Result<Self> {
        if new.thread_id.is_empty() {
            return Err(CoreError::invalid_input("thread_id", "thread_id is required"));
        }
        if new.assistant_id.is_empty() {
            return Err(CoreError::invalid_input(
                "assistant_id",
                "assistant_id is required",
            ));
        }
        let run_id = match new.run_id {
            Some(id) if id.is_empty() => {
                return Err(CoreError::invalid_input("run_id", "must not be empty"));
            }
            Some(id) => id,
            None => uuid::Uuid::now_v7().to_string(),
        };
        let input = object(new.input, "input")?;
        let config = object(new.config, "config")?;
        let metadata = object(new.metadata, "metadata")?;
        let now = Utc::now();

        let mut run = Self::blank(run_id.clone(), now);
        run.record(RunEvent::Created {
            run_id,
            thread_id: new.thread_id,
            assistant_id: new.assistant_id,
            input,
            config,
            metadata,
            multitask_strategy: new.multitask_strategy,
            created_at: now,
        });
        Ok(run)
    }

    /// Rebuild from the run stream.
    pub fn from_events(records: &[EventRecord]) -> Result<Self> {
        let mut run: Option<Self> = None;
        for r in records {
            let event: RunEvent = serde_json::from_value(r.payload.clone())?;
            if run.is_none() {
                let RunEvent::Created {
                    run_id, created_at, ..
                } = &event
                else {
                    return Err(CoreError::internal(
                        "rehydrate_run",
                        format!("stream {} does not start with run.created", r.stream_id),
                    ));
                };
                run = Some(Self::blank(run_id.clone(), *created_at));
            }
            if let Some(run) = run.as_mut() {
                run.apply(&event);
                run.version = r.event_version;
            }
        }
        let mut run = run.ok_or_else(|| CoreError::internal("rehydrate_run", "empty stream"))?;
        run.committed_status = Some(run.status);
        Ok(run)
    }

    fn set_status(&mut self, status: RunStatus, at: DateTime<Utc>) {
        self.status = status;
        self.record.status = status.as_str().to_string();
        self.record.updated_at = at;
    }

    fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Created {
                thread_id,
                assistant_id,
                input,
                config,
                metadata,
                multitask_strategy,
                created_at,
                ..
            } => {
                self.record.thread_id = thread_id.clone();
                self.record.assistant_id = assistant_id.clone();
                self.record.input = input.clone();
                self.record.config = config.clone();
                self.record.metadata = metadata.clone();
                self.record.multitask_strategy = multitask_strategy.as_str().to_string();
                self.set_status(RunStatus::Queued, *created_at);
            }
            RunEvent::Started { started_at } => {
                self.record.started_at.get_or_insert(*started_at);
                self.set_status(RunStatus::InProgress, *started_at);
            }
            RunEvent::Completed {
                output,
                completed_at,
            } => {
                self.record.output = Some(output.clone());
                self.record.completed_at = Some(*completed_at);
                self.set_status(RunStatus::Success, *completed_at);
            }
            RunEvent::Failed {
                error,
                completed_at,
            } => {
                self.record.error = Some(error.clone());
                self.record.completed_at = Some(*completed_at);
                self.set_status(RunStatus::Error, *completed_at);
            }
            RunEvent::TimedOut {
                error,
                completed_at,
            } => {
                self.record.error = Some(error.clone());
                self.record.completed_at = Some(*completed_at);
                self.set_status(RunStatus::Timeout, *completed_at);
            }
            RunEvent::Cancelled { completed_at, .. } => {
                self.record.completed_at = Some(*completed_at);
                self.set_status(RunStatus::Cancelled, *completed_at);
            }
            RunEvent::Interrupted { interrupted_at, .. } => {
                self.set_status(RunStatus::Interrupted, *interrupted_at);
            }
            RunEvent::RequiresAction { interrupted_at, .. } => {
                self.set_status(RunStatus::RequiresAction, *interrupted_at);
            }
            RunEvent::Resumed { resumed_at, .. } => {
                self.set_status(RunStatus::InProgress, *resumed_at);
            }
            RunEvent::Deleted { deleted_at } => {
                self.deleted = true;
                self.record.updated_at = *deleted_at;
            }
        }
    }

    fn record(&mut self, event: RunEvent) {
        self.apply(&event);
        self.pending.push(event);
    }

    fn ensure(&self, next: RunStatus, operation: &str) -> Result<()> {
        if self.deleted {
            return Err(CoreError::invalid_state("deleted", operation));
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::invalid_state(self.status.as_str(), operation));
        }
        Ok(())
    }

    /// A worker picked the run up.
    pub fn start(&mut self) -> Result<()> {
        self.ensure(RunStatus::InProgress, "start")?;
        if self.status != RunStatus::Queued {
            return Err(CoreError::invalid_state(self.status.as_str(), "start"));
        }
        self.record(RunEvent::Started {
            started_at: Utc::now(),
        });
        Ok(())
    }

    pub fn complete(&mut self, output: Value) -> Result<()> {
        self.ensure(RunStatus::Success, "complete")?;
        self.record(RunEvent::Completed {
            output,
            completed_at: Utc::now(),
        });
        Ok(())
    }

    /// Record a failure. The message is stored verbatim.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure(RunStatus::Error, "fail")?;
        self.record(RunEvent::Failed {
            error: error.into(),
            completed_at: Utc::now(),
        });
        Ok(())
    }

    pub fn time_out(&mut self, error: Option<String>) -> Result<()> {
        self.ensure(RunStatus::Timeout, "time out")?;
        self.record(RunEvent::TimedOut {
            error: error.unwrap_or_else(|| "run timed out".to_string()),
            completed_at: Utc::now(),
        });
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure(RunStatus::Cancelled, "cancel")?;
        self.record(RunEvent::Cancelled {
            reason: reason.into(),
            completed_at: Utc::now(),
        });
        Ok(())
    }

    /// Pause on an interrupt. Tool-call interrupts put the run in `requires_action`.
    pub fn interrupt(
        &mut self,
        interrupt_id: &str,
        node_id: &str,
        reason: InterruptReason,
        tool_calls: Value,
    ) -> Result<()> {
        let now = Utc::now();
        if reason == InterruptReason::ToolCall {
            self.ensure(RunStatus::RequiresAction, "require action")?;
            self.record(RunEvent::RequiresAction {
                interrupt_id: interrupt_id.to_string(),
                node_id: node_id.to_string(),
                tool_calls,
                interrupted_at: now,
            });
        } else {
            self.ensure(RunStatus::Interrupted, "interrupt")?;
            self.record(RunEvent::Interrupted {
                interrupt_id: interrupt_id.to_string(),
                node_id: node_id.to_string(),
                reason,
                interrupted_at: now,
            });
        }
        Ok(())
    }

    /// Continue a paused run. At least one of `tool_outputs` or `command` is required.
    pub fn resume(
        &mut self,
        interrupt_id: Option<String>,
        tool_outputs: Option<Value>,
        command: Option<Value>,
    ) -> Result<()> {
        if !self.status.is_paused() {
            return Err(CoreError::invalid_state(self.status.as_str(), "resume"));
        }
        self.ensure(RunStatus::InProgress, "resume")?;
        if tool_outputs.is_none() && command.is_none() {
            return Err(CoreError::invalid_input(
                "resume",
                "tool outputs or a command is required",
            ));
        }
        self.record(RunEvent::Resumed {
            interrupt_id,
            tool_outputs,
            command,
            resumed_at: Utc::now(),
        });
        Ok(())
    }

    /// Delete a finished run.
    pub fn delete(&mut self) -> Result<()> {
        if self.deleted {
            return Err(CoreError::invalid_state("deleted", "delete"));
        }
        if !self.status.is_terminal() {
            return Err(CoreError::invalid_state(self.status.as_str(), "delete"));
        }
        self.record(RunEvent::Deleted {
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.record.run_id
    }

    pub fn thread_id(&self) -> &str {
        &self.record.thread_id
    }

    pub fn assistant_id(&self) -> &str {
        &self.record.assistant_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Leave the thread status to the runs already active on the thread. Applies to the
    /// status staged next; later transitions project it again.
    pub(crate) fn defer_thread_status(&mut self) {
        self.committed_status = Some(self.status);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Whether the newest event of a run stream is `run.resumed`.
    pub(crate) fn was_resumed_last(records: &[EventRecord]) -> bool {
        records
            .last()
            .is_some_and(|r| r.event_type == "run.resumed")
    }

    pub fn to_record(&self) -> RunRecord {
        self.record.clone()
    }

    /// Move pending events and projection writes into `uow`.
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
        uow.append(AGGREGATE_RUN, self.id(), self.version, events);

        if self.deleted {
            uow.project(ProjectionWrite::DeleteRun {
                run_id: self.id().to_string(),
            });
        } else {
            uow.project(ProjectionWrite::UpsertRun(self.to_record()));
            if self.committed_status != Some(self.status) {
                uow.project(ProjectionWrite::SetThreadStatus {
                    thread_id: self.record.thread_id.clone(),
                    status: ThreadStatus::for_run_status(self.status)
                        .as_str()
                        .to_string(),
                    updated_at: self.record.updated_at,
                });
            }
        }

        self.committed_status = Some(self.status);
        self.pending.clear();
        self.version += count;
        Ok(())
    }

    /// Projection rebuilt from the committed events only.
    pub(crate) fn projection(&self) -> ProjectionWrite {
        if self.deleted {
            ProjectionWrite::DeleteRun {
                run_id: self.id().to_string(),
            }
        } else {
            ProjectionWrite::UpsertRun(self.to_record())
        }
    }
}
