// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interrupt aggregate: a paused point in a run awaiting external input.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::event_store::{AGGREGATE_INTERRUPT, DomainEvent, NewEvent, UnitOfWork};
use crate::persistence::{EventRecord, InterruptRecord, ProjectionWrite};

/// Why a run paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// Waiting for tool-call outputs; the run becomes `requires_action`.
    ToolCall,
    ApprovalRequired,
    InputNeeded,
}

impl InterruptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::ApprovalRequired => "approval_required",
            Self::InputNeeded => "input_needed",
        }
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterruptReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tool_call" => Ok(Self::ToolCall),
            "approval_required" => Ok(Self::ApprovalRequired),
            "input_needed" => Ok(Self::InputNeeded),
            other => Err(CoreError::invalid_input(
                "reason",
                format!("unknown interrupt reason '{}'", other),
            )),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterruptEvent {
    Created {
        interrupt_id: String,
        run_id: String,
        thread_id: String,
        node_id: String,
        reason: InterruptReason,
        state: Value,
        tool_calls: Value,
        created_at: DateTime<Utc>,
    },
    Resolved {
        resolution: Value,
        resolved_at: DateTime<Utc>,
    },
}

impl DomainEvent for InterruptEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "interrupt.created",
            Self::Resolved { .. } => "interrupt.resolved",
        }
    }
}

/// Event-sourced interrupt.
#[derive(Debug, Clone)]
pub struct Interrupt {
    record: InterruptRecord,
    version: i64,
    pending: Vec<InterruptEvent>,
}

impl Interrupt {
    fn blank(interrupt_id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            record: InterruptRecord {
                interrupt_id,
                run_id: String::new(),
                thread_id: String::new(),
                node_id: String::new(),
                reason: String::new(),
                state: Value::Null,
                tool_calls: Value::Null,
                resolved: false,
                resolved_at: None,
                created_at,
            },
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Record a new unresolved interrupt.
    pub fn create(
        run_id: &str,
        thread_id: &str,
        node_id: &str,
        reason: InterruptReason,
        state: Value,
        tool_calls: Vec<Value>,
    ) -> Result<Self> {
        if run_id.is_empty() {
            return Err(CoreError::invalid_input("run_id", "run_id is required"));
        }
        if node_id.is_empty() {
            return Err(CoreError::invalid_input("node_id", "node_id is required"));
        }
        let now = Utc::now();
        let interrupt_id = uuid::Uuid::new_v4().to_string();
        let state = if state.is_null() {
            Value::Object(Default::default())
        } else {
            state
        };

        let mut interrupt = Self::blank(interrupt_id.clone(), now);
        interrupt.record(InterruptEvent::Created {
            interrupt_id,
            run_id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            node_id: node_id.to_string(),
            reason,
            state,
            tool_calls: Value::Array(tool_calls),
            created_at: now,
        });
        Ok(interrupt)
    }

    pub fn from_events(records: &[EventRecord]) -> Result<Self> {
        let mut interrupt: Option<Self> = None;
        for r in records {
            let event: InterruptEvent = serde_json::from_value(r.payload.clone())?;
            if interrupt.is_none() {
                let InterruptEvent::Created {
                    interrupt_id,
                    created_at,
                    ..
                } = &event
                else {
                    return Err(CoreError::internal(
                        "rehydrate_interrupt",
                        format!("stream {} does not start with interrupt.created", r.stream_id),
                    ));
                };
                interrupt = Some(Self::blank(interrupt_id.clone(), *created_at));
            }
            if let Some(i) = interrupt.as_mut() {
                i.apply(&event);
                i.version = r.event_version;
            }
        }
        interrupt.ok_or_else(|| CoreError::internal("rehydrate_interrupt", "empty stream"))
    }

    fn apply(&mut self, event: &InterruptEvent) {
        match event {
            InterruptEvent::Created {
                run_id,
                thread_id,
                node_id,
                reason,
                state,
                tool_calls,
                ..
            } => {
                self.record.run_id = run_id.clone();
                self.record.thread_id = thread_id.clone();
                self.record.node_id = node_id.clone();
                self.record.reason = reason.as_str().to_string();
                self.record.state = state.clone();
                self.record.tool_calls = tool_calls.clone();
            }
            InterruptEvent::Resolved { resolved_at, .. } => {
                self.record.resolved = true;
                self.record.resolved_at = Some(*resolved_at);
            }
        }
    }

    fn record(&mut self, event: InterruptEvent) {
        self.apply(&event);
        self.pending.push(event);
    }

    /// Mark resolved with the input that resolved it.
    pub fn resolve(&mut self, resolution: Value) -> Result<()> {
        if self.record.resolved {
            return Err(CoreError::invalid_state("resolved", "resolve interrupt"));
        }
        self.record(InterruptEvent::Resolved {
            resolution,
            resolved_at: Utc::now(),
        });
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.record.interrupt_id
    }

    pub fn node_id(&self) -> &str {
        &self.record.node_id
    }

    pub fn is_resolved(&self) -> bool {
        self.record.resolved
    }

    pub fn to_record(&self) -> InterruptRecord {
        self.record.clone()
    }

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
        uow.append(AGGREGATE_INTERRUPT, self.id(), self.version, events);
        uow.project(ProjectionWrite::UpsertInterrupt(self.to_record()));
        self.pending.clear();
        self.version += count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_requires_node() {
        let err = Interrupt::create("r", "t", "", InterruptReason::InputNeeded, Value::Null, vec![])
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_resolve_once() {
        let mut i = Interrupt::create(
            "r",
            "t",
            "review",
            InterruptReason::ApprovalRequired,
            Value::Null,
            vec![],
        )
        .unwrap();
        assert_eq!(i.to_record().state, json!({}));
        i.resolve(json!({"approved": true})).unwrap();
        assert!(i.is_resolved());
        let err = i.resolve(json!({})).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
    }

    #[test]
    fn test_stage_advances_version() {
        let mut i = Interrupt::create(
            "r",
            "t",
            "tools",
            InterruptReason::ToolCall,
            Value::Null,
            vec![json!({"id": "call-1", "name": "search"})],
        )
        .unwrap();
        let mut uow = UnitOfWork::new();
        i.stage(&mut uow).unwrap();
        assert_eq!(uow.appends[0].expected_version, 0);
        assert_eq!(uow.appends[0].events[0].event_type, "interrupt.created");

        i.resolve(json!([])).unwrap();
        let mut uow = UnitOfWork::new();
        i.stage(&mut uow).unwrap();
        assert_eq!(uow.appends[0].expected_version, 1);
        assert!(matches!(
            &uow.projections[0],
            ProjectionWrite::UpsertInterrupt(r) if r.resolved
        ));
    }

    #[test]
    fn test_reason_parse() {
        assert_eq!(
            "tool_call".parse::<InterruptReason>().unwrap(),
            InterruptReason::ToolCall
        );
        assert!("nap".parse::<InterruptReason>().is_err());
    }
}
