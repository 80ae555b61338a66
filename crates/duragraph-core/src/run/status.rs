// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run status table and multitask strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a run.
///
/// ```text
///   queued ──► in_progress ──► success | error | timeout | cancelled
///     │            │  ▲
///     │            ▼  │ resume
///     │     interrupted / requires_action ──► cancelled
///     └──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Success,
    Error,
    Timeout,
    Cancelled,
    /// Paused waiting for input, approval or a resume command.
    Interrupted,
    /// Paused waiting for tool-call outputs.
    RequiresAction,
}

impl RunStatus {
    /// Statuses a run can still leave. Interrupted runs count as active for arbitration.
    pub const ACTIVE: [&'static str; 4] = ["queued", "in_progress", "interrupted", "requires_action"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
            Self::RequiresAction => "requires_action",
        }
    }

    /// No further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Timeout | Self::Cancelled
        )
    }

    /// Paused and waiting for a resume.
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Interrupted | Self::RequiresAction)
    }

    /// Whether `self -> next` is in the transition table.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            Queued => matches!(next, InProgress | Cancelled),
            InProgress => matches!(
                next,
                Success | Error | Timeout | Cancelled | Interrupted | RequiresAction
            ),
            Interrupted | RequiresAction => matches!(next, InProgress | Cancelled),
            Success | Error | Timeout | Cancelled => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    /// Accepts the legacy aliases `pending`, `running`, `completed` and `failed`.
    fn from_str(s: &str) -> Result<Self, CoreError> {
        Ok(match s {
            "queued" | "pending" => Self::Queued,
            "in_progress" | "running" => Self::InProgress,
            "success" | "completed" => Self::Success,
            "error" | "failed" => Self::Error,
            "timeout" => Self::Timeout,
            "cancelled" => Self::Cancelled,
            "interrupted" => Self::Interrupted,
            "requires_action" => Self::RequiresAction,
            other => {
                return Err(CoreError::invalid_input(
                    "status",
                    format!("unknown run status '{}'", other),
                ));
            }
        })
    }
}

/// Policy for a new run on a thread that already has an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultitaskStrategy {
    /// Fail the new request.
    #[default]
    Reject,
    /// Cancel the active run and start the new one.
    Interrupt,
    /// Cancel the active run, drop the checkpoints it wrote, then start the new one.
    Rollback,
    /// Hold the new run until the active one finishes.
    Enqueue,
}

impl MultitaskStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Interrupt => "interrupt",
            Self::Rollback => "rollback",
            Self::Enqueue => "enqueue",
        }
    }
}

impl fmt::Display for MultitaskStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MultitaskStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "" | "reject" => Ok(Self::Reject),
            "interrupt" => Ok(Self::Interrupt),
            "rollback" => Ok(Self::Rollback),
            "enqueue" => Ok(Self::Enqueue),
            other => Err(CoreError::invalid_input(
                "multitask_strategy",
                format!("unknown strategy '{}'", other),
            )),
        }
    }
}
