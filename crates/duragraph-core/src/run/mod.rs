// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle.
//!
//! A run is one execution of an assistant's graph against a thread. The [`Run`] aggregate
//! owns the transition table; [`RunService`] arbitrates concurrent runs on a thread, hands
//! tasks to polling workers and applies the events they report.

mod aggregate;
mod interrupt;
mod service;
mod status;

pub use aggregate::{NewRun, Run, RunEvent};
pub use interrupt::{Interrupt, InterruptEvent, InterruptReason};
pub use service::{
    CreateRun, JoinOutcome, ResumeCommand, RunService, RunServiceConfig, RunStreamEvent,
};
pub use status::{MultitaskStrategy, RunStatus};
