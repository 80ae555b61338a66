// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duragraph Core - Durable Graph-Run Control Plane
//!
//! This crate is the control plane for durable graph runs. It does not execute graphs:
//! independently deployed workers register the graphs they can run, poll for tasks and
//! report progress back. Everything durable is an append-only event stream, with read
//! projections and a transactional outbox written in the same transaction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         API layer (embedder)                         │
//! │        assistants · threads · runs · state · worker protocol         │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │                 │                      │
//!          ▼                 ▼                      ▼
//! ┌────────────────┐ ┌───────────────┐  ┌─────────────────────────────┐
//! │ AssistantSvc   │ │ CheckpointStore│  │ RunService                  │
//! │ ThreadService  │ │ (state, fork) │  │ arbitration · poll · events │
//! └────────────────┘ └───────────────┘  └─────────────────────────────┘
//!          │                 │             │            │
//!          ▼                 ▼             ▼            ▼
//! ┌──────────────────────────────────┐  ┌──────────┐ ┌────────────────┐
//! │ EventStore: streams + projections │  │TaskQueue │ │ WorkerRegistry │
//! │ + outbox in one transaction       │  └──────────┘ └────────────────┘
//! └──────────────────────────────────┘        ▲              ▲
//!          │                                  │              │
//!          ▼                                  │      LivenessMonitor
//! ┌──────────────────┐    ┌────────────┐      │
//! │ PostgreSQL/SQLite│───►│ OutboxRelay│──────┘ (TaskQueueIngest)
//! └──────────────────┘    └────────────┘──► tracing · broadcast bus
//! ```
//!
//! # Run Status State Machine
//!
//! ```text
//!   queued ──► in_progress ──► success | error | timeout | cancelled
//!     │            │  ▲
//!     │            ▼  │ resume
//!     │     interrupted / requires_action ──► cancelled
//!     └──► cancelled
//! ```
//!
//! | Status | Description |
//! |--------|-------------|
//! | `queued` | Created, waiting for a worker (or for the thread's active run) |
//! | `in_progress` | Claimed by a worker |
//! | `interrupted` | Paused at a node, waiting for a resume command |
//! | `requires_action` | Paused on tool calls, waiting for tool outputs |
//! | `success` | Finished with output |
//! | `error` | Failed; the worker's message is kept verbatim |
//! | `timeout` | Exceeded its time budget |
//! | `cancelled` | Cancelled by a caller or superseded by another run |
//!
//! # Multitask Strategies
//!
//! When a run is created on a thread that already has an active run:
//!
//! | Strategy | Behavior |
//! |----------|----------|
//! | `reject` | The new run is refused (default) |
//! | `interrupt` | Active runs are cancelled, the new run is dispatched |
//! | `rollback` | Like `interrupt`, and the checkpoints of the cancelled runs are dropped |
//! | `enqueue` | The new run waits until the thread has no other active run |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DURAGRAPH_DATABASE_URL` | Yes | - | PostgreSQL or `sqlite:` connection string |
//! | `DURAGRAPH_BASE_URL` | No | `http://localhost:8080` | Base of worker protocol URLs |
//! | `DURAGRAPH_WORKER_LIVENESS_SECS` | No | `30` | Heartbeat age before a worker is unhealthy |
//! | `DURAGRAPH_RELAY_INTERVAL_MS` | No | `1000` | Delay between outbox relay passes |
//! | `DURAGRAPH_RELAY_BATCH_SIZE` | No | `10` | Outbox rows per relay pass |
//! | `DURAGRAPH_OUTBOX_RETENTION_DAYS` | No | `7` | Age before published rows are deleted |
//! | `DURAGRAPH_JOIN_TIMEOUT_SECS` | No | `300` | Default join/stream wait |
//! | `DURAGRAPH_MAX_DB_CONNECTIONS` | No | `10` | Database pool size |
//!
//! # Modules
//!
//! - [`event_store`]: Units of work over event streams with optimistic concurrency
//! - [`outbox`]: Outbox relay and publishers
//! - [`checkpoint`]: Checkpoint DAG, thread state and thread forking
//! - [`run`]: Run aggregate, interrupts and the run service
//! - [`worker`]: Worker registry, task queue and liveness monitor
//! - [`runtime`]: Embeddable [`runtime::ControlPlane`]

#![warn(missing_docs)]

/// Assistants: named graph configurations.
#[allow(missing_docs)]
pub mod assistant;

/// Checkpoint storage, thread state and thread copies.
#[allow(missing_docs)]
pub mod checkpoint;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types with API error code mapping.
pub mod error;

/// Event streams, units of work and optimistic concurrency.
pub mod event_store;

/// Embedded database migrations.
pub mod migrations;

/// Transactional outbox relay and publishers.
pub mod outbox;

/// Persistence layer (PostgreSQL and SQLite).
pub mod persistence;

/// Run lifecycle.
#[allow(missing_docs)]
pub mod run;

/// Embeddable control plane.
#[allow(missing_docs)]
pub mod runtime;

/// Threads: conversation containers runs execute against.
#[allow(missing_docs)]
pub mod thread;

/// Worker registry and pull-based task distribution.
#[allow(missing_docs)]
pub mod worker;
