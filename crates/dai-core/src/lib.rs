// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAI Core - Work Item Queue and Adapter Coordination
//!
//! This crate provides the coordination layer shared by DAI telemetry
//! adapters. Adapters never talk to each other directly: they queue work items
//! in a shared store, claim the items addressed to their adapter type, and
//! report results back through the same store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Agent (one per adapter process)                  │
//! │        register → base work item → poll loop → teardown → close         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                     │                          │
//!        ▼                     ▼                          ▼
//! ┌───────────────┐   ┌────────────────────┐   ┌─────────────────────┐
//! │ WorkItemQueue │   │NodeStateCoordinator│   │   RasEventEmitter   │
//! │ claim/finish  │   │ boot/error states  │   │ fire-and-forget RAS │
//! └───────────────┘   └────────────────────┘   └─────────────────────┘
//!        │                     │                          │
//!        └─────────────────────┼──────────────────────────┘
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │   ProcedureGateway    │
//!                  │ (named procedures)    │
//!                  └───────────────────────┘
//!                              │
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │        SQLite         │
//!                  └───────────────────────┘
//! ```
//!
//! # Work Item State Machine
//!
//! ```text
//!   queue          claim                 finish            mark done
//! ───────▶ Q ─────────────▶ W ──────────────────▶ F ─────────────────▶ D
//!          ▲                │ └───────────────────▶ E ─────────────────▶ D
//!          │   requeue      │    finish with error
//!          └──── R ◀────────┘
//!             (owner gone)
//! ```
//!
//! Items queued without "notify when finished" skip straight from F/E to D.
//! Every adapter instance owns exactly one base work item (`BaseWork`) that it
//! claims at startup and finishes at teardown.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DAI_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `DAI_ADAPTER_TYPE` | No | `WLM` | Adapter family |
//! | `DAI_IDLE_SLEEP_MS` | No | `100` | Idle sleep unit |
//! | `DAI_MAX_IDLE_BACKOFF` | No | `5` | Idle multiplier cap |
//!
//! See [`config::Config::from_env`] for the full list.
//!
//! # Modules
//!
//! - [`adapter`]: adapter instance identity and shutdown signal
//! - [`agent`]: adapter lifecycle, registration and the poll loop
//! - [`compression`]: gzip+base64 result payload codec
//! - [`gateway`]: named procedure gateway and its SQLite implementation
//! - [`handlers`]: built-in work item handlers
//! - [`node_state`]: node boot/error state transitions and WLM notification
//! - [`params`]: work item parameter blob codec
//! - [`ras`]: RAS event emission and failure classification
//! - [`work_queue`]: work item claim/finish/wait operations

/// Adapter instance identity and shutdown signal.
pub mod adapter;

/// Adapter lifecycle: registration, poll loop, teardown.
pub mod agent;

/// Result payload compression.
pub mod compression;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Named procedure gateway.
pub mod gateway;

/// Built-in work item handlers.
pub mod handlers;

/// Embedded schema migrations.
pub mod migrations;

/// Node state transitions.
pub mod node_state;

/// Work item parameter codec.
pub mod params;

/// RAS event emission.
pub mod ras;

/// Work item queue operations.
pub mod work_queue;

pub use adapter::AdapterIdentity;
pub use agent::{Agent, AgentConfig, AgentState, WorkHandler};
pub use config::Config;
pub use error::{DaiError, Result};
pub use gateway::{ProcedureGateway, SqliteGateway};
pub use node_state::{BootState, NodeStateCoordinator};
pub use ras::RasEventEmitter;
pub use work_queue::{WaitOptions, WorkItemQueue};

/// Current time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
