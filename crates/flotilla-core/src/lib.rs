// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flotilla Core - Fleet Reconciliation Engine
//!
//! This crate drives a fleet of cloud servers toward a desired state: the
//! right number of instances, each running the current agent build and the
//! requested deployment. All state lives in one JSON document per fleet,
//! persisted after every pass so an interrupted run resumes where it left off.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     flotilla (CLI)                         │
//! └───────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │  Orchestrator        apply / deploy / terminate / status   │
//! │      │                                                     │
//! │      ▼                                                     │
//! │  ReconciliationLoop  load → pass → save → wait or stop     │
//! │      │                                                     │
//! │      ▼                                                     │
//! │  ServerLifecycle     per-server steps through a Session    │
//! │      │                                                     │
//! │      ▼                                                     │
//! │  Session             guards, failure ledger, backoff       │
//! └───────────────────────────────────────────────────────────┘
//!        │                  │                    │
//!        ▼                  ▼                    ▼
//!  CloudProvider     RemoteConnector        StateStore
//!  (HTTP gateway)    (SSH + SFTP)           (SQLite / files)
//! ```
//!
//! # Actions and checks
//!
//! Every side effect runs as a named session action or check. A failure is
//! recorded under its name with a Fibonacci backoff (1s up to ~21h) and the
//! step is skipped until its retry time. The loop keeps running passes while
//! they make progress and sleeps through short waits; a wait longer than the
//! configured maximum ends the run with [`LoopOutcome::Deferred`].
//!
//! # Stores
//!
//! | URL | Store |
//! |-----|-------|
//! | `sqlite:<path>` | [`store::SqliteStateStore`] |
//! | `file:<dir>` | [`store::FileStateStore`] |
//! | `memory:` | [`store::MemoryStateStore`] |

#![deny(missing_docs)]

pub mod clock;
pub mod cloud;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod package;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod store;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{ActionError, FleetError, Result};
pub use model::{
    CloudSpec, DeploymentRequest, DeploymentState, FleetState, InstanceState, PackageManager,
    Sentence, Server,
};
pub use orchestrator::{FleetStatus, Orchestrator, OrchestratorBuilder};
pub use reconcile::{LoopOutcome, ReconciliationLoop};
pub use session::{AbortReason, Flow, Session};

/// Version of this build. Servers are upgraded until they report it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
