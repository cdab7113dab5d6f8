// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The reconciliation loop.
//!
//! Each iteration loads the state document, runs one lifecycle pass with a
//! fresh [`Session`] over the document's ledger, and stores the document
//! again whether or not the pass made progress. Then:
//!
//! - if any action ran, the next pass starts right away;
//! - if nothing is waiting for a retry, the fleet has converged;
//! - if the earliest retry is further away than the configured maximum, the
//!   loop stops and leaves the rest to the next invocation;
//! - otherwise it sleeps until the retry time and goes again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{Instrument, Span, debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::lifecycle::ServerLifecycle;
use crate::session::Session;
use crate::store::FleetStateRepo;

/// How a run of the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Nothing pending and nothing awaiting retry.
    Converged {
        /// Passes run.
        passes: u32,
    },
    /// Work remains but the next retry is too far away to wait for.
    Deferred {
        /// Passes run.
        passes: u32,
        /// Earliest retry time.
        next_attempt: DateTime<Utc>,
        /// How long that is from the end of the last pass.
        wait: Duration,
    },
}

impl LoopOutcome {
    /// Passes run before the loop stopped.
    pub fn passes(&self) -> u32 {
        match self {
            LoopOutcome::Converged { passes } | LoopOutcome::Deferred { passes, .. } => *passes,
        }
    }

    /// True for [`LoopOutcome::Converged`].
    pub fn is_converged(&self) -> bool {
        matches!(self, LoopOutcome::Converged { .. })
    }
}

/// Top-level driver of reconciliation passes.
pub struct ReconciliationLoop {
    repo: FleetStateRepo,
    lifecycle: ServerLifecycle,
    clock: Arc<dyn Clock>,
    max_repeat_delay: Duration,
    span: Span,
}

impl ReconciliationLoop {
    /// Loop over the document in `repo`. Waits longer than
    /// `max_repeat_delay` end the run instead of sleeping.
    pub fn new(
        repo: FleetStateRepo,
        lifecycle: ServerLifecycle,
        clock: Arc<dyn Clock>,
        max_repeat_delay: Duration,
        span: Span,
    ) -> Self {
        Self {
            repo,
            lifecycle,
            clock,
            max_repeat_delay,
            span,
        }
    }

    /// Run passes until convergence or a wait that is too long.
    pub async fn roll_forward(&self) -> Result<LoopOutcome> {
        self.run().instrument(self.span.clone()).await
    }

    async fn run(&self) -> Result<LoopOutcome> {
        let mut passes: u32 = 0;
        loop {
            passes += 1;
            let mut state = self.repo.load().await?;
            let mut session =
                Session::new(std::mem::take(&mut state.failures), self.clock.clone());

            debug!(pass = passes, servers = state.servers.len(), "Starting pass");
            let outcome = self.lifecycle.run_pass(&mut state, &mut session).await;

            let progressed = session.any_actions_executed();
            let next_attempt = session.next_attempt();
            state.failures = session.into_failures();
            self.repo.save(&state).await?;
            outcome?;

            if progressed {
                debug!(pass = passes, "Progress made, running another pass");
                continue;
            }

            let Some(next_attempt) = next_attempt else {
                info!(passes, servers = state.servers.len(), "Fleet converged");
                return Ok(LoopOutcome::Converged { passes });
            };

            let wait = (next_attempt - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if wait > self.max_repeat_delay {
                info!(
                    passes,
                    wait_secs = wait.as_secs(),
                    max_secs = self.max_repeat_delay.as_secs(),
                    next_attempt = %next_attempt,
                    "Next attempt is too far away, stopping"
                );
                return Ok(LoopOutcome::Deferred {
                    passes,
                    next_attempt,
                    wait,
                });
            }

            info!(wait_secs = wait.as_secs_f64(), "Waiting for next attempt");
            self.clock.sleep(wait).await;
        }
    }
}
