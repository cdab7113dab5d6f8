// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent action executor.
//!
//! A [`Session`] runs named, guarded units of work against the failure ledger
//! of one pass. Each unit is either an *action* (success means the pass made
//! progress) or a *check* (may run every pass and returns a value).
//!
//! # Per-invocation algorithm
//!
//! 1. Guard false: log "not needed" and return. The ledger is not touched.
//! 2. Take the ledger entry for the name. If its retry time is still in the
//!    future, put it back unchanged, fold that time into the session's
//!    next-attempt minimum and return [`Flow::Abort`].
//! 3. Run the body. On success the entry stays removed; actions also set the
//!    "any action executed" flag.
//! 4. On failure, advance the backoff, store the entry, fold its retry time
//!    and return [`Flow::Abort`].
//!
//! `Flow::Abort` means "stop processing this server for this pass"; callers
//! move on to the next server. Only [`ActionError::Configuration`] escapes as
//! an error, because waiting never fixes it.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::{ActionError, FleetError, Result};
use crate::model::{FailureLedger, FailureRecord};

/// Escalating retry delays in seconds. The last value is the cap.
pub const BACKOFF_DELAYS: [u64; 24] = [
    1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610, 987, 1597, 2584, 4181, 6765, 10946,
    17711, 28657, 46368, 75025,
];

/// Longest delay the backoff ever reaches.
pub const MAX_BACKOFF_SECS: u64 = BACKOFF_DELAYS[BACKOFF_DELAYS.len() - 1];

/// The first delay strictly greater than `previous`, saturating at the cap.
pub fn next_delay(previous: u64) -> u64 {
    BACKOFF_DELAYS
        .iter()
        .copied()
        .find(|delay| *delay > previous)
        .unwrap_or(MAX_BACKOFF_SECS)
}

/// Result of a guarded step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<T> {
    /// Keep going with this server.
    Continue(T),
    /// Stop processing this server for the rest of the pass.
    Abort(AbortReason),
}

impl<T> Flow<T> {
    /// True for [`Flow::Abort`].
    pub fn is_abort(&self) -> bool {
        matches!(self, Flow::Abort(_))
    }
}

/// Why a server's processing stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The step is still backing off from an earlier failure.
    NotYetEligible {
        /// Step name.
        name: String,
        /// When it may run again.
        retry_at: DateTime<Utc>,
    },
    /// The step ran and failed just now.
    Failed {
        /// Step name.
        name: String,
        /// When it may run again.
        retry_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Action,
    Check,
}

/// Executor for one reconciliation pass.
pub struct Session {
    failures: FailureLedger,
    clock: Arc<dyn Clock>,
    next_attempt: Option<DateTime<Utc>>,
    any_actions_executed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("failures", &self.failures.len())
            .field("next_attempt", &self.next_attempt)
            .field("any_actions_executed", &self.any_actions_executed)
            .finish()
    }
}

impl Session {
    /// Start a session over the ledger taken from the state document.
    pub fn new(failures: FailureLedger, clock: Arc<dyn Clock>) -> Self {
        Self {
            failures,
            clock,
            next_attempt: None,
            any_actions_executed: false,
        }
    }

    /// Whether any action ran successfully (or the pass changed the fleet).
    pub fn any_actions_executed(&self) -> bool {
        self.any_actions_executed
    }

    /// Earliest retry time of anything that failed or was deferred.
    pub fn next_attempt(&self) -> Option<DateTime<Utc>> {
        self.next_attempt
    }

    /// Record progress made outside of an action, e.g. scaling edits.
    pub fn mark_changed(&mut self) {
        self.any_actions_executed = true;
    }

    /// Current time from the session clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The ledger as it stands.
    pub fn failures(&self) -> &FailureLedger {
        &self.failures
    }

    /// Drop every ledger entry whose name starts with `prefix`.
    pub fn forget_prefix(&mut self, prefix: &str) {
        self.failures.retain(|name, _| !name.starts_with(prefix));
    }

    /// Hand the ledger back for persisting.
    pub fn into_failures(self) -> FailureLedger {
        self.failures
    }

    /// Run `body` as an action when `needed` holds.
    ///
    /// Returns `Continue(true)` if it ran and succeeded, `Continue(false)` if
    /// it was not needed.
    pub async fn action<F>(&mut self, name: &str, needed: bool, body: F) -> Result<Flow<bool>>
    where
        F: Future<Output = std::result::Result<(), ActionError>>,
    {
        if !needed {
            debug!(action = %name, "Not needed");
            return Ok(Flow::Continue(false));
        }
        let flow = self.run(name, Kind::Action, body).await?;
        Ok(match flow {
            Flow::Continue(()) => Flow::Continue(true),
            Flow::Abort(reason) => Flow::Abort(reason),
        })
    }

    /// Run `body` as a check when `needed` holds, returning its value.
    ///
    /// Returns `Continue(None)` if the check was not needed.
    pub async fn check<T, F>(&mut self, name: &str, needed: bool, body: F) -> Result<Flow<Option<T>>>
    where
        F: Future<Output = std::result::Result<T, ActionError>>,
    {
        if !needed {
            debug!(check = %name, "Not needed");
            return Ok(Flow::Continue(None));
        }
        let flow = self.run(name, Kind::Check, body).await?;
        Ok(match flow {
            Flow::Continue(value) => Flow::Continue(Some(value)),
            Flow::Abort(reason) => Flow::Abort(reason),
        })
    }

    async fn run<T, F>(&mut self, name: &str, kind: Kind, body: F) -> Result<Flow<T>>
    where
        F: Future<Output = std::result::Result<T, ActionError>>,
    {
        let previous = self.failures.remove(name);
        let now = self.clock.now();

        if let Some(record) = &previous {
            let retry_at = record.next_attempt_at();
            if retry_at > now {
                debug!(
                    action = %name,
                    wait_secs = (retry_at - now).num_seconds(),
                    "Skipping, not yet eligible"
                );
                self.failures.insert(name.to_string(), record.clone());
                self.fold_next_attempt(retry_at);
                return Ok(Flow::Abort(AbortReason::NotYetEligible {
                    name: name.to_string(),
                    retry_at,
                }));
            }
        }

        debug!(action = %name, "Starting");
        match body.await {
            Ok(value) => {
                info!(action = %name, "Succeeded");
                if kind == Kind::Action {
                    self.any_actions_executed = true;
                }
                Ok(Flow::Continue(value))
            }
            Err(ActionError::Configuration(message)) => {
                if let Some(record) = previous {
                    self.failures.insert(name.to_string(), record);
                }
                error!(action = %name, error = %message, "Configuration error, aborting pass");
                Err(FleetError::Configuration(message))
            }
            Err(err) => {
                let record = Self::escalate(previous, now, &err);
                let retry_at = record.next_attempt_at();
                if err.is_expected_delay() {
                    info!(
                        action = %name,
                        reason = %err,
                        retry_in_secs = record.delay_secs,
                        "Not ready yet, will retry"
                    );
                } else {
                    error!(
                        action = %name,
                        error = %err,
                        failures = record.count,
                        retry_in_secs = record.delay_secs,
                        "Action failed, will retry"
                    );
                }
                self.failures.insert(name.to_string(), record);
                self.fold_next_attempt(retry_at);
                Ok(Flow::Abort(AbortReason::Failed {
                    name: name.to_string(),
                    retry_at,
                }))
            }
        }
    }

    fn escalate(
        previous: Option<FailureRecord>,
        now: DateTime<Utc>,
        err: &ActionError,
    ) -> FailureRecord {
        let (first_failure_at, count, delay_secs) = match previous {
            Some(record) => (record.first_failure_at, record.count, record.delay_secs),
            None => (now, 0, 0),
        };
        FailureRecord {
            first_failure_at,
            last_failure_at: now,
            count: count.saturating_add(1),
            delay_secs: next_delay(delay_secs),
            message: err.to_string(),
        }
    }

    fn fold_next_attempt(&mut self, at: DateTime<Utc>) {
        self.next_attempt = Some(match self.next_attempt {
            Some(current) if current <= at => current,
            _ => at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn session_at(clock: &ManualClock) -> Session {
        Session::new(FailureLedger::new(), Arc::new(clock.clone()))
    }

    async fn fail(session: &mut Session, name: &str) -> Flow<bool> {
        session
            .action(name, true, async { Err(ActionError::unexpected("boom")) })
            .await
            .unwrap()
    }

    #[test]
    fn test_next_delay_follows_sequence_and_saturates() {
        assert_eq!(next_delay(0), 1);
        assert_eq!(next_delay(1), 2);
        assert_eq!(next_delay(4), 5);
        assert_eq!(next_delay(46368), 75025);
        assert_eq!(next_delay(75025), 75025);
        assert_eq!(next_delay(u64::MAX), MAX_BACKOFF_SECS);
    }

    #[tokio::test]
    async fn test_guard_false_has_no_effect() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);
        let mut ran = false;

        let flow = session
            .action("srv-initial-setup", false, async {
                ran = true;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(flow, Flow::Continue(false));
        assert!(!ran);
        assert!(session.failures().is_empty());
        assert!(!session.any_actions_executed());
        assert!(session.next_attempt().is_none());
    }

    #[tokio::test]
    async fn test_guard_false_keeps_existing_entry() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);
        fail(&mut session, "srv-install-agent").await;
        let before = session.failures().clone();

        session
            .action("srv-install-agent", false, async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(session.failures(), &before);
    }

    #[tokio::test]
    async fn test_success_sets_executed_flag() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);

        let flow = session.action("a", true, async { Ok(()) }).await.unwrap();

        assert_eq!(flow, Flow::Continue(true));
        assert!(session.any_actions_executed());
        assert!(session.next_attempt().is_none());
    }

    #[tokio::test]
    async fn test_check_success_returns_value_without_progress() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);

        let flow = session.check("c", true, async { Ok(42) }).await.unwrap();

        assert_eq!(flow, Flow::Continue(Some(42)));
        assert!(!session.any_actions_executed());
    }

    #[tokio::test]
    async fn test_check_not_needed_returns_none() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);

        let flow = session
            .check::<bool, _>("c", false, async { Ok(true) })
            .await
            .unwrap();

        assert_eq!(flow, Flow::Continue(None));
    }

    #[tokio::test]
    async fn test_first_failure_creates_record() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);

        let flow = fail(&mut session, "x").await;

        assert!(flow.is_abort());
        let record = &session.failures()["x"];
        assert_eq!(record.count, 1);
        assert_eq!(record.delay_secs, 1);
        assert_eq!(record.first_failure_at, t0());
        assert_eq!(record.last_failure_at, t0());
        assert_eq!(record.message, "UnexpectedExternalProblem: boom");
        assert_eq!(session.next_attempt(), Some(t0() + Duration::seconds(1)));
        assert!(!session.any_actions_executed());
    }

    #[tokio::test]
    async fn test_consecutive_failures_follow_backoff_sequence() {
        let clock = ManualClock::new(t0());
        let mut delays = Vec::new();
        let mut failures = FailureLedger::new();

        for _ in 0..30 {
            let mut session = Session::new(failures, Arc::new(clock.clone()));
            fail(&mut session, "x").await;
            failures = session.into_failures();
            let record = &failures["x"];
            delays.push(record.delay_secs);
            clock.advance_secs(i64::try_from(record.delay_secs).unwrap());
        }

        assert_eq!(&delays[..24], &BACKOFF_DELAYS[..]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= MAX_BACKOFF_SECS));
        assert_eq!(failures["x"].count, 30);
        assert_eq!(failures["x"].first_failure_at, t0());
    }

    #[tokio::test]
    async fn test_success_removes_record() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);
        fail(&mut session, "x").await;
        clock.advance_secs(1);

        let flow = session.action("x", true, async { Ok(()) }).await.unwrap();

        assert_eq!(flow, Flow::Continue(true));
        assert!(!session.failures().contains_key("x"));
    }

    #[tokio::test]
    async fn test_not_yet_eligible_is_skipped_untouched() {
        let clock = ManualClock::new(t0());
        let mut failures = FailureLedger::new();
        failures.insert(
            "srv-privilege-check".to_string(),
            FailureRecord {
                first_failure_at: t0(),
                last_failure_at: t0(),
                count: 4,
                delay_secs: 5,
                message: "old".to_string(),
            },
        );
        let before = failures.clone();
        clock.advance_secs(2);
        let mut session = Session::new(failures, Arc::new(clock.clone()));
        let mut ran = false;

        let flow = session
            .check("srv-privilege-check", true, async {
                ran = true;
                Ok(())
            })
            .await
            .unwrap();

        assert!(!ran);
        assert_eq!(
            flow,
            Flow::Abort(AbortReason::NotYetEligible {
                name: "srv-privilege-check".to_string(),
                retry_at: t0() + Duration::seconds(5),
            })
        );
        assert_eq!(session.failures(), &before);
        assert_eq!(session.next_attempt(), Some(t0() + Duration::seconds(5)));
    }

    #[tokio::test]
    async fn test_eligible_exactly_at_retry_time() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);
        fail(&mut session, "x").await;
        clock.advance_secs(1);
        let mut ran = false;

        session
            .action("x", true, async {
                ran = true;
                Ok(())
            })
            .await
            .unwrap();

        assert!(ran);
    }

    #[tokio::test]
    async fn test_next_attempt_is_minimum() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);
        fail(&mut session, "a").await;
        fail(&mut session, "a").await; // still backing off, deferred at t0+1
        clock.advance_secs(1);
        fail(&mut session, "a").await; // second failure, delay 2 -> t0+3
        fail(&mut session, "b").await; // first failure -> t0+2

        assert_eq!(session.next_attempt(), Some(t0() + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_configuration_error_escapes_without_record() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);

        let result = session
            .action("x", true, async {
                Err(ActionError::Configuration("image_id not specified".into()))
            })
            .await;

        assert!(matches!(result, Err(FleetError::Configuration(_))));
        assert!(session.failures().is_empty());
        assert!(session.next_attempt().is_none());
    }

    #[tokio::test]
    async fn test_expected_delay_goes_through_backoff() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);

        let flow = session
            .check::<(), _>("c", true, async { Err(ActionError::delay("no address")) })
            .await
            .unwrap();

        assert!(flow.is_abort());
        assert_eq!(session.failures()["c"].delay_secs, 1);
        assert!(session.failures()["c"].message.starts_with("ExpectedDelay"));
    }

    #[tokio::test]
    async fn test_forget_prefix() {
        let clock = ManualClock::new(t0());
        let mut session = session_at(&clock);
        fail(&mut session, "aaa-initial-setup").await;
        fail(&mut session, "aaa-privilege-check").await;
        fail(&mut session, "bbb-initial-setup").await;

        session.forget_prefix("aaa-");

        let names: Vec<_> = session.failures().keys().cloned().collect();
        assert_eq!(names, vec!["bbb-initial-setup".to_string()]);
    }
}
