// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Human-readable rendering of command results.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use flotilla_core::{FleetStatus, LoopOutcome};

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

/// Status summary, without the raw document.
pub fn render_status(status: &FleetStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Fleet: {}", status.fleet);

    match &status.cloud_spec {
        Some(spec) => {
            let _ = writeln!(
                out,
                "Desired: {} x {} from {} ({:?}, user {})",
                spec.desired_count,
                or_dash(Some(spec.instance_type.as_str()).filter(|s| !s.is_empty())),
                or_dash(Some(spec.image_id.as_str()).filter(|s| !s.is_empty())),
                spec.package_manager,
                spec.remote_user
            );
        }
        None => {
            let _ = writeln!(out, "Desired: no cloud spec applied");
        }
    }

    if let Some(request) = &status.deployment_request {
        let _ = writeln!(
            out,
            "Deployment: {} requested {} ({:?})",
            request.revision_id,
            timestamp(request.requested_at),
            request.state
        );
    }

    let _ = writeln!(out, "\nServers ({}):", status.servers.len());
    for server in &status.servers {
        let state = server
            .instance_state
            .as_ref()
            .map(ToString::to_string);
        let _ = writeln!(
            out,
            "  {}  {:<6} {:<20} {:<16} {:<14}{}",
            server.uuid,
            server.sentence.to_string(),
            or_dash(server.instance_id.as_deref()),
            or_dash(server.public_address.as_deref()),
            or_dash(state.as_deref()),
            if server.deployment_pending {
                " deploy-pending"
            } else {
                ""
            }
        );
    }

    if !status.failures.is_empty() {
        let _ = writeln!(out, "\nFailures ({}):", status.failures.len());
        for failure in &status.failures {
            let _ = writeln!(
                out,
                "  {}: {} failure(s), last {}, retry after {} ({}s backoff)\n    {}",
                failure.action,
                failure.count,
                timestamp(failure.last_failure_at),
                timestamp(failure.next_attempt_at),
                failure.delay_secs,
                failure.message
            );
        }
    }

    if let Some(instances) = &status.cloud_instances {
        let _ = writeln!(out, "\nCloud instances ({}):", instances.len());
        for instance in instances {
            let _ = writeln!(
                out,
                "  {:<20} {:<14} {:<16} {} {}",
                instance.instance_id,
                instance.state,
                or_dash(instance.public_address.as_deref()),
                instance.instance_type,
                instance.image_id
            );
        }
    }

    out
}

/// One line describing how a run ended.
pub fn render_outcome(outcome: &LoopOutcome) -> String {
    match outcome {
        LoopOutcome::Converged { passes } => {
            format!("Fleet converged after {} pass(es).", passes)
        }
        LoopOutcome::Deferred {
            passes,
            next_attempt,
            wait,
        } => format!(
            "Stopped after {} pass(es); next attempt in {}s at {}. Run roll-forward again later.",
            passes,
            wait.as_secs(),
            timestamp(*next_attempt)
        ),
    }
}
