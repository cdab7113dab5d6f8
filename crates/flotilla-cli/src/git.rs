// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resolving git refs to full revision ids.

use std::path::Path;

use anyhow::{Context, Result, bail};
use flotilla_core::orchestrator::is_full_revision;
use tokio::process::Command;

/// Resolve `git_ref` to a commit id using the repository at `dir`.
pub async fn rev_parse(dir: &Path, git_ref: &str) -> Result<String> {
    let output = Command::new("git")
        .arg("rev-parse")
        .arg("--verify")
        .arg("--end-of-options")
        .arg(format!("{git_ref}^{{commit}}"))
        .current_dir(dir)
        .output()
        .await
        .context("failed to run git")?;
    if !output.status.success() {
        bail!(
            "git could not resolve {:?}: {}",
            git_ref,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_revision(&String::from_utf8_lossy(&output.stdout))
}

fn parse_revision(stdout: &str) -> Result<String> {
    let revision = stdout.trim();
    if !is_full_revision(revision) {
        bail!("git returned {:?}, not a full revision id", revision);
    }
    Ok(revision.to_ascii_lowercase())
}
