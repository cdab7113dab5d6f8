// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Default state store location.
pub const DEFAULT_STATE_URL: &str = "sqlite:.flotilla/state.db";

/// Default longest wait the loop accepts before giving up for this run.
pub const DEFAULT_MAX_REPEAT_DELAY_SECS: u64 = 10;

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Fleet name, if set in the environment.
    pub fleet: Option<String>,
    /// `sqlite:<path>`, `file:<dir>` or `memory:`.
    pub state_url: String,
    /// Compute gateway base URL.
    pub cloud_endpoint: Option<String>,
    /// Longest wait the reconciliation loop sleeps through.
    pub max_repeat_delay: Duration,
    /// Agent artifact to upload; the running executable when unset.
    pub agent_package: Option<PathBuf>,
    /// Shell command that rebuilds the agent artifact.
    pub agent_build_command: Option<String>,
    /// Directory where the fleet key file is written.
    pub key_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fleet: None,
            state_url: DEFAULT_STATE_URL.to_string(),
            cloud_endpoint: None,
            max_repeat_delay: Duration::from_secs(DEFAULT_MAX_REPEAT_DELAY_SECS),
            agent_package: None,
            agent_build_command: None,
            key_dir: PathBuf::from("."),
        }
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `FLOTILLA_FLEET`: fleet name
    /// - `FLOTILLA_STATE_URL`: state store (default: `sqlite:.flotilla/state.db`)
    /// - `FLOTILLA_CLOUD_ENDPOINT`: compute gateway base URL
    /// - `FLOTILLA_MAX_REPEAT_DELAY_SECS`: longest loop wait (default: 10)
    /// - `FLOTILLA_AGENT_PACKAGE`: agent artifact path
    /// - `FLOTILLA_AGENT_BUILD_COMMAND`: command rebuilding the artifact
    /// - `FLOTILLA_KEY_DIR`: key file directory (default: `.`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let state_url =
            optional("FLOTILLA_STATE_URL").unwrap_or_else(|| DEFAULT_STATE_URL.to_string());
        if !(state_url.starts_with("sqlite:")
            || state_url.starts_with("file:")
            || state_url == "memory:")
        {
            return Err(ConfigError::Invalid(
                "FLOTILLA_STATE_URL",
                "must start with sqlite: or file:",
            ));
        }

        let max_repeat_delay_secs: u64 = optional("FLOTILLA_MAX_REPEAT_DELAY_SECS")
            .unwrap_or_else(|| DEFAULT_MAX_REPEAT_DELAY_SECS.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FLOTILLA_MAX_REPEAT_DELAY_SECS",
                    "must be a non-negative integer",
                )
            })?;

        let cloud_endpoint = optional("FLOTILLA_CLOUD_ENDPOINT");
        if let Some(endpoint) = &cloud_endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(
                "FLOTILLA_CLOUD_ENDPOINT",
                "must be an http:// or https:// URL",
            ));
        }

        Ok(Self {
            fleet: optional("FLOTILLA_FLEET"),
            state_url,
            cloud_endpoint,
            max_repeat_delay: Duration::from_secs(max_repeat_delay_secs),
            agent_package: optional("FLOTILLA_AGENT_PACKAGE").map(PathBuf::from),
            agent_build_command: optional("FLOTILLA_AGENT_BUILD_COMMAND"),
            key_dir: optional("FLOTILLA_KEY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }

    /// The fleet name, which must be set by now.
    pub fn require_fleet(&self) -> Result<&str, ConfigError> {
        self.fleet
            .as_deref()
            .ok_or(ConfigError::Missing("FLOTILLA_FLEET"))
    }

    /// The gateway endpoint, which cloud commands need.
    pub fn require_cloud_endpoint(&self) -> Result<&str, ConfigError> {
        self.cloud_endpoint
            .as_deref()
            .ok_or(ConfigError::Missing("FLOTILLA_CLOUD_ENDPOINT"))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
