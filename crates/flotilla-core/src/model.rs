// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The fleet state document and its parts.
//!
//! [`FleetState`] is the single persisted document per fleet. Every field
//! decodes to an explicit default when absent, so documents written by older
//! versions load without special casing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ActionError;

/// Current version of the persisted document layout.
pub const FORMAT_VERSION: u32 = 1;

/// Failure records keyed by action name.
pub type FailureLedger = BTreeMap<String, FailureRecord>;

/// The whole persisted state of one fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    /// Layout version of this document.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// Managed servers in insertion order.
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Desired fleet shape, supplied by `apply`.
    #[serde(default)]
    pub cloud_spec: Option<CloudSpec>,
    /// Pending or last completed software rollout.
    #[serde(default)]
    pub deployment_request: Option<DeploymentRequest>,
    /// Private key of the fleet keypair.
    #[serde(default)]
    pub ssh_key_material: Option<KeyMaterial>,
    /// Per-action failure tracking.
    #[serde(default)]
    pub failures: FailureLedger,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl Default for FleetState {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            servers: Vec::new(),
            cloud_spec: None,
            deployment_request: None,
            ssh_key_material: None,
            failures: FailureLedger::new(),
        }
    }
}

impl FleetState {
    /// Number of servers the orchestrator intends to keep.
    pub fn live_count(&self) -> usize {
        self.servers.iter().filter(|s| s.sentence.is_live()).count()
    }

    /// Find a server by uuid.
    pub fn server(&self, uuid: Uuid) -> Option<&Server> {
        self.servers.iter().find(|s| s.uuid == uuid)
    }
}

/// A managed server. Its uuid outlives any single cloud instance id lookup
/// but never moves to a different instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Stable identity, also used as the launch idempotency token.
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    /// Cloud-assigned instance id, set at most once.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Public network address, once assigned.
    #[serde(default)]
    pub public_address: Option<String>,
    /// Last observed cloud lifecycle state.
    #[serde(default)]
    pub instance_state: Option<InstanceState>,
    /// What the orchestrator wants to happen to this server.
    #[serde(default)]
    pub sentence: Sentence,
    /// Whether the current deployment still has to be applied here.
    #[serde(default)]
    pub deployment_pending: bool,
}

impl Server {
    /// A fresh server that should be provisioned.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            instance_id: None,
            public_address: None,
            instance_state: None,
            sentence: Sentence::Live,
            deployment_pending: false,
        }
    }

    /// Ledger key for a step of this server.
    pub fn action_name(&self, step: &str) -> String {
        format!("{}-{}", self.uuid, step)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrator intent for a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentence {
    /// Should exist and be healthy.
    #[default]
    Live,
    /// Should be terminated.
    Die,
    /// Confirmed gone, removed at the end of the pass.
    Dead,
}

impl Sentence {
    /// True for [`Sentence::Live`].
    pub fn is_live(self) -> bool {
        self == Sentence::Live
    }
}

impl fmt::Display for Sentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentence::Live => write!(f, "live"),
            Sentence::Die => write!(f, "die"),
            Sentence::Dead => write!(f, "dead"),
        }
    }
}

/// Cloud-reported instance lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Booting.
    Pending,
    /// Up.
    Running,
    /// Being stopped.
    Stopping,
    /// Stopped but not gone.
    Stopped,
    /// Termination in progress.
    ShuttingDown,
    /// Gone.
    Terminated,
    /// Not in the cloud's instance list at all.
    DoesNotExist,
    /// Anything the provider reports that flotilla does not model.
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    /// Parse a provider state name; unrecognised names map to `Unknown`.
    pub fn from_provider(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "does-not-exist" => Self::DoesNotExist,
            _ => Self::Unknown,
        }
    }

    /// The instance is gone for good.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Terminated | Self::DoesNotExist)
    }

    /// Termination has been requested or completed.
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated | Self::DoesNotExist)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::DoesNotExist => "does-not-exist",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Desired fleet shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSpec {
    /// Machine type to launch.
    #[serde(default)]
    pub instance_type: String,
    /// Image to launch.
    #[serde(default)]
    pub image_id: String,
    /// Number of live servers to keep.
    #[serde(default)]
    pub desired_count: u32,
    /// Package manager of the image's OS.
    #[serde(default)]
    pub package_manager: PackageManager,
    /// Login user on launched servers.
    #[serde(default = "default_remote_user")]
    pub remote_user: String,
    /// Overrides the package manager's default prerequisite list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerequisites: Option<Vec<String>>,
}

fn default_remote_user() -> String {
    "ec2-user".to_string()
}

impl CloudSpec {
    /// Check the fields a launch needs.
    ///
    /// Missing fields are a configuration problem that no amount of retrying
    /// fixes, so they surface as [`ActionError::Configuration`].
    pub fn require_launch_fields(&self) -> std::result::Result<(), ActionError> {
        if self.instance_type.trim().is_empty() {
            return Err(ActionError::Configuration(
                "instance_type not specified".to_string(),
            ));
        }
        if self.image_id.trim().is_empty() {
            return Err(ActionError::Configuration(
                "image_id not specified".to_string(),
            ));
        }
        Ok(())
    }

    /// Packages installed before the agent.
    pub fn prerequisite_packages(&self) -> Vec<String> {
        match &self.prerequisites {
            Some(list) => list.clone(),
            None => self
                .package_manager
                .default_prerequisites()
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// OS package manager on fleet servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// RPM based images.
    #[default]
    Yum,
    /// Debian based images.
    Apt,
}

impl PackageManager {
    /// Build prerequisites for the agent.
    pub fn default_prerequisites(self) -> &'static [&'static str] {
        match self {
            PackageManager::Yum => &["gcc", "gcc-c++", "openssl", "openssl-devel", "git"],
            PackageManager::Apt => &["build-essential", "openssl", "libssl-dev", "git"],
        }
    }

    /// Non-interactive install command for `packages`.
    pub fn install_command(self, packages: &[String]) -> String {
        let list = packages.join(" ");
        match self {
            PackageManager::Yum => format!("yum install -y {}", list),
            PackageManager::Apt => format!(
                "sh -c 'apt-get update -q && DEBIAN_FRONTEND=noninteractive apt-get install -y -q {}'",
                list
            ),
        }
    }
}

/// A requested software rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Full revision id being rolled out.
    pub revision_id: String,
    /// When the rollout was requested.
    pub requested_at: DateTime<Utc>,
    /// Rollout progress.
    #[serde(default)]
    pub state: DeploymentState,
}

/// Progress of a deployment request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Some live server still has it pending.
    #[default]
    Pending,
    /// Applied on every live server.
    Completed,
}

/// Failure bookkeeping for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// When the current failure streak started.
    pub first_failure_at: DateTime<Utc>,
    /// Most recent failure.
    pub last_failure_at: DateTime<Utc>,
    /// Consecutive failures.
    #[serde(default)]
    pub count: u32,
    /// Current backoff interval in seconds.
    #[serde(default)]
    pub delay_secs: u64,
    /// Last error description.
    #[serde(default)]
    pub message: String,
}

impl FailureRecord {
    /// Earliest time the action may be attempted again.
    pub fn next_attempt_at(&self) -> DateTime<Utc> {
        let delay = i64::try_from(self.delay_secs).unwrap_or(i64::MAX);
        self.last_failure_at + Duration::seconds(delay)
    }
}

/// Private key text. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyMaterial(String);

impl KeyMaterial {
    /// Wrap key text.
    pub fn new(material: impl Into<String>) -> Self {
        Self(material.into())
    }

    /// The key text.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial(<{} bytes>)", self.0.len())
    }
}
