// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entry points for one fleet.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flotilla_core::{Orchestrator, cloud::HttpCloudProvider, store};
//!
//! let orchestrator = Orchestrator::builder()
//!     .fleet("web")
//!     .store(store::open("sqlite:.flotilla/state.db").await?)
//!     .cloud(Arc::new(HttpCloudProvider::new(endpoint, credentials)?))
//!     .build()?;
//!
//! orchestrator.apply_desired_spec(spec).await?;
//! let outcome = orchestrator.roll_forward().await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{Instrument, Span, info, info_span, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::cloud::{CloudProvider, InstanceInfo};
use crate::config::DEFAULT_MAX_REPEAT_DELAY_SECS;
use crate::error::{FleetError, Result};
use crate::lifecycle::ServerLifecycle;
use crate::model::{
    CloudSpec, DeploymentRequest, DeploymentState, FleetState, InstanceState, Sentence,
};
use crate::package::{LocalPackageSource, PackageSource};
use crate::reconcile::{LoopOutcome, ReconciliationLoop};
use crate::remote::{RemoteConnector, SshConnector};
use crate::store::repo::encode;
use crate::store::{FleetStateRepo, StateStore};

/// Whether `name` can be used as a fleet name.
pub fn is_valid_fleet_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Whether `revision` is a full 40-digit hexadecimal revision id.
pub fn is_full_revision(revision: &str) -> bool {
    revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
}

/// Builder for creating an [`Orchestrator`].
pub struct OrchestratorBuilder {
    fleet: Option<String>,
    store: Option<Arc<dyn StateStore>>,
    cloud: Option<Arc<dyn CloudProvider>>,
    connector: Option<Arc<dyn RemoteConnector>>,
    packages: Option<Arc<dyn PackageSource>>,
    clock: Arc<dyn Clock>,
    max_repeat_delay: Duration,
    key_dir: PathBuf,
    agent_version: String,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("fleet", &self.fleet)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("cloud", &self.cloud.as_ref().map(|_| "..."))
            .field("max_repeat_delay", &self.max_repeat_delay)
            .field("key_dir", &self.key_dir)
            .field("agent_version", &self.agent_version)
            .finish()
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            fleet: None,
            store: None,
            cloud: None,
            connector: None,
            packages: None,
            clock: Arc::new(SystemClock),
            max_repeat_delay: Duration::from_secs(DEFAULT_MAX_REPEAT_DELAY_SECS),
            key_dir: PathBuf::from("."),
            agent_version: crate::VERSION.to_string(),
        }
    }
}

impl OrchestratorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fleet name (required).
    pub fn fleet(mut self, fleet: impl Into<String>) -> Self {
        self.fleet = Some(fleet.into());
        self
    }

    /// Set the state store (required).
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cloud provider. Without one, only local entry points work.
    pub fn cloud(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Set the remote connector.
    ///
    /// Default: [`SshConnector`]
    pub fn connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the agent package source.
    ///
    /// Default: the running executable
    pub fn packages(mut self, packages: Arc<dyn PackageSource>) -> Self {
        self.packages = Some(packages);
        self
    }

    /// Set the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Longest wait the loop sleeps through.
    ///
    /// Default: 10 seconds
    pub fn max_repeat_delay(mut self, delay: Duration) -> Self {
        self.max_repeat_delay = delay;
        self
    }

    /// Directory for the fleet key file.
    ///
    /// Default: `.`
    pub fn key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }

    /// Agent version servers must run.
    ///
    /// Default: this crate's version
    pub fn agent_version(mut self, version: impl Into<String>) -> Self {
        self.agent_version = version.into();
        self
    }

    /// Build the orchestrator.
    ///
    /// Returns an error if required fields are missing or the fleet name is
    /// unusable.
    pub fn build(self) -> Result<Orchestrator> {
        let fleet = self
            .fleet
            .ok_or_else(|| FleetError::InvalidRequest("fleet name is required".to_string()))?;
        if !is_valid_fleet_name(&fleet) {
            return Err(FleetError::InvalidRequest(format!(
                "fleet name {:?} must be 1-64 letters, digits, '-' or '_'",
                fleet
            )));
        }
        let store = self
            .store
            .ok_or_else(|| FleetError::InvalidRequest("state store is required".to_string()))?;
        let packages = match self.packages {
            Some(packages) => packages,
            None => Arc::new(LocalPackageSource::current_exe()?),
        };

        let span = info_span!("fleet", fleet = %fleet);
        Ok(Orchestrator {
            repo: FleetStateRepo::new(store, &fleet),
            fleet,
            cloud: self.cloud,
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(SshConnector::new())),
            packages,
            clock: self.clock,
            max_repeat_delay: self.max_repeat_delay,
            key_dir: self.key_dir,
            agent_version: self.agent_version,
            span,
        })
    }
}

/// One row of [`FleetStatus::servers`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    /// Stable identity.
    pub uuid: Uuid,
    /// Cloud instance id.
    pub instance_id: Option<String>,
    /// Public address.
    pub public_address: Option<String>,
    /// Last observed state.
    pub instance_state: Option<InstanceState>,
    /// Orchestrator intent.
    pub sentence: Sentence,
    /// Deployment still to apply.
    pub deployment_pending: bool,
}

/// One row of [`FleetStatus::failures`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureStatus {
    /// Action name.
    pub action: String,
    /// Consecutive failures.
    pub count: u32,
    /// Current backoff.
    pub delay_secs: u64,
    /// Most recent failure.
    pub last_failure_at: DateTime<Utc>,
    /// Earliest retry.
    pub next_attempt_at: DateTime<Utc>,
    /// Last error.
    pub message: String,
}

/// Snapshot of a fleet for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStatus {
    /// Fleet name.
    pub fleet: String,
    /// Desired shape.
    pub cloud_spec: Option<CloudSpec>,
    /// Managed servers.
    pub servers: Vec<ServerStatus>,
    /// Ledger entries.
    pub failures: Vec<FailureStatus>,
    /// Current or last rollout.
    pub deployment_request: Option<DeploymentRequest>,
    /// The cloud's instance list, fetched only when no servers are managed.
    pub cloud_instances: Option<Vec<InstanceInfo>>,
    /// The stored document with secrets redacted.
    pub document: serde_json::Value,
}

/// Orchestrator for one fleet.
pub struct Orchestrator {
    fleet: String,
    repo: FleetStateRepo,
    cloud: Option<Arc<dyn CloudProvider>>,
    connector: Arc<dyn RemoteConnector>,
    packages: Arc<dyn PackageSource>,
    clock: Arc<dyn Clock>,
    max_repeat_delay: Duration,
    key_dir: PathBuf,
    agent_version: String,
    span: Span,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("fleet", &self.fleet)
            .field("container", &self.repo.container())
            .field("max_repeat_delay", &self.max_repeat_delay)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create a new builder.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Fleet name.
    pub fn fleet(&self) -> &str {
        &self.fleet
    }

    /// Path of the fleet's private key file.
    pub fn key_file_path(&self) -> PathBuf {
        self.key_dir.join(format!("id_flotilla-{}", self.fleet))
    }

    fn require_cloud(&self) -> Result<Arc<dyn CloudProvider>> {
        self.cloud.clone().ok_or_else(|| {
            FleetError::Configuration("no cloud endpoint configured".to_string())
        })
    }

    /// Store the desired fleet shape. Takes effect on the next roll-forward.
    pub async fn apply_desired_spec(&self, spec: CloudSpec) -> Result<()> {
        async {
            let desired = spec.desired_count;
            self.repo
                .update(|state| {
                    state.cloud_spec = Some(spec);
                    Ok(())
                })
                .await?;
            info!(desired_count = desired, "Desired spec applied");
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Record a rollout of `revision_id` and mark every live server pending.
    pub async fn request_deployment(&self, revision_id: &str) -> Result<DeploymentRequest> {
        if !is_full_revision(revision_id) {
            return Err(FleetError::InvalidRequest(format!(
                "revision {:?} is not a 40-digit hexadecimal id",
                revision_id
            )));
        }
        let request = DeploymentRequest {
            revision_id: revision_id.to_ascii_lowercase(),
            requested_at: self.clock.now(),
            state: DeploymentState::Pending,
        };

        async {
            let marked = self
                .repo
                .update(|state| {
                    let mut marked = 0;
                    for server in state.servers.iter_mut().filter(|s| s.sentence.is_live()) {
                        server.deployment_pending = true;
                        marked += 1;
                    }
                    state.deployment_request = Some(request.clone());
                    Ok(marked)
                })
                .await?;
            info!(revision = %request.revision_id, servers = marked, "Deployment requested");
            Ok(request)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Scale the fleet to zero and drive it there.
    pub async fn terminate_all(&self) -> Result<LoopOutcome> {
        async {
            self.require_cloud()?;
            let condemned = self
                .repo
                .update(|state| {
                    let spec = state.cloud_spec.as_mut().ok_or_else(|| {
                        FleetError::Configuration(
                            "no cloud spec has been applied to this fleet".to_string(),
                        )
                    })?;
                    spec.desired_count = 0;
                    let mut condemned = 0;
                    for server in state.servers.iter_mut().filter(|s| s.sentence.is_live()) {
                        server.sentence = Sentence::Die;
                        condemned += 1;
                    }
                    Ok(condemned)
                })
                .await?;
            info!(servers = condemned, "Terminating fleet");
            Ok::<(), FleetError>(())
        }
        .instrument(self.span.clone())
        .await?;

        self.roll_forward().await
    }

    /// Drive the fleet toward its desired state.
    pub async fn roll_forward(&self) -> Result<LoopOutcome> {
        let cloud = self.require_cloud()?;
        self.materialize_key_file().await?;

        let lifecycle = ServerLifecycle::new(
            self.fleet.clone(),
            cloud,
            self.connector.clone(),
            self.packages.clone(),
            self.agent_version.clone(),
            self.span.clone(),
        );
        let reconciliation = ReconciliationLoop::new(
            self.repo.clone(),
            lifecycle,
            self.clock.clone(),
            self.max_repeat_delay,
            self.span.clone(),
        );
        let outcome = reconciliation.roll_forward().await?;

        self.materialize_key_file().await?;
        Ok(outcome)
    }

    /// Fleet snapshot for display.
    pub async fn status(&self) -> Result<FleetStatus> {
        let state = self.repo.load().await?;

        let cloud_instances = match (&self.cloud, state.servers.is_empty()) {
            (Some(cloud), true) => match cloud.list_instances().instrument(self.span.clone()).await {
                Ok(instances) => Some(instances),
                Err(e) => {
                    warn!(fleet = %self.fleet, error = %e, "Could not list cloud instances");
                    None
                }
            },
            _ => None,
        };

        Ok(FleetStatus {
            fleet: self.fleet.clone(),
            cloud_spec: state.cloud_spec.clone(),
            servers: state
                .servers
                .iter()
                .map(|s| ServerStatus {
                    uuid: s.uuid,
                    instance_id: s.instance_id.clone(),
                    public_address: s.public_address.clone(),
                    instance_state: s.instance_state.clone(),
                    sentence: s.sentence,
                    deployment_pending: s.deployment_pending,
                })
                .collect(),
            failures: state
                .failures
                .iter()
                .map(|(action, record)| FailureStatus {
                    action: action.clone(),
                    count: record.count,
                    delay_secs: record.delay_secs,
                    last_failure_at: record.last_failure_at,
                    next_attempt_at: record.next_attempt_at(),
                    message: record.message.clone(),
                })
                .collect(),
            deployment_request: state.deployment_request.clone(),
            cloud_instances,
            document: redacted_document(&state)?,
        })
    }

    /// Write the stored private key to [`Orchestrator::key_file_path`] with
    /// mode 0600 unless the file already exists.
    ///
    /// Returns the path when a key is stored.
    pub async fn materialize_key_file(&self) -> Result<Option<PathBuf>> {
        let state = self.repo.load().await?;
        let Some(key) = state.ssh_key_material else {
            return Ok(None);
        };
        let path = self.key_file_path();
        if tokio::fs::try_exists(&path).await? {
            return Ok(Some(path));
        }
        write_private_file(&path, key.expose().as_bytes()).await?;
        info!(fleet = %self.fleet, path = %path.display(), "Wrote fleet key file");
        Ok(Some(path))
    }
}

async fn write_private_file(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(body).await?;
    file.flush().await?;
    Ok(())
}

fn redacted_document(state: &FleetState) -> Result<serde_json::Value> {
    let mut document: serde_json::Value = serde_json::from_slice(&encode(state)?)?;
    if let Some(key) = document.get_mut("ssh_key_material")
        && !key.is_null()
    {
        *key = serde_json::Value::String("<redacted>".to_string());
    }
    Ok(document)
}
