// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One reconciliation pass over the fleet.
//!
//! A pass first reconciles the live server count with the desired count. If
//! that changed the server list, the pass ends there so the new uuids are
//! persisted before any of them is used as a launch token.
//!
//! Otherwise every server is processed in list order:
//!
//! ```text
//! refresh instance state and address from the cloud list
//!   gone            -> sentence dead
//!   sentence dead   -> nothing
//!   sentence die    -> terminate, then wait for termination
//!   sentence live   -> initial-setup
//!                      running-state-and-address-required
//!                      privilege-check
//!                      version-check
//!                      install-agent       (when outdated)
//!                      apply-deployment    (when pending)
//! ```
//!
//! The first step that aborts ends that server's processing for this pass.
//! The remote channel is opened on demand and always closed before moving
//! on. Dead servers and their ledger entries are dropped at the end.

use std::sync::Arc;

use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::cloud::{CloudError, CloudProvider, InstanceInfo, LaunchRequest};
use crate::error::{ActionError, FleetError, Result};
use crate::model::{
    CloudSpec, DeploymentState, FleetState, InstanceState, KeyMaterial, Sentence, Server,
};
use crate::package::PackageSource;
use crate::remote::{RemoteChannel, RemoteConnector, shell_quote};
use crate::session::{Flow, Session};
use crate::version::InstalledVersion;

/// Where the agent binary is installed on servers.
pub const AGENT_INSTALL_PATH: &str = "/usr/local/bin/flotilla";

const PRIVILEGE_PROBE: &str = "echo ok";
const VERSION_PROBE: &str = "flotilla print-version || echo NONE";

/// Name of the fleet's cloud keypair.
pub fn keypair_name(fleet: &str) -> String {
    format!("flotilla-{}", fleet)
}

/// What the scaling step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scaling {
    /// Live count already matched.
    Unchanged,
    /// This many fresh servers were appended.
    Added(usize),
    /// This many live servers were sentenced to die.
    Condemned(usize),
}

/// Bring the number of live servers to `desired`.
///
/// Scale-up appends fresh servers, which carry `deployment_pending` so an
/// open rollout reaches them too. Scale-down condemns the most recently
/// added live servers. Servers already sentenced are never revived.
pub fn scale(
    servers: &mut Vec<Server>,
    desired: usize,
    deployment_pending: bool,
    session: &mut Session,
) -> Scaling {
    let live = servers.iter().filter(|s| s.sentence.is_live()).count();

    if live < desired {
        let missing = desired - live;
        for _ in 0..missing {
            let server = Server {
                deployment_pending,
                ..Server::new()
            };
            info!(server = %server.uuid, "Adding server");
            servers.push(server);
        }
        session.mark_changed();
        return Scaling::Added(missing);
    }

    if live > desired {
        let excess = live - desired;
        for server in servers
            .iter_mut()
            .rev()
            .filter(|s| s.sentence.is_live())
            .take(excess)
        {
            info!(server = %server.uuid, "Sentencing server to die");
            server.sentence = Sentence::Die;
        }
        session.mark_changed();
        return Scaling::Condemned(excess);
    }

    Scaling::Unchanged
}

/// Drives servers through their lifecycle using the session.
#[derive(Clone)]
pub struct ServerLifecycle {
    fleet: String,
    cloud: Arc<dyn CloudProvider>,
    connector: Arc<dyn RemoteConnector>,
    packages: Arc<dyn PackageSource>,
    agent_version: String,
    span: Span,
}

impl ServerLifecycle {
    /// Lifecycle for `fleet`. `agent_version` is what servers must run;
    /// per-server log spans are children of `span`.
    pub fn new(
        fleet: impl Into<String>,
        cloud: Arc<dyn CloudProvider>,
        connector: Arc<dyn RemoteConnector>,
        packages: Arc<dyn PackageSource>,
        agent_version: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            fleet: fleet.into(),
            cloud,
            connector,
            packages,
            agent_version: agent_version.into(),
            span,
        }
    }

    /// Run one pass over `state`.
    ///
    /// Fails only for configuration errors; everything else is recorded in
    /// the session ledger.
    pub async fn run_pass(&self, state: &mut FleetState, session: &mut Session) -> Result<()> {
        let Some(spec) = state.cloud_spec.clone() else {
            return Err(FleetError::Configuration(
                "no cloud spec has been applied to this fleet".to_string(),
            ));
        };

        let desired = usize::try_from(spec.desired_count).unwrap_or(usize::MAX);
        let deploying = state
            .deployment_request
            .as_ref()
            .is_some_and(|r| r.state == DeploymentState::Pending);
        if scale(&mut state.servers, desired, deploying, session) != Scaling::Unchanged {
            return Ok(());
        }

        let cloud = self.cloud.clone();
        let listing = session
            .check("describe-instances", true, async move {
                cloud.list_instances().await.map_err(ActionError::from)
            })
            .await?;
        let Flow::Continue(Some(instances)) = listing else {
            return Ok(());
        };

        let FleetState {
            servers,
            ssh_key_material,
            ..
        } = &mut *state;
        for server in servers.iter_mut() {
            let span = info_span!(parent: &self.span, "server", server = %server.uuid);
            self.process_server(server, ssh_key_material, &spec, &instances, session)
                .instrument(span)
                .await?;
        }

        remove_dead(state, session);
        complete_deployment(state, desired);
        self.release_keypair(state, &spec, session).await
    }

    async fn process_server(
        &self,
        server: &mut Server,
        key: &mut Option<KeyMaterial>,
        spec: &CloudSpec,
        instances: &[InstanceInfo],
        session: &mut Session,
    ) -> Result<()> {
        let mut channel: Option<Box<dyn RemoteChannel>> = None;

        refresh(server, instances, session);
        let result = match server.sentence {
            Sentence::Dead => Ok(()),
            Sentence::Die => self.terminate(server, session).await,
            Sentence::Live => {
                self.configure(server, key, spec, session, &mut channel)
                    .await
            }
        };

        if let Some(mut open) = channel.take()
            && let Err(e) = open.close().await
        {
            warn!(error = %e, "Failed to close remote channel");
        }
        result
    }

    async fn terminate(&self, server: &mut Server, session: &mut Session) -> Result<()> {
        let Some(instance_id) = server.instance_id.clone() else {
            info!("Server was never launched, marking dead");
            server.sentence = Sentence::Dead;
            session.mark_changed();
            return Ok(());
        };

        let needed = !server
            .instance_state
            .as_ref()
            .is_some_and(InstanceState::is_terminating);
        let cloud = self.cloud.clone();
        let target = instance_id.clone();
        let flow = session
            .action(&server.action_name("terminate"), needed, async move {
                cloud
                    .terminate_instance(&target)
                    .await
                    .map_err(ActionError::from)
            })
            .await?;
        let Flow::Continue(ran) = flow else {
            return Ok(());
        };
        if ran {
            info!(instance_id = %instance_id, "Termination requested");
            server.instance_state = Some(InstanceState::ShuttingDown);
        }

        let observed = server.instance_state.clone();
        session
            .check(
                &server.action_name("termination-confirmed"),
                true,
                async move {
                    match observed {
                        Some(state) if state.is_gone() => Ok(()),
                        Some(state) => Err(ActionError::delay(format!(
                            "Instance {} is still {}",
                            instance_id, state
                        ))),
                        None => Err(ActionError::delay(format!(
                            "Instance {} state not known yet",
                            instance_id
                        ))),
                    }
                },
            )
            .await?;
        Ok(())
    }

    async fn configure(
        &self,
        server: &mut Server,
        key: &mut Option<KeyMaterial>,
        spec: &CloudSpec,
        session: &mut Session,
        channel: &mut Option<Box<dyn RemoteChannel>>,
    ) -> Result<()> {
        let name = server.action_name("initial-setup");
        let needed = server.instance_id.is_none();
        let flow = session
            .action(&name, needed, self.initial_setup(server, key, spec))
            .await?;
        if flow.is_abort() {
            return Ok(());
        }

        let name = server.action_name("running-state-and-address-required");
        let observed = server.instance_state.clone();
        let address = server.public_address.clone();
        let flow = session
            .check(&name, true, async move {
                match (observed, address) {
                    (Some(InstanceState::Running), Some(address)) => Ok(address),
                    (Some(InstanceState::Running), None) => {
                        Err(ActionError::delay("No IP address assigned yet"))
                    }
                    (Some(state), _) => Err(ActionError::delay(format!(
                        "Instance is {}, waiting for running",
                        state
                    ))),
                    (None, _) => Err(ActionError::delay("Instance state not known yet")),
                }
            })
            .await?;
        let Flow::Continue(Some(address)) = flow else {
            return Ok(());
        };

        let user = spec.remote_user.as_str();
        let name = server.action_name("privilege-check");
        let flow = session
            .check(
                &name,
                true,
                self.privilege_check(channel, &address, user, key.as_ref()),
            )
            .await?;
        if flow.is_abort() {
            return Ok(());
        }

        let name = server.action_name("version-check");
        let flow = session
            .check(
                &name,
                true,
                self.version_is_current(channel, &address, user, key.as_ref()),
            )
            .await?;
        let Flow::Continue(up_to_date) = flow else {
            return Ok(());
        };
        let up_to_date = up_to_date.unwrap_or(false);

        let name = server.action_name("install-agent");
        let flow = session
            .action(
                &name,
                !up_to_date,
                self.install_agent(channel, &address, user, key.as_ref(), spec),
            )
            .await?;
        if flow.is_abort() {
            return Ok(());
        }

        let name = server.action_name("apply-deployment");
        let needed = server.deployment_pending;
        session
            .action(&name, needed, async {
                server.deployment_pending = false;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn initial_setup(
        &self,
        server: &mut Server,
        key: &mut Option<KeyMaterial>,
        spec: &CloudSpec,
    ) -> std::result::Result<(), ActionError> {
        spec.require_launch_fields()?;

        let key_name = keypair_name(&self.fleet);
        if key.is_none() {
            if let Err(e) = self.cloud.delete_keypair(&key_name).await {
                debug!(keypair = %key_name, error = %e, "No stale keypair removed");
            }
            let pair = self.cloud.create_keypair(&key_name).await?;
            info!(keypair = %key_name, "Created fleet keypair");
            *key = Some(KeyMaterial::new(pair.material));
        }

        let launched = self
            .cloud
            .launch_instance(&LaunchRequest {
                image_id: spec.image_id.clone(),
                instance_type: spec.instance_type.clone(),
                key_name,
                client_token: server.uuid.to_string(),
            })
            .await?;
        info!(instance_id = %launched.instance_id, "Launched instance");

        server.instance_id = Some(launched.instance_id);
        server.public_address = launched.public_address;
        server.instance_state = Some(InstanceState::Pending);
        Ok(())
    }

    async fn open_channel<'a>(
        &self,
        slot: &'a mut Option<Box<dyn RemoteChannel>>,
        address: &str,
        user: &str,
        key: Option<&KeyMaterial>,
    ) -> std::result::Result<&'a mut Box<dyn RemoteChannel>, ActionError> {
        if slot.is_none() {
            let key = key.ok_or_else(|| {
                ActionError::unexpected("No SSH key material stored for this fleet")
            })?;
            let opened = self.connector.connect(address, user, key).await?;
            *slot = Some(opened);
        }
        slot.as_mut()
            .ok_or_else(|| ActionError::unexpected("Remote channel unavailable"))
    }

    async fn privilege_check(
        &self,
        slot: &mut Option<Box<dyn RemoteChannel>>,
        address: &str,
        user: &str,
        key: Option<&KeyMaterial>,
    ) -> std::result::Result<(), ActionError> {
        let remote = self.open_channel(slot, address, user, key).await?;
        let output = remote.run_privileged(PRIVILEGE_PROBE).await?;
        if last_line(&output) == "ok" {
            Ok(())
        } else {
            Err(ActionError::unexpected(format!(
                "sudo does not work on {}",
                address
            )))
        }
    }

    async fn version_is_current(
        &self,
        slot: &mut Option<Box<dyn RemoteChannel>>,
        address: &str,
        user: &str,
        key: Option<&KeyMaterial>,
    ) -> std::result::Result<bool, ActionError> {
        let remote = self.open_channel(slot, address, user, key).await?;
        let installed = read_version(remote).await?;
        let current = installed.satisfies(&self.agent_version);
        debug!(installed = ?installed, required = %self.agent_version, current, "Agent version");
        Ok(current)
    }

    async fn install_agent(
        &self,
        slot: &mut Option<Box<dyn RemoteChannel>>,
        address: &str,
        user: &str,
        key: Option<&KeyMaterial>,
        spec: &CloudSpec,
    ) -> std::result::Result<(), ActionError> {
        let remote = self.open_channel(slot, address, user, key).await?;

        let prerequisites = spec.prerequisite_packages();
        if !prerequisites.is_empty() {
            info!(packages = %prerequisites.join(" "), "Installing prerequisites");
            remote
                .run_privileged(&spec.package_manager.install_command(&prerequisites))
                .await?;
        }

        let package = self.packages.package().await?;
        let staged = format!("/tmp/{}", package.file_name);
        remote.upload_file(&staged, &package.bytes).await?;
        remote
            .run_privileged(&format!(
                "install -m 0755 {} {}",
                shell_quote(&staged),
                AGENT_INSTALL_PATH
            ))
            .await?;

        match read_version(remote).await? {
            InstalledVersion::Found(version) if version == self.agent_version => {
                info!(version = %version, "Agent installed");
                Ok(())
            }
            InstalledVersion::Found(version) => Err(ActionError::unexpected(format!(
                "Agent version mismatch after install on {}: expected {}, found {}",
                address, self.agent_version, version
            ))),
            InstalledVersion::Missing => Err(ActionError::unexpected(format!(
                "Agent not found after install on {}",
                address
            ))),
        }
    }

    async fn release_keypair(
        &self,
        state: &mut FleetState,
        spec: &CloudSpec,
        session: &mut Session,
    ) -> Result<()> {
        let needed = spec.desired_count == 0
            && state.servers.is_empty()
            && state.ssh_key_material.is_some();
        let name = keypair_name(&self.fleet);
        let cloud = self.cloud.clone();
        let flow = session
            .action("delete-keypair", needed, async move {
                match cloud.delete_keypair(&name).await {
                    Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
                    Err(e) => Err(ActionError::from(e)),
                }
            })
            .await?;
        if flow == Flow::Continue(true) {
            info!("Fleet scaled to zero, keypair deleted");
            state.ssh_key_material = None;
        }
        Ok(())
    }
}

fn refresh(server: &mut Server, instances: &[InstanceInfo], session: &mut Session) {
    let Some(instance_id) = server.instance_id.as_deref() else {
        return;
    };
    let found = instances.iter().find(|i| i.instance_id == instance_id);
    let observed = found.map_or(InstanceState::DoesNotExist, InstanceInfo::instance_state);
    if server.instance_state.as_ref() != Some(&observed) {
        debug!(instance_id = %instance_id, state = %observed, "Instance state changed");
    }

    if observed.is_gone() {
        if server.sentence != Sentence::Dead {
            info!(instance_id = %instance_id, state = %observed, "Instance is gone, marking server dead");
            server.sentence = Sentence::Dead;
            session.mark_changed();
        }
        server.instance_state = Some(observed);
        return;
    }

    // A lagging listing must not undo a termination already requested.
    let terminating = server.sentence == Sentence::Die
        && server
            .instance_state
            .as_ref()
            .is_some_and(InstanceState::is_terminating);
    if !terminating {
        server.instance_state = Some(observed);
    }
    if let Some(info) = found {
        server.public_address = info.public_address.clone();
    }
}

fn remove_dead(state: &mut FleetState, session: &mut Session) {
    let (dead, kept): (Vec<Server>, Vec<Server>) = std::mem::take(&mut state.servers)
        .into_iter()
        .partition(|s| s.sentence == Sentence::Dead);
    for server in &dead {
        info!(server = %server.uuid, instance_id = ?server.instance_id, "Removing dead server");
        session.forget_prefix(&format!("{}-", server.uuid));
    }
    state.servers = kept;
}

/// A request completes once the fleet is at full strength and every live
/// server has applied it. An empty fleet never completes a request.
fn complete_deployment(state: &mut FleetState, desired: usize) {
    let live: Vec<&Server> = state
        .servers
        .iter()
        .filter(|s| s.sentence.is_live())
        .collect();
    let applied = !live.is_empty()
        && live.len() >= desired
        && live.iter().all(|s| !s.deployment_pending);
    if let Some(request) = state.deployment_request.as_mut()
        && request.state == DeploymentState::Pending
        && applied
    {
        info!(revision = %request.revision_id, "Deployment applied on every live server");
        request.state = DeploymentState::Completed;
    }
}

async fn read_version(
    remote: &mut Box<dyn RemoteChannel>,
) -> std::result::Result<InstalledVersion, ActionError> {
    let output = remote.run_privileged(VERSION_PROBE).await?;
    Ok(InstalledVersion::parse(last_line(&output)))
}

fn last_line(output: &str) -> &str {
    output
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::cloud::MockCloud;
    use crate::model::{DeploymentRequest, FailureLedger};
    use crate::package::StaticPackageSource;
    use crate::remote::MockConnector;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap())
    }

    fn session(clock: &ManualClock) -> Session {
        Session::new(FailureLedger::new(), Arc::new(clock.clone()))
    }

    fn spec(count: u32) -> CloudSpec {
        CloudSpec {
            instance_type: "t3.micro".to_string(),
            image_id: "ami-0123".to_string(),
            desired_count: count,
            package_manager: Default::default(),
            remote_user: "ec2-user".to_string(),
            prerequisites: None,
        }
    }

    fn lifecycle(cloud: &MockCloud, connector: &MockConnector) -> ServerLifecycle {
        ServerLifecycle::new(
            "web",
            Arc::new(cloud.clone()),
            Arc::new(connector.clone()),
            Arc::new(StaticPackageSource::new("flotilla", b"agent".to_vec())),
            crate::VERSION,
            Span::none(),
        )
    }

    #[test]
    fn test_scale_up_appends_unique_servers() {
        let clock = clock();
        let mut session = session(&clock);
        let mut servers = vec![Server::new()];

        let change = scale(&mut servers, 4, false, &mut session);

        assert_eq!(change, Scaling::Added(3));
        assert_eq!(servers.len(), 4);
        let uuids: HashSet<_> = servers.iter().map(|s| s.uuid).collect();
        assert_eq!(uuids.len(), 4);
        assert!(servers[1..].iter().all(|s| s.instance_id.is_none()));
        assert!(session.any_actions_executed());
    }

    #[test]
    fn test_scale_down_condemns_newest_live() {
        let clock = clock();
        let mut session = session(&clock);
        let mut servers = vec![Server::new(), Server::new(), Server::new()];
        servers.push(Server {
            sentence: Sentence::Die,
            ..Server::new()
        });

        let change = scale(&mut servers, 1, false, &mut session);

        assert_eq!(change, Scaling::Condemned(2));
        let sentences: Vec<_> = servers.iter().map(|s| s.sentence).collect();
        assert_eq!(
            sentences,
            vec![Sentence::Live, Sentence::Die, Sentence::Die, Sentence::Die]
        );
    }

    #[test]
    fn test_scale_ignores_condemned_servers_when_counting() {
        let clock = clock();
        let mut session = session(&clock);
        let mut servers = vec![Server {
            sentence: Sentence::Die,
            ..Server::new()
        }];

        let change = scale(&mut servers, 1, false, &mut session);

        assert_eq!(change, Scaling::Added(1));
        assert_eq!(servers[0].sentence, Sentence::Die);
        assert_eq!(servers[1].sentence, Sentence::Live);
    }

    #[test]
    fn test_scale_unchanged() {
        let clock = clock();
        let mut session = session(&clock);
        let mut servers = vec![Server::new()];

        assert_eq!(scale(&mut servers, 1, false, &mut session), Scaling::Unchanged);
        assert!(!session.any_actions_executed());
    }

    #[tokio::test]
    async fn test_scale_up_pass_does_not_launch() {
        let clock = clock();
        let cloud = MockCloud::new();
        let connector = MockConnector::new();
        let mut state = FleetState {
            cloud_spec: Some(spec(2)),
            ..FleetState::default()
        };
        let mut session = session(&clock);

        lifecycle(&cloud, &connector)
            .run_pass(&mut state, &mut session)
            .await
            .unwrap();

        assert_eq!(state.servers.len(), 2);
        assert!(state.servers.iter().all(|s| s.instance_id.is_none()));
        assert!(state.servers.iter().all(|s| s.sentence == Sentence::Live));
        assert!(session.any_actions_executed());
        assert!(session.next_attempt().is_none());
        assert_eq!(cloud.launch_calls().await, 0);
    }

    #[tokio::test]
    async fn test_missing_spec_is_configuration_error() {
        let clock = clock();
        let mut state = FleetState::default();
        let mut session = session(&clock);

        let result = lifecycle(&MockCloud::new(), &MockConnector::new())
            .run_pass(&mut state, &mut session)
            .await;

        assert!(matches!(result, Err(FleetError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_full_provisioning_pass() {
        let clock = clock();
        let cloud = MockCloud::new();
        let connector = MockConnector::new();
        let lifecycle = lifecycle(&cloud, &connector);
        let mut state = FleetState {
            cloud_spec: Some(spec(1)),
            servers: vec![Server::new()],
            ..FleetState::default()
        };

        // Launch; the instance is not known to be running until the next refresh.
        let mut first = session(&clock);
        lifecycle.run_pass(&mut state, &mut first).await.unwrap();
        assert!(state.servers[0].instance_id.is_some());
        assert!(state.ssh_key_material.is_some());
        assert!(first.any_actions_executed());
        clock.advance_secs(1);

        let mut second = Session::new(first.into_failures(), Arc::new(clock.clone()));
        lifecycle.run_pass(&mut state, &mut second).await.unwrap();

        let address = state.servers[0].public_address.clone().unwrap();
        assert_eq!(connector.installed(&address).await.as_deref(), Some(crate::VERSION));
        assert_eq!(connector.uploads().await[0].1, "/tmp/flotilla");
        assert!(second.failures().is_empty());
        assert_eq!(connector.connects().await, connector.closes().await);
        assert_eq!(cloud.keypairs().await, vec!["flotilla-web".to_string()]);
    }

    #[tokio::test]
    async fn test_broken_sudo_records_failure_and_closes_channel() {
        let clock = clock();
        let cloud = MockCloud::new();
        let connector = MockConnector::broken_sudo();
        let lifecycle = lifecycle(&cloud, &connector);
        let launched = cloud
            .launch_instance(&LaunchRequest {
                image_id: "ami".into(),
                instance_type: "t".into(),
                key_name: "k".into(),
                client_token: "tok".into(),
            })
            .await
            .unwrap();
        let server = Server {
            instance_id: Some(launched.instance_id),
            ..Server::new()
        };
        let name = server.action_name("privilege-check");
        let mut state = FleetState {
            cloud_spec: Some(spec(1)),
            servers: vec![server],
            ssh_key_material: Some(KeyMaterial::new("k")),
            ..FleetState::default()
        };
        let mut session = session(&clock);

        lifecycle.run_pass(&mut state, &mut session).await.unwrap();

        assert_eq!(session.failures()[&name].count, 1);
        assert!(session.failures()[&name].message.contains("password"));
        assert_eq!(connector.closes().await, 1);
        assert!(!session.any_actions_executed());
    }

    #[tokio::test]
    async fn test_missing_instance_marks_dead_and_removes() {
        let clock = clock();
        let cloud = MockCloud::new();
        let connector = MockConnector::new();
        let server = Server {
            instance_id: Some("i-vanished".to_string()),
            ..Server::new()
        };
        let uuid = server.uuid;
        let mut failures = FailureLedger::new();
        failures.insert(
            server.action_name("privilege-check"),
            crate::model::FailureRecord {
                first_failure_at: clock.now(),
                last_failure_at: clock.now(),
                count: 1,
                delay_secs: 1,
                message: "x".into(),
            },
        );
        let mut state = FleetState {
            cloud_spec: Some(spec(1)),
            servers: vec![server],
            ..FleetState::default()
        };
        let mut session = Session::new(failures, Arc::new(clock.clone()));

        lifecycle(&cloud, &connector)
            .run_pass(&mut state, &mut session)
            .await
            .unwrap();

        assert!(state.server(uuid).is_none());
        assert!(session.failures().is_empty());
        assert!(session.any_actions_executed());
    }

    fn pending_request(clock: &ManualClock) -> Option<DeploymentRequest> {
        Some(DeploymentRequest {
            revision_id: "f".repeat(40),
            requested_at: clock.now(),
            state: DeploymentState::Pending,
        })
    }

    #[test]
    fn test_scale_up_during_rollout_marks_new_servers_pending() {
        let clock = clock();
        let mut session = session(&clock);
        let mut servers = vec![Server::new()];

        scale(&mut servers, 3, true, &mut session);

        assert!(!servers[0].deployment_pending);
        assert!(servers[1..].iter().all(|s| s.deployment_pending));
    }

    #[test]
    fn test_deployment_completes_when_every_live_server_applied() {
        let clock = clock();
        let mut state = FleetState {
            servers: vec![
                Server::new(),
                Server {
                    sentence: Sentence::Die,
                    deployment_pending: true,
                    ..Server::new()
                },
            ],
            deployment_request: pending_request(&clock),
            ..FleetState::default()
        };

        complete_deployment(&mut state, 1);

        assert_eq!(
            state.deployment_request.unwrap().state,
            DeploymentState::Completed
        );
    }

    #[test]
    fn test_deployment_stays_pending_without_live_servers() {
        let clock = clock();
        let mut state = FleetState {
            deployment_request: pending_request(&clock),
            ..FleetState::default()
        };

        complete_deployment(&mut state, 0);

        assert_eq!(
            state.deployment_request.unwrap().state,
            DeploymentState::Pending
        );
    }

    #[test]
    fn test_deployment_stays_pending_below_desired_count() {
        let clock = clock();
        let mut state = FleetState {
            servers: vec![Server::new()],
            deployment_request: pending_request(&clock),
            ..FleetState::default()
        };

        complete_deployment(&mut state, 2);

        assert_eq!(
            state.deployment_request.unwrap().state,
            DeploymentState::Pending
        );
    }

    #[tokio::test]
    async fn test_lagging_listing_does_not_repeat_terminate() {
        let clock = clock();
        let cloud = MockCloud::slow();
        let connector = MockConnector::new();
        let lifecycle = lifecycle(&cloud, &connector);
        let launched = cloud
            .launch_instance(&LaunchRequest {
                image_id: "ami".into(),
                instance_type: "t".into(),
                key_name: "k".into(),
                client_token: "tok".into(),
            })
            .await
            .unwrap();
        let instance_id = launched.instance_id;
        cloud.set_state(&instance_id, "running", Some("198.51.100.9")).await;
        let mut state = FleetState {
            cloud_spec: Some(spec(0)),
            servers: vec![Server {
                instance_id: Some(instance_id.clone()),
                sentence: Sentence::Die,
                ..Server::new()
            }],
            ..FleetState::default()
        };

        let mut first = session(&clock);
        lifecycle.run_pass(&mut state, &mut first).await.unwrap();
        assert!(first.any_actions_executed());

        // The provider still reports the instance as running.
        cloud.set_state(&instance_id, "running", None).await;
        clock.advance_secs(1);
        let mut second = Session::new(first.into_failures(), Arc::new(clock.clone()));
        lifecycle.run_pass(&mut state, &mut second).await.unwrap();

        assert_eq!(cloud.terminate_calls().await, vec![instance_id]);
        assert!(!second.any_actions_executed());
        assert_eq!(
            state.servers[0].instance_state,
            Some(InstanceState::ShuttingDown)
        );
        assert!(second.next_attempt().is_some());
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("ok\r\n"), "ok");
        assert_eq!(last_line("[sudo] warning\r\n0.4.2\r\n\r\n"), "0.4.2");
        assert_eq!(last_line(""), "");
    }
}
