// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flotilla CLI
//!
//! Usage:
//!
//! ```text
//! flotilla [--fleet <name>] status
//! flotilla [--fleet <name>] apply <cloud-spec.yml>
//! flotilla [--fleet <name>] deploy <git-ref>
//! flotilla [--fleet <name>] terminate
//! flotilla [--fleet <name>] roll-forward
//! flotilla print-version
//! ```
//!
//! Settings come from `FLOTILLA_*` environment variables (a `.env` file is
//! honoured) and from the nearest `cloud-access.yml`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::debug;

use flotilla_core::cloud::{CloudProvider, HttpCloudProvider};
use flotilla_core::package::{LocalPackageSource, PackageSource};
use flotilla_core::{ConfigError, Orchestrator, OrchestratorConfig, store};

mod access;
mod git;
mod output;
mod spec_file;

use access::{AccessError, CloudAccess};

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Keep a fleet of cloud servers at its desired state", long_about = None)]
#[command(version)]
struct Cli {
    /// Fleet to operate on
    #[arg(long, global = true, env = "FLOTILLA_FLEET")]
    fleet: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show servers, pending retries and the stored document
    Status,

    /// Store a new desired cloud spec
    Apply {
        /// YAML cloud spec file
        spec: PathBuf,
    },

    /// Request a rollout of a git revision
    Deploy {
        /// Branch, tag or commit
        git_ref: String,
    },

    /// Scale to zero and terminate every server
    Terminate,

    /// Drive the fleet toward its desired state
    RollForward,

    /// Print this build's version
    PrintVersion,
}

impl Command {
    fn needs_cloud(&self) -> bool {
        matches!(self, Command::Terminate | Command::RollForward)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (from the working directory or its parents)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Remote version probes parse stdout, keep it clean
    if let Command::PrintVersion = cli.command {
        println!("{}", flotilla_core::VERSION);
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flotilla=info,flotilla_core=info".into()),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = OrchestratorConfig::from_env()?;
    let cwd = std::env::current_dir().context("cannot determine working directory")?;

    let access = match access::discover(&cwd) {
        Ok(access) => {
            debug!(path = %access.path.display(), "Using access file");
            Some(access)
        }
        Err(e) if cli.command.needs_cloud() => return Err(e.into()),
        Err(AccessError::NotFound { .. }) => None,
        Err(e) => {
            debug!(error = %e, "Continuing without cloud access");
            None
        }
    };

    let fleet = cli
        .fleet
        .clone()
        .or_else(|| config.fleet.clone())
        .or_else(|| access.as_ref().and_then(|a| a.fleet.clone()))
        .ok_or_else(|| {
            anyhow!("no fleet name: pass --fleet, set FLOTILLA_FLEET or add `fleet:` to cloud-access.yml")
        })?;

    let orchestrator = build_orchestrator(&config, &fleet, access.as_ref(), &cli.command).await?;

    match cli.command {
        Command::Status => {
            let status = orchestrator.status().await?;
            print!("{}", output::render_status(&status));
            println!("\nDocument:");
            println!("{}", serde_json::to_string_pretty(&status.document)?);
        }
        Command::Apply { spec } => {
            let spec = spec_file::load(&spec)?;
            let desired = spec.desired_count;
            orchestrator.apply_desired_spec(spec).await?;
            println!(
                "Applied spec to fleet {}: {} server(s). Run roll-forward to act on it.",
                fleet, desired
            );
        }
        Command::Deploy { git_ref } => {
            let revision = git::rev_parse(&cwd, &git_ref).await?;
            let request = orchestrator.request_deployment(&revision).await?;
            println!(
                "Requested deployment of {} ({}). Run roll-forward to apply it.",
                request.revision_id, git_ref
            );
        }
        Command::Terminate => {
            let outcome = orchestrator.terminate_all().await?;
            println!("{}", output::render_outcome(&outcome));
        }
        Command::RollForward => {
            let outcome = orchestrator.roll_forward().await?;
            println!("{}", output::render_outcome(&outcome));
        }
        Command::PrintVersion => println!("{}", flotilla_core::VERSION),
    }
    Ok(())
}

async fn build_orchestrator(
    config: &OrchestratorConfig,
    fleet: &str,
    access: Option<&CloudAccess>,
    command: &Command,
) -> Result<Orchestrator> {
    let store = store::open(&config.state_url)
        .await
        .with_context(|| format!("cannot open state store {}", config.state_url))?;

    let endpoint = config
        .cloud_endpoint
        .clone()
        .or_else(|| access.and_then(|a| a.endpoint.clone()));
    let cloud: Option<Arc<dyn CloudProvider>> = match (access, endpoint) {
        (Some(access), Some(endpoint)) => Some(Arc::new(HttpCloudProvider::new(
            endpoint,
            access.credentials.clone(),
        )?)),
        (_, None) if command.needs_cloud() => {
            return Err(ConfigError::Missing("FLOTILLA_CLOUD_ENDPOINT").into());
        }
        _ => None,
    };

    let mut builder = Orchestrator::builder()
        .fleet(fleet)
        .store(store)
        .packages(package_source(config)?)
        .max_repeat_delay(config.max_repeat_delay)
        .key_dir(&config.key_dir);
    if let Some(cloud) = cloud {
        builder = builder.cloud(cloud);
    }
    Ok(builder.build()?)
}

fn package_source(config: &OrchestratorConfig) -> Result<Arc<dyn PackageSource>> {
    let source = match config.agent_package.as_deref() {
        Some(path) => LocalPackageSource::new(path),
        None => LocalPackageSource::current_exe()?,
    };
    let source = match &config.agent_build_command {
        Some(command) => source.with_build_command(command.clone()),
        None => source,
    };
    Ok(Arc::new(source))
}
