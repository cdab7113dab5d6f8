// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent package production.
//!
//! The install step asks a [`PackageSource`] for the agent artifact and
//! uploads it to each server that reports an outdated version.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors from producing the package.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PackageError {
    /// The build command could not be started.
    #[error("Failed to run build command `{command}`: {details}")]
    BuildSpawn {
        /// Command line.
        command: String,
        /// OS error.
        details: String,
    },

    /// The build command exited unsuccessfully.
    #[error("Build command `{command}` exited with {status}: {stderr}")]
    BuildFailed {
        /// Command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The artifact could not be read.
    #[error("Failed to read package {path}: {source}")]
    Read {
        /// Artifact path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No artifact path was configured and none could be derived.
    #[error("No agent package configured: {0}")]
    NotConfigured(String),
}

/// Result type for package operations.
pub type Result<T> = std::result::Result<T, PackageError>;

/// An artifact ready for upload.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentPackage {
    /// File name used for the upload target under `/tmp`.
    pub file_name: String,
    /// Artifact contents.
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for AgentPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPackage")
            .field("file_name", &self.file_name)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Produces the agent artifact.
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Build (if needed) and return the artifact.
    async fn package(&self) -> Result<AgentPackage>;
}

/// Reads the artifact from the local filesystem, optionally rebuilding it.
#[derive(Debug, Clone)]
pub struct LocalPackageSource {
    artifact: PathBuf,
    build_command: Option<String>,
}

impl LocalPackageSource {
    /// Upload `artifact` as is.
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
            build_command: None,
        }
    }

    /// Upload the running executable.
    pub fn current_exe() -> Result<Self> {
        let path = std::env::current_exe()
            .map_err(|e| PackageError::NotConfigured(format!("current executable: {}", e)))?;
        Ok(Self::new(path))
    }

    /// Run `command` through `sh -c` before reading the artifact.
    pub fn with_build_command(mut self, command: impl Into<String>) -> Self {
        self.build_command = Some(command.into());
        self
    }

    /// Artifact path.
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    async fn build(&self, command: &str) -> Result<()> {
        info!(command = %command, "Building agent package");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| PackageError::BuildSpawn {
                command: command.to_string(),
                details: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(PackageError::BuildFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PackageSource for LocalPackageSource {
    async fn package(&self) -> Result<AgentPackage> {
        if let Some(command) = &self.build_command {
            self.build(command).await?;
        }
        let bytes = tokio::fs::read(&self.artifact)
            .await
            .map_err(|source| PackageError::Read {
                path: self.artifact.clone(),
                source,
            })?;
        let file_name = self
            .artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flotilla".to_string());
        debug!(file = %file_name, bytes = bytes.len(), "Agent package ready");
        Ok(AgentPackage { file_name, bytes })
    }
}

/// Fixed in-memory artifact, for tests.
#[derive(Debug, Clone)]
pub struct StaticPackageSource {
    package: AgentPackage,
}

impl StaticPackageSource {
    /// Always return `bytes` under `file_name`.
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            package: AgentPackage {
                file_name: file_name.into(),
                bytes: bytes.into(),
            },
        }
    }
}

#[async_trait]
impl PackageSource for StaticPackageSource {
    async fn package(&self) -> Result<AgentPackage> {
        Ok(self.package.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_package_reads_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flotilla-agent");
        std::fs::write(&path, b"\x7fELF").unwrap();

        let package = LocalPackageSource::new(&path).package().await.unwrap();

        assert_eq!(package.file_name, "flotilla-agent");
        assert_eq!(package.bytes, b"\x7fELF");
    }

    #[tokio::test]
    async fn test_build_command_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("built");
        let command = format!("printf built > '{}'", path.display());

        let package = LocalPackageSource::new(&path)
            .with_build_command(command)
            .package()
            .await
            .unwrap();

        assert_eq!(package.bytes, b"built");
    }

    #[tokio::test]
    async fn test_failing_build_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let source =
            LocalPackageSource::new(dir.path().join("x")).with_build_command("echo nope >&2; exit 3");

        let err = source.package().await.unwrap_err();

        match err {
            PackageError::BuildFailed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let source = LocalPackageSource::new("/nonexistent/flotilla");
        assert!(matches!(
            source.package().await,
            Err(PackageError::Read { .. })
        ));
    }
}
