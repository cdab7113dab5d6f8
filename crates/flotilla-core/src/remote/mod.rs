// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote command and file transfer seam.
//!
//! A [`RemoteConnector`] opens a [`RemoteChannel`] to one server. The engine
//! opens at most one channel per server per pass and always closes it when it
//! is done with that server.

pub mod mock;
pub mod ssh;

pub use self::mock::MockConnector;
pub use self::ssh::SshConnector;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::KeyMaterial;

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors from remote channels.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// TCP connection or handshake failed.
    #[error("Failed to connect: {0}")]
    Connect(String),

    /// The server refused our key.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A command ran and exited unsuccessfully.
    #[error("Command `{command}` exited with {exit_code}: {output}")]
    CommandFailed {
        /// The command as given to `run_privileged`.
        command: String,
        /// Exit status.
        exit_code: i32,
        /// Combined output.
        output: String,
    },

    /// File upload failed.
    #[error("Upload to {path} failed: {details}")]
    Upload {
        /// Remote path.
        path: String,
        /// What went wrong.
        details: String,
    },

    /// Transport failure in the middle of a call.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The channel was already closed.
    #[error("Channel is closed")]
    Closed,
}

/// Opens channels to servers.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect to `address` as `user`, authenticating with `key`.
    async fn connect(
        &self,
        address: &str,
        user: &str,
        key: &KeyMaterial,
    ) -> Result<Box<dyn RemoteChannel>>;
}

/// An open channel to one server.
#[async_trait]
pub trait RemoteChannel: Send {
    /// Run `command` as root through a non-interactive shell and return the
    /// combined output. Blocks until the command completes.
    async fn run_privileged(&mut self, command: &str) -> Result<String>;

    /// Write `bytes` to `remote_path` as the login user.
    async fn upload_file(&mut self, remote_path: &str, bytes: &[u8]) -> Result<()>;

    /// Close the channel. Further calls fail with [`RemoteError::Closed`].
    async fn close(&mut self) -> Result<()>;
}

/// Quote `text` as a single POSIX shell word.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r#"'"'"'"#))
}

/// The shell line that runs `command` as root without prompting.
pub fn privileged_command_line(command: &str) -> String {
    format!("sudo -n -- sh -c {}", shell_quote(command))
}
