// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH channel built on libssh2.
//!
//! libssh2 is blocking, so every call runs on the blocking pool with its own
//! handle to the shared session.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tracing::debug;

use super::{RemoteChannel, RemoteConnector, RemoteError, Result, privileged_command_line};
use crate::model::KeyMaterial;

const SSH_PORT: u16 = 22;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects over SSH with the fleet's private key.
#[derive(Debug, Clone)]
pub struct SshConnector {
    port: u16,
    /// Per-call timeout in milliseconds; 0 waits forever.
    call_timeout_ms: u32,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SshConnector {
    /// Connector for the standard SSH port with no call timeout, since agent
    /// builds can take minutes.
    pub fn new() -> Self {
        Self {
            port: SSH_PORT,
            call_timeout_ms: 0,
        }
    }

    /// Use a different port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Limit each blocking call to `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self
    }
}

fn open_session(
    address: &str,
    port: u16,
    user: &str,
    key: &str,
    call_timeout_ms: u32,
) -> Result<Session> {
    let socket = (address, port)
        .to_socket_addrs()
        .map_err(|e| RemoteError::Connect(format!("Failed to resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| RemoteError::Connect(format!("No address found for {}", address)))?;

    let tcp = TcpStream::connect_timeout(&socket, CONNECT_TIMEOUT)
        .map_err(|e| RemoteError::Connect(format!("Failed to connect to {}: {}", socket, e)))?;

    let mut session = Session::new()
        .map_err(|e| RemoteError::Connect(format!("Failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(call_timeout_ms);
    session
        .handshake()
        .map_err(|e| RemoteError::Connect(format!("SSH handshake failed: {}", e)))?;

    session
        .userauth_pubkey_memory(user, None, key, None)
        .map_err(|e| RemoteError::Auth(format!("Private key authentication failed: {}", e)))?;
    if !session.authenticated() {
        return Err(RemoteError::Auth("SSH authentication failed".to_string()));
    }
    Ok(session)
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        address: &str,
        user: &str,
        key: &KeyMaterial,
    ) -> Result<Box<dyn RemoteChannel>> {
        let (host, port, login, material, timeout) = (
            address.to_string(),
            self.port,
            user.to_string(),
            key.expose().to_string(),
            self.call_timeout_ms,
        );
        let session = tokio::task::spawn_blocking(move || {
            open_session(&host, port, &login, &material, timeout)
        })
        .await
        .map_err(|e| RemoteError::Connect(format!("Connect task failed: {}", e)))??;

        debug!(address = %address, user = %user, "SSH channel open");
        Ok(Box::new(SshChannel {
            session: Some(session),
            address: address.to_string(),
        }))
    }
}

/// An authenticated SSH session.
pub struct SshChannel {
    session: Option<Session>,
    address: String,
}

impl SshChannel {
    fn session(&self) -> Result<Session> {
        self.session.clone().ok_or(RemoteError::Closed)
    }
}

fn exec(session: &Session, command: &str) -> Result<String> {
    let line = privileged_command_line(command);
    let channel_err = |e: ssh2::Error| RemoteError::Channel(e.to_string());

    let mut channel = session.channel_session().map_err(channel_err)?;
    // A pty merges stderr into stdout and satisfies `requiretty` sudoers.
    channel
        .request_pty("dumb", None, None)
        .map_err(channel_err)?;
    channel.exec(&line).map_err(channel_err)?;

    let mut output = String::new();
    channel
        .read_to_string(&mut output)
        .map_err(|e| RemoteError::Channel(e.to_string()))?;
    channel.wait_close().map_err(channel_err)?;
    let exit_code = channel.exit_status().map_err(channel_err)?;

    if exit_code != 0 {
        return Err(RemoteError::CommandFailed {
            command: command.to_string(),
            exit_code,
            output,
        });
    }
    Ok(output)
}

fn upload(session: &Session, remote_path: &str, bytes: &[u8]) -> Result<()> {
    let upload_err = |details: String| RemoteError::Upload {
        path: remote_path.to_string(),
        details,
    };
    let sftp = session
        .sftp()
        .map_err(|e| upload_err(format!("Failed to create SFTP session: {}", e)))?;
    let mut file = sftp
        .create(Path::new(remote_path))
        .map_err(|e| upload_err(format!("Failed to create file: {}", e)))?;
    file.write_all(bytes)
        .map_err(|e| upload_err(format!("Failed to write: {}", e)))?;
    Ok(())
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn run_privileged(&mut self, command: &str) -> Result<String> {
        let session = self.session()?;
        let owned = command.to_string();
        debug!(address = %self.address, command = %command, "Running privileged command");
        tokio::task::spawn_blocking(move || exec(&session, &owned))
            .await
            .map_err(|e| RemoteError::Channel(format!("Command task failed: {}", e)))?
    }

    async fn upload_file(&mut self, remote_path: &str, bytes: &[u8]) -> Result<()> {
        let session = self.session()?;
        let (path, body) = (remote_path.to_string(), bytes.to_vec());
        debug!(address = %self.address, path = %remote_path, bytes = bytes.len(), "Uploading file");
        tokio::task::spawn_blocking(move || upload(&session, &path, &body))
            .await
            .map_err(|e| RemoteError::Channel(format!("Upload task failed: {}", e)))?
    }

    async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        debug!(address = %self.address, "Closing SSH channel");
        tokio::task::spawn_blocking(move || {
            session
                .disconnect(None, "flotilla done", None)
                .map_err(|e| RemoteError::Channel(e.to_string()))
        })
        .await
        .map_err(|e| RemoteError::Channel(format!("Close task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let connector = SshConnector::new()
            .with_port(2222)
            .with_call_timeout(Duration::from_secs(5));
        assert_eq!(connector.port, 2222);
        assert_eq!(connector.call_timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 9 (discard) is closed on test hosts.
        let connector = SshConnector::new().with_port(9);
        let result = connector
            .connect("127.0.0.1", "ec2-user", &KeyMaterial::new("not a key"))
            .await;
        assert!(matches!(result, Err(RemoteError::Connect(_))));
    }
}
