// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock remote connector for testing.
//!
//! Simulates just enough of a server for the lifecycle: `echo ok` answers
//! `ok`, `print-version` reports the installed agent (or `NONE`), and an
//! `install` into place "installs" [`MockConnector::installs_version`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RemoteChannel, RemoteConnector, RemoteError, Result};
use crate::model::KeyMaterial;

#[derive(Debug, Default)]
struct Hosts {
    installed: HashMap<String, String>,
    commands: Vec<(String, String)>,
    uploads: Vec<(String, String, usize)>,
    connects: usize,
    closes: usize,
}

/// Mock connector. Clones share the simulated hosts.
#[derive(Debug, Clone)]
pub struct MockConnector {
    hosts: Arc<Mutex<Hosts>>,
    /// If true, every connection attempt fails.
    pub refuse_connections: bool,
    /// If true, every privileged command fails as if sudo wanted a password.
    pub broken_sudo: bool,
    /// Version an install leaves behind.
    pub installs_version: String,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Hosts that accept connections and install the orchestrator's version.
    pub fn new() -> Self {
        Self {
            hosts: Arc::new(Mutex::new(Hosts::default())),
            refuse_connections: false,
            broken_sudo: false,
            installs_version: crate::VERSION.to_string(),
        }
    }

    /// Hosts that refuse connections.
    pub fn refusing() -> Self {
        Self {
            refuse_connections: true,
            ..Self::new()
        }
    }

    /// Hosts where sudo requires a password.
    pub fn broken_sudo() -> Self {
        Self {
            broken_sudo: true,
            ..Self::new()
        }
    }

    /// Pretend `version` is installed on `address`.
    pub async fn set_installed(&self, address: &str, version: &str) {
        self.hosts
            .lock()
            .await
            .installed
            .insert(address.to_string(), version.to_string());
    }

    /// Version installed on `address`, if any.
    pub async fn installed(&self, address: &str) -> Option<String> {
        self.hosts.lock().await.installed.get(address).cloned()
    }

    /// `(address, command)` pairs in execution order.
    pub async fn commands(&self) -> Vec<(String, String)> {
        self.hosts.lock().await.commands.clone()
    }

    /// `(address, path, size)` of every upload.
    pub async fn uploads(&self) -> Vec<(String, String, usize)> {
        self.hosts.lock().await.uploads.clone()
    }

    /// Successful connections opened.
    pub async fn connects(&self) -> usize {
        self.hosts.lock().await.connects
    }

    /// Channels closed.
    pub async fn closes(&self) -> usize {
        self.hosts.lock().await.closes
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(
        &self,
        address: &str,
        _user: &str,
        _key: &KeyMaterial,
    ) -> Result<Box<dyn RemoteChannel>> {
        if self.refuse_connections {
            return Err(RemoteError::Connect(format!(
                "{}:22: Connection refused",
                address
            )));
        }
        self.hosts.lock().await.connects += 1;
        Ok(Box::new(MockChannel {
            connector: self.clone(),
            address: address.to_string(),
            open: true,
        }))
    }
}

struct MockChannel {
    connector: MockConnector,
    address: String,
    open: bool,
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn run_privileged(&mut self, command: &str) -> Result<String> {
        if !self.open {
            return Err(RemoteError::Closed);
        }
        let mut hosts = self.connector.hosts.lock().await;
        hosts
            .commands
            .push((self.address.clone(), command.to_string()));

        if self.connector.broken_sudo {
            return Err(RemoteError::CommandFailed {
                command: command.to_string(),
                exit_code: 1,
                output: "sudo: a password is required\r\n".to_string(),
            });
        }

        if command == "echo ok" {
            return Ok("ok\r\n".to_string());
        }
        if command.contains("print-version") {
            let reported = hosts
                .installed
                .get(&self.address)
                .cloned()
                .unwrap_or_else(|| "NONE".to_string());
            return Ok(format!("{}\r\n", reported));
        }
        if command.starts_with("install ") {
            hosts
                .installed
                .insert(self.address.clone(), self.connector.installs_version.clone());
        }
        Ok(String::new())
    }

    async fn upload_file(&mut self, remote_path: &str, bytes: &[u8]) -> Result<()> {
        if !self.open {
            return Err(RemoteError::Closed);
        }
        self.connector.hosts.lock().await.uploads.push((
            self.address.clone(),
            remote_path.to_string(),
            bytes.len(),
        ));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.connector.hosts.lock().await.closes += 1;
        }
        Ok(())
    }
}
