// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud compute provider seam.
//!
//! The reconciliation engine needs exactly five calls from a provider:
//! idempotent launch, instance listing, termination and keypair
//! create/delete. [`HttpCloudProvider`] talks to a JSON compute gateway and
//! [`MockCloud`] simulates one in memory.

pub mod http;
pub mod mock;

pub use self::http::HttpCloudProvider;
pub use self::mock::MockCloud;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::InstanceState;

/// Result type for provider calls.
pub type Result<T> = std::result::Result<T, CloudError>;

/// Errors from cloud provider calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CloudError {
    /// The provider answered with an error status.
    #[error("Cloud API error {status}: {message}")]
    Api {
        /// HTTP-like status code.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// The provider could not be reached.
    #[error("Cloud transport error: {0}")]
    Transport(String),

    /// The provider answered with something unreadable.
    #[error("Unexpected cloud response: {0}")]
    InvalidResponse(String),

    /// The named instance or keypair does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CloudError::InvalidResponse(err.to_string())
        } else {
            CloudError::Transport(err.to_string())
        }
    }
}

/// Two-secret access credentials for the provider.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AccessCredentials {
    /// Public key id.
    pub access_key_id: String,
    /// Secret key.
    pub secret_access_key: String,
}

impl fmt::Debug for AccessCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Parameters of an idempotent launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRequest {
    /// Image to boot.
    pub image_id: String,
    /// Machine type.
    pub instance_type: String,
    /// Keypair installed for the remote user.
    pub key_name: String,
    /// Repeating a launch with the same token returns the same instance.
    pub client_token: String,
}

/// What a launch returns.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchedInstance {
    /// Cloud instance id.
    pub instance_id: String,
    /// Address, if the provider already assigned one.
    #[serde(default)]
    pub public_address: Option<String>,
}

/// One row of the provider's instance list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Cloud instance id.
    pub instance_id: String,
    /// Public address, if any.
    #[serde(default)]
    pub public_address: Option<String>,
    /// Machine type.
    #[serde(default)]
    pub instance_type: String,
    /// Image.
    #[serde(default)]
    pub image_id: String,
    /// Provider state name, e.g. `running`.
    pub state: String,
}

impl InstanceInfo {
    /// Parsed lifecycle state.
    pub fn instance_state(&self) -> InstanceState {
        InstanceState::from_provider(&self.state)
    }
}

/// A freshly created keypair.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct KeyPair {
    /// Keypair name.
    pub name: String,
    /// Private key text.
    pub material: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Compute provider operations used by the engine.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Launch one instance. Repeated calls with the same `client_token`
    /// must return the instance created by the first call.
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<LaunchedInstance>;

    /// All instances visible to these credentials, terminated ones included
    /// for as long as the provider still reports them.
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>>;

    /// Request termination of an instance.
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    /// Create a keypair and return its private material.
    async fn create_keypair(&self, name: &str) -> Result<KeyPair>;

    /// Delete a keypair.
    async fn delete_keypair(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_not_debug_printed() {
        let creds = AccessCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI".to_string(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("AKIDEXAMPLE"));
        assert!(!debug.contains("wJalrXUtnFEMI"));

        let pair = KeyPair {
            name: "flotilla-web".to_string(),
            material: "PRIVATE".to_string(),
        };
        assert!(!format!("{:?}", pair).contains("PRIVATE"));
    }

    #[test]
    fn test_instance_info_state() {
        let info: InstanceInfo =
            serde_json::from_str(r#"{"instance_id": "i-1", "state": "shutting-down"}"#).unwrap();
        assert_eq!(info.instance_state(), InstanceState::ShuttingDown);
        assert!(info.public_address.is_none());
    }
}
