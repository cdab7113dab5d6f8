// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON compute gateway client.
//!
//! Routes, relative to the configured endpoint:
//!
//! | Call                 | Route                     |
//! |----------------------|---------------------------|
//! | `launch_instance`    | `POST /instances`         |
//! | `list_instances`     | `GET /instances`          |
//! | `terminate_instance` | `DELETE /instances/{id}`  |
//! | `create_keypair`     | `POST /keypairs`          |
//! | `delete_keypair`     | `DELETE /keypairs/{name}` |
//!
//! Credentials travel in the `x-access-key-id` and `x-secret-access-key`
//! headers on every request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{
    AccessCredentials, CloudError, CloudProvider, InstanceInfo, KeyPair, LaunchRequest,
    LaunchedInstance, Result,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<InstanceInfo>,
}

/// Gateway-backed provider.
#[derive(Clone)]
pub struct HttpCloudProvider {
    client: Client,
    endpoint: String,
    credentials: AccessCredentials,
}

impl std::fmt::Debug for HttpCloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCloudProvider")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl HttpCloudProvider {
    /// Client for the gateway at `endpoint`.
    pub fn new(endpoint: impl Into<String>, credentials: AccessCredentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("x-access-key-id", &self.credentials.access_key_id)
            .header("x-secret-access-key", &self.credentials.secret_access_key)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        debug!(call = what, status = status.as_u16(), "Cloud gateway response");
        if status == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CloudProvider for HttpCloudProvider {
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<LaunchedInstance> {
        let response = self
            .send(
                self.client.post(self.url("/instances")).json(request),
                "launch_instance",
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let response = self
            .send(self.client.get(self.url("/instances")), "list_instances")
            .await?;
        let list: InstanceList = response.json().await?;
        Ok(list.instances)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.send(
            self.client
                .delete(self.url(&format!("/instances/{}", instance_id))),
            "terminate_instance",
        )
        .await?;
        Ok(())
    }

    async fn create_keypair(&self, name: &str) -> Result<KeyPair> {
        let response = self
            .send(
                self.client
                    .post(self.url("/keypairs"))
                    .json(&serde_json::json!({ "name": name })),
                "create_keypair",
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn delete_keypair(&self, name: &str) -> Result<()> {
        self.send(
            self.client.delete(self.url(&format!("/keypairs/{}", name))),
            "delete_keypair",
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> AccessCredentials {
        AccessCredentials {
            access_key_id: "id".to_string(),
            secret_access_key: "secret".to_string(),
        }
    }

    #[test]
    fn test_endpoint_trailing_slash_is_trimmed() {
        let provider = HttpCloudProvider::new("https://gw.example.com/v1/", creds()).unwrap();
        assert_eq!(
            provider.url("/instances"),
            "https://gw.example.com/v1/instances"
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let provider = HttpCloudProvider::new("https://gw.example.com", creds()).unwrap();
        assert!(!format!("{:?}", provider).contains("\"secret\""));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transport_error() {
        let provider = HttpCloudProvider::new("http://127.0.0.1:9", creds()).unwrap();
        let result = provider.list_instances().await;
        assert!(matches!(result, Err(CloudError::Transport(_))));
    }
}
