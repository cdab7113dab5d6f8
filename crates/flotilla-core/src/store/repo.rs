// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-modify-write access to one fleet's state document.
//!
//! The document is pretty-printed JSON stored under [`STATE_KEY`] in the
//! container `flotilla-<fleet>`. It carries a `format_version`; documents
//! without one are version 1 and newer versions are refused rather than
//! silently truncated.

use std::sync::Arc;

use tracing::debug;

use super::StateStore;
use crate::error::{FleetError, Result};
use crate::model::{FORMAT_VERSION, FleetState};

/// Key of the state document inside the fleet container.
pub const STATE_KEY: &str = "state.json";

/// Container holding a fleet's document.
pub fn container_name(fleet: &str) -> String {
    format!("flotilla-{}", fleet)
}

/// Serialize a state document.
pub fn encode(state: &FleetState) -> Result<Vec<u8>> {
    let mut body = serde_json::to_vec_pretty(state)?;
    body.push(b'\n');
    Ok(body)
}

/// Deserialize a state document, filling absent fields with defaults.
pub fn decode(body: &[u8]) -> Result<FleetState> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let version = match value.get("format_version") {
        None => FORMAT_VERSION,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| FleetError::Document("format_version is not a number".to_string()))?,
    };
    if version > FORMAT_VERSION {
        return Err(FleetError::Document(format!(
            "document format_version {} is newer than supported version {}",
            version, FORMAT_VERSION
        )));
    }
    let mut state: FleetState = serde_json::from_value(value)?;
    state.format_version = FORMAT_VERSION;
    Ok(state)
}

/// Loads and stores the state document of one fleet.
#[derive(Clone)]
pub struct FleetStateRepo {
    store: Arc<dyn StateStore>,
    container: String,
}

impl FleetStateRepo {
    /// Repository for `fleet` on top of `store`.
    pub fn new(store: Arc<dyn StateStore>, fleet: &str) -> Self {
        Self {
            store,
            container: container_name(fleet),
        }
    }

    /// Container this repository writes to.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Load the document, or an empty state if none was ever stored.
    pub async fn load(&self) -> Result<FleetState> {
        self.store.ensure_container(&self.container).await?;
        match self.store.get(&self.container, STATE_KEY).await? {
            Some(body) => decode(&body),
            None => {
                debug!(container = %self.container, "No state document yet, starting empty");
                Ok(FleetState::default())
            }
        }
    }

    /// Replace the stored document.
    pub async fn save(&self, state: &FleetState) -> Result<()> {
        let body = encode(state)?;
        self.store.ensure_container(&self.container).await?;
        self.store.put(&self.container, STATE_KEY, &body).await?;
        debug!(
            container = %self.container,
            servers = state.servers.len(),
            failures = state.failures.len(),
            "State document saved"
        );
        Ok(())
    }

    /// Load, apply `edit`, then store. Nothing is stored if `edit` fails.
    pub async fn update<T, F>(&self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut FleetState) -> Result<T>,
    {
        let mut state = self.load().await?;
        let out = edit(&mut state)?;
        self.save(&state).await?;
        Ok(out)
    }
}
