// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Result, StateStore, StoreError, validate_name};

/// Process-local store. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    containers: Arc<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` targets currently held in `container`.
    pub async fn len(&self, container: &str) -> usize {
        self.containers
            .lock()
            .await
            .get(container)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        validate_name(container)?;
        self.containers
            .lock()
            .await
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn get(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let containers = self.containers.lock().await;
        Ok(containers
            .get(container)
            .and_then(|blobs| blobs.get(key))
            .cloned())
    }

    async fn put(&self, container: &str, key: &str, body: &[u8]) -> Result<()> {
        validate_name(key)?;
        let mut containers = self.containers.lock().await;
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        blobs.insert(key.to_string(), body.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_requires_container() {
        let store = MemoryStateStore::new();
        let result = store.put("missing", "k", b"x").await;
        assert!(matches!(result, Err(StoreError::ContainerNotFound(_))));
    }

    #[tokio::test]
    async fn test_clones_share_contents() {
        let store = MemoryStateStore::new();
        let other = store.clone();
        store.ensure_container("c").await.unwrap();
        store.put("c", "k", b"body").await.unwrap();

        assert_eq!(other.get("c", "k").await.unwrap(), Some(b"body".to_vec()));
        assert_eq!(other.len("c").await, 1);
    }
}
