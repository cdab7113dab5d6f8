// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Directory-backed blob store: one directory per container, one file per key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{Result, StateStore, StoreError, validate_name};

/// Store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Use `root` as the store directory. Nothing is created until first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        validate_name(container)?;
        Ok(self.root.join(container))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        fs::create_dir_all(self.container_dir(container)?).await?;
        Ok(())
    }

    async fn get(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>> {
        validate_name(key)?;
        let path = self.container_dir(container)?.join(key);
        match fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, container: &str, key: &str, body: &[u8]) -> Result<()> {
        validate_name(key)?;
        let dir = self.container_dir(container)?;
        if !fs::try_exists(&dir).await? {
            return Err(StoreError::ContainerNotFound(container.to_string()));
        }

        let target = dir.join(key);
        let staging = dir.join(format!(".{}.tmp", key));
        fs::write(&staging, body).await?;
        fs::rename(&staging, &target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        store.ensure_container("flotilla-api").await.unwrap();
        assert!(store.get("flotilla-api", "state.json").await.unwrap().is_none());
        store.put("flotilla-api", "state.json", b"{}").await.unwrap();

        let reopened = FileStateStore::new(dir.path());
        assert_eq!(
            reopened.get("flotilla-api", "state.json").await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert!(!dir.path().join("flotilla-api/.state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_put_without_container_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        let result = store.put("flotilla-api", "state.json", b"{}").await;
        assert!(matches!(result, Err(StoreError::ContainerNotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        assert!(store.ensure_container("..").await.is_err());
        assert!(store.get("ok", "../secret").await.is_err());
    }
}
