// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable blob storage for the fleet state document.
//!
//! A [`StateStore`] holds opaque byte blobs addressed by `(container, key)`.
//! Containers are fleet-scoped and created on first use. The document codec
//! and read-modify-write protocol live in [`repo`].

pub mod file;
pub mod memory;
pub mod repo;
pub mod sqlite;

pub use self::file::FileStateStore;
pub use self::memory::MemoryStateStore;
pub use self::repo::FleetStateRepo;
pub use self::sqlite::SqliteStateStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by state stores.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed.
    #[error("Database error during {operation}: {details}")]
    Database {
        /// What was being done.
        operation: String,
        /// Driver message.
        details: String,
    },

    /// Filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `put` into a container that was never created.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Container or key name that cannot be used as an address.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Unrecognised store URL.
    #[error("Unsupported state store URL: {0}")]
    UnsupportedUrl(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

/// Blob storage backend.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create `container` if it does not exist yet.
    async fn ensure_container(&self, container: &str) -> Result<()>;

    /// Fetch a blob, `None` if absent.
    async fn get(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a blob, replacing any previous body atomically.
    async fn put(&self, container: &str, key: &str, body: &[u8]) -> Result<()>;
}

/// Open a store from a URL.
///
/// - `sqlite:<path>` opens (and creates) a SQLite database file.
/// - `file:<dir>` stores one directory per container under `dir`.
/// - `memory:` keeps everything in process memory.
pub async fn open(url: &str) -> Result<Arc<dyn StateStore>> {
    if let Some(path) = url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        return Ok(Arc::new(SqliteStateStore::from_path(path).await?));
    }
    if let Some(dir) = url.strip_prefix("file:") {
        let dir = dir.trim_start_matches("//");
        return Ok(Arc::new(FileStateStore::new(dir)));
    }
    if url == "memory:" {
        return Ok(Arc::new(MemoryStateStore::new()));
    }
    Err(StoreError::UnsupportedUrl(url.to_string()))
}

/// Reject names that could escape their namespace.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}
