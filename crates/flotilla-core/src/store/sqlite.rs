// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed blob store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{Result, StateStore, StoreError, validate_name};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Wrap an existing pool. The schema must already be in place.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// Parent directories are created as required.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        validate_name(container)?;
        sqlx::query(
            r#"
            INSERT INTO containers (name) VALUES (?)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(container)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let body: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT body FROM blobs
            WHERE container = ? AND key = ?
            "#,
        )
        .bind(container)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(body)
    }

    async fn put(&self, container: &str, key: &str, body: &[u8]) -> Result<()> {
        validate_name(key)?;
        let exists: Option<String> =
            sqlx::query_scalar("SELECT name FROM containers WHERE name = ?")
                .bind(container)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(StoreError::ContainerNotFound(container.to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO blobs (container, key, body, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (container, key)
            DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
            "#,
        )
        .bind(container)
        .bind(key)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let store = SqliteStateStore::from_path(&path).await.unwrap();
        store.ensure_container("flotilla-web").await.unwrap();
        assert!(store.get("flotilla-web", "state.json").await.unwrap().is_none());

        store.put("flotilla-web", "state.json", b"one").await.unwrap();
        store.put("flotilla-web", "state.json", b"two").await.unwrap();
        drop(store);

        let reopened = SqliteStateStore::from_path(&path).await.unwrap();
        reopened.ensure_container("flotilla-web").await.unwrap();
        assert_eq!(
            reopened.get("flotilla-web", "state.json").await.unwrap(),
            Some(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn test_put_without_container_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::from_path(dir.path().join("s.db"))
            .await
            .unwrap();

        let result = store.put("nope", "state.json", b"x").await;
        assert!(matches!(result, Err(StoreError::ContainerNotFound(_))));
    }
}
