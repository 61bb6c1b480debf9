//! SQLite storage implementation.
//!
//! A file-based storage backend using SQLite. Good for:
//! - Single-host deployments that want one file instead of a directory
//! - Testing with persistent data
//!
//! Each document (site history, prediction set, credential pool) is stored
//! as one JSON row keyed by `(kind, key)`.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::credentials::PoolState;
use crate::error::{HarvestError, Result};
use crate::sources::normalize_site;
use crate::traits::store::{CredentialRepository, HistoryRepository, PredictionRepository};
use crate::types::{history::SiteHistory, prediction::PredictionSet};

const KIND_HISTORY: &str = "history";
const KIND_PREDICTIONS: &str = "predictions";
const KIND_CREDENTIALS: &str = "credentials";

/// SQLite-based document store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with the given connection URL.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - In-memory database (ephemeral)
    /// - `sqlite:./harvest.db?mode=rwc` - Create if not exists
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Create an in-memory SQLite store (for testing).
    ///
    /// Single connection: every SQLite in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(HarvestError::storage)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, key)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(HarvestError::storage)?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM documents WHERE kind = ? AND key = ?")
                .bind(kind)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(HarvestError::storage)?;

        match row {
            Some((body,)) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn save<T: Serialize>(&self, kind: &str, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO documents (kind, key, body, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(kind, key) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(kind)
        .bind(key)
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(HarvestError::storage)?;
        Ok(())
    }

    async fn delete(&self, kind: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE kind = ? AND key = ?")
            .bind(kind)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(HarvestError::storage)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl HistoryRepository for SqliteStore {
    async fn load_history(&self, site: &str) -> Result<Option<SiteHistory>> {
        self.load(KIND_HISTORY, &normalize_site(site)).await
    }

    async fn save_history(&self, history: &SiteHistory) -> Result<()> {
        self.save(KIND_HISTORY, &normalize_site(&history.site), history)
            .await
    }

    async fn delete_history(&self, site: &str) -> Result<bool> {
        self.delete(KIND_HISTORY, &normalize_site(site)).await
    }
}

#[async_trait]
impl CredentialRepository for SqliteStore {
    async fn load_pool(&self) -> Result<Option<PoolState>> {
        self.load(KIND_CREDENTIALS, "pool").await
    }

    async fn save_pool(&self, state: &PoolState) -> Result<()> {
        self.save(KIND_CREDENTIALS, "pool", state).await
    }
}

#[async_trait]
impl PredictionRepository for SqliteStore {
    async fn load_predictions(&self, site: &str) -> Result<Option<PredictionSet>> {
        self.load(KIND_PREDICTIONS, &normalize_site(site)).await
    }

    async fn save_predictions(&self, predictions: &PredictionSet) -> Result<()> {
        self.save(
            KIND_PREDICTIONS,
            &normalize_site(&predictions.site),
            predictions,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut history = SiteHistory::new("anid.cl", Utc::now());

        store.save_history(&history).await.unwrap();
        history.last_updated = Utc::now();
        store.save_history(&history).await.unwrap();

        let loaded = store.load_history("anid.cl").await.unwrap();
        assert_eq!(loaded, Some(history));
        assert!(store.delete_history("anid.cl").await.unwrap());
        assert!(store.load_history("anid.cl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pool_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load_pool().await.unwrap().is_none());

        store.save_pool(&PoolState::default()).await.unwrap();
        assert_eq!(store.load_pool().await.unwrap(), Some(PoolState::default()));
    }
}
