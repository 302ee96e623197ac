use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Failure of the key-value backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("kv backend: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Key-value store with per-key expiry. Shared by sessions and reset tokens.
///
/// Expired entries are never returned by `get`, whether or not they have been
/// purged yet.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Drop every expired entry, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct PgKvStore {
    db: PgPool,
}

impl PgKvStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>(
            r#"
            SELECT value
              FROM kv_entries
             WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(OffsetDateTime::now_utc() + ttl)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= now()")
            .execute(&self.db)
            .await?;
        Ok(done.rows_affected())
    }
}

/// Periodically purge expired entries until the runtime shuts down.
pub fn spawn_expiry_sweeper(
    store: Arc<dyn KvStore>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "expired kv entries removed"),
                Err(e) => warn!(error = %e, "kv sweep failed"),
            }
        }
    })
}
