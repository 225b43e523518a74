//! Postgres-backed document store
//!
//! Documents are JSONB rows keyed by logical path. The claim transaction is
//! a single conditional update, so exactly one concurrent claimant observes
//! `claimedAt == 0` and wins. The queue watch is a poll loop feeding a
//! latest-value channel; consumers that fall behind only ever see the most
//! recent snapshot.

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::store::{deep_merge, DocStore, DocWrite, QueueCandidate, WriteKind};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

pub struct PgDocStore {
    pool: PgPool,
    queue_tx: watch::Sender<Option<QueueCandidate>>,
}

impl PgDocStore {
    /// Connect, run migrations, and start the queue poll task.
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig, queue_poll_interval: Duration) -> Result<Self> {
        let pool = create_pool(config).await?;
        run_migrations(&pool).await?;

        let (queue_tx, _) = watch::channel(None);
        let store = Self {
            pool: pool.clone(),
            queue_tx: queue_tx.clone(),
        };

        tokio::spawn(poll_queue(pool, queue_tx, queue_poll_interval));

        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the store is healthy
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::store_with_source("Health check failed", e))?;
        Ok(())
    }

    /// Close all connections gracefully
    pub async fn close(&self) {
        info!("Closing document store connection pool...");
        self.pool.close().await;
        info!("Document store connection pool closed");
    }
}

#[async_trait]
impl DocStore for PgDocStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT data FROM documents WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Value, _>("data")))
    }

    async fn set(&self, path: &str, doc: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (path, data, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (path) DO UPDATE SET data = EXCLUDED.data, updated_at = now()
            "#,
        )
        .bind(path)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn merge(&self, path: &str, patch: Value) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        merge_in_txn(&mut txn, path, &patch).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE path = $1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn commit(&self, writes: &[DocWrite]) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        for write in writes {
            match write.kind {
                WriteKind::Set => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (path, data, updated_at)
                        VALUES ($1, $2, now())
                        ON CONFLICT (path) DO UPDATE SET data = EXCLUDED.data, updated_at = now()
                        "#,
                    )
                    .bind(&write.path)
                    .bind(&write.doc)
                    .execute(&mut *txn)
                    .await?;
                }
                WriteKind::Merge => {
                    merge_in_txn(&mut txn, &write.path, &write.doc).await?;
                }
            }
        }
        txn.commit().await?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query(
            r#"
            SELECT path, data FROM documents
            WHERE path LIKE $1 || '%' AND ($2::text IS NULL OR path > $2)
            ORDER BY path
            LIMIT $3
            "#,
        )
        .bind(prefix)
        .bind(start_after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("path"), r.get::<Value, _>("data")))
            .collect())
    }

    async fn try_claim(&self, path: &str, now_ms: u64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET data = jsonb_set(data, '{state,queue,claimedAt}', to_jsonb($2::bigint), true),
                updated_at = now()
            WHERE path = $1
              AND COALESCE((data#>>'{state,queue,claimedAt}')::bigint, 0) = 0
            "#,
        )
        .bind(path)
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    fn watch_queue(&self) -> watch::Receiver<Option<QueueCandidate>> {
        self.queue_tx.subscribe()
    }
}

/// Read-modify-write merge with the row locked for the duration.
async fn merge_in_txn(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    path: &str,
    patch: &Value,
) -> Result<()> {
    let existing = sqlx::query("SELECT data FROM documents WHERE path = $1 FOR UPDATE")
        .bind(path)
        .fetch_optional(&mut **txn)
        .await?;

    let merged = match existing {
        Some(row) => {
            let mut base: Value = row.get("data");
            deep_merge(&mut base, patch);
            base
        }
        None => patch.clone(),
    };

    sqlx::query(
        r#"
        INSERT INTO documents (path, data, updated_at)
        VALUES ($1, $2, now())
        ON CONFLICT (path) DO UPDATE SET data = EXCLUDED.data, updated_at = now()
        "#,
    )
    .bind(path)
    .bind(merged)
    .execute(&mut **txn)
    .await?;

    Ok(())
}

/// The queue watcher: re-read the single oldest unclaimed collection on an
/// interval and publish it. The claim loop never terminates on error.
async fn poll_queue(
    pool: PgPool,
    queue_tx: watch::Sender<Option<QueueCandidate>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let row = sqlx::query(
            r#"
            SELECT path, (data#>>'{state,queue,enqueuedAt}')::bigint AS enqueued_at
            FROM documents
            WHERE path LIKE 'collections/%'
              AND path NOT LIKE '%/nfts/%'
              AND path NOT LIKE '%/attributes/%'
              AND COALESCE((data#>>'{state,queue,claimedAt}')::bigint, 0) = 0
              AND COALESCE((data#>>'{state,queue,enqueuedAt}')::bigint, 0) > 0
            ORDER BY enqueued_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&pool)
        .await;

        match row {
            Ok(row) => {
                let candidate = row.map(|r| QueueCandidate {
                    path: r.get::<String, _>("path"),
                    enqueued_at: r.get::<i64, _>("enqueued_at") as u64,
                });
                queue_tx.send_if_modified(|current| {
                    if *current != candidate {
                        *current = candidate;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => {
                error!("Queue poll failed: {:?}", e);
            }
        }
    }
}

/// Create a connection pool with the given configuration
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    info!("Creating document store connection pool...");
    debug!(
        "Pool config: max={}, min={}, connect_timeout={:?}",
        config.max_connections, config.min_connections, config.connect_timeout
    );

    let mut connect_options =
        PgConnectOptions::from_str(&config.url).map_err(|e| Error::Config {
            message: format!("Invalid database URL: {}", e).into(),
            source: None,
        })?;

    // Query-level logging stays at debug; slow statements surface as warnings.
    connect_options = connect_options.log_statements(log::LevelFilter::Debug);
    connect_options =
        connect_options.log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(Some(config.idle_timeout))
        .max_lifetime(Some(config.max_lifetime))
        .connect_with(connect_options)
        .await
        .map_err(|e| Error::store_with_source("Failed to create connection pool", e))?;

    // Verify we can connect
    sqlx::query("SELECT 1")
        .fetch_one(&pool)
        .await
        .map_err(|e| Error::store_with_source("Failed to verify database connection", e))?;

    info!(
        "Document store pool created (size: {}, idle: {})",
        pool.size(),
        pool.num_idle()
    );

    Ok(pool)
}

/// Create the documents table and queue index if they don't exist.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            path TEXT PRIMARY KEY,
            data JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS documents_queue_idx
        ON documents (((data#>>'{state,queue,enqueuedAt}')::bigint))
        WHERE COALESCE((data#>>'{state,queue,claimedAt}')::bigint, 0) = 0
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
