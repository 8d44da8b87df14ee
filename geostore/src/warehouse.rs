//! The database side of a sync, behind one trait so the orchestrator can be
//! driven against PostgreSQL or an in-memory stand-in.

use crate::catalog::ChangeTracker;
use crate::config::Settings;
use crate::errors::{Result, StorageError};
use crate::ident::Identifier;
use crate::models::{ChangeToken, TrackedSource};
use crate::publish::TablePublisher;
use crate::staging::StagingArea;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Creates the metadata and staging schemas and the metadata table if absent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Takes the per-source lock, failing with `Busy` if another process holds it.
    async fn lock_source(&self, name: &Identifier) -> Result<()>;

    async fn unlock_source(&self, name: &Identifier) -> Result<()>;

    /// Last committed change token of a source.
    async fn get_token(&self, name: &Identifier) -> Result<Option<ChangeToken>>;

    /// Drops the staging table of a source if it exists.
    async fn reset_staging_table(&self, name: &Identifier) -> Result<()>;

    async fn index_staging_table(&self, name: &Identifier) -> Result<()>;

    /// Atomically swaps staging into the published schema and records the token.
    async fn publish(&self, name: &Identifier, token: Option<&ChangeToken>) -> Result<()>;

    async fn list_tokens(&self) -> Result<Vec<TrackedSource>>;
}

/// PostgreSQL/PostGIS implementation.
pub struct PgWarehouse {
    pool: PgPool,
    tracker: ChangeTracker,
    staging: StagingArea,
    publisher: TablePublisher,
    // Session-level advisory locks live as long as the connection holding them.
    locks: Mutex<HashMap<Identifier, PgConnection>>,
}

impl PgWarehouse {
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(settings.connect_options())
            .await?;
        Ok(Self::from_pool(pool, settings))
    }

    pub fn from_pool(pool: PgPool, settings: &Settings) -> Self {
        let tracker = ChangeTracker::new(pool.clone(), settings);
        let publisher = TablePublisher::new(pool.clone(), tracker.clone(), settings);
        Self {
            pool,
            tracker,
            staging: StagingArea::new(settings),
            publisher,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn publisher(&self) -> &TablePublisher {
        &self.publisher
    }
}

fn lock_key(name: &Identifier) -> String {
    format!("geosync:{name}")
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_schema(&self) -> Result<()> {
        self.tracker.ensure_schema().await
    }

    async fn lock_source(&self, name: &Identifier) -> Result<()> {
        // Detached so the lock never goes back to the pool with the connection.
        let mut conn = self.pool.acquire().await?.detach();
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(lock_key(name))
            .fetch_one(&mut conn)
            .await?;
        if !acquired {
            let _ = conn.close().await;
            return Err(StorageError::Busy(name.to_string()));
        }
        self.locks.lock().await.insert(name.clone(), conn);
        Ok(())
    }

    async fn unlock_source(&self, name: &Identifier) -> Result<()> {
        let Some(mut conn) = self.locks.lock().await.remove(name) else {
            return Ok(());
        };
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(lock_key(name))
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(())
    }

    async fn get_token(&self, name: &Identifier) -> Result<Option<ChangeToken>> {
        self.tracker.get_token(name).await
    }

    async fn reset_staging_table(&self, name: &Identifier) -> Result<()> {
        self.staging.reset_staging_table(&self.pool, name).await
    }

    async fn index_staging_table(&self, name: &Identifier) -> Result<()> {
        self.publisher.index_staging_table(name).await
    }

    async fn publish(&self, name: &Identifier, token: Option<&ChangeToken>) -> Result<()> {
        self.publisher.publish(name, token).await
    }

    async fn list_tokens(&self) -> Result<Vec<TrackedSource>> {
        self.tracker.list_tokens().await
    }
}
