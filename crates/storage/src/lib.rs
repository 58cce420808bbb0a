//! PostgreSQL store shared by all pipeline services
//!
//! The store is the single coordination substrate: transactions, row-level
//! locking with skip-locked claims, JSONB columns, and LISTEN/NOTIFY fan-out.

use std::time::Duration;

use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use tracing::info;

use secondlayer_core::{Config, Error, Result};

pub mod blocks;
pub mod queue;
pub mod schema;
pub mod streams;
pub mod views;

pub use queue::JobQueue;

/// Handle to the shared relational store
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    database_url: String,
}

impl Store {
    /// Connect a pool and bootstrap the schema
    pub async fn connect(config: &Config) -> Result<Self> {
        let max_connections = config
            .db_max_connections
            .max(num_cpus::get() as u32);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.database_url)
            .await
            .map_err(|e| Error::storage(format!("Failed to connect to PostgreSQL: {}", e)))?;

        info!(max_connections, "Connected to PostgreSQL");

        let store = Self {
            pool,
            database_url: config.database_url.clone(),
        };
        schema::apply(&store.pool).await?;
        Ok(store)
    }

    /// The underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Publish on a notification channel. Payload may be empty.
    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Open a dedicated listener connection subscribed to the given channels
    pub async fn listener(&self, channels: &[&str]) -> Result<PgListener> {
        let mut listener = PgListener::connect(&self.database_url)
            .await
            .map_err(|e| Error::storage(format!("Failed to open listener: {}", e)))?;
        listener.listen_all(channels.iter().copied()).await?;
        Ok(listener)
    }
}
