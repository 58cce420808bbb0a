//! Environment-derived configuration for all four services

use std::env;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Runtime configuration shared by the pipeline services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Postgres connection URL (required)
    pub database_url: String,

    /// Maximum connections in the shared pool
    pub db_max_connections: u32,

    /// Indexer HTTP listen port
    pub port: u16,

    /// Network identifier recorded in index_progress
    pub network: String,

    /// Upstream node RPC base URL (tip queries, block fetch)
    pub node_url: String,

    /// Upstream indexer API base URL (transaction decode fallback)
    pub node_api_url: String,

    /// Webhook dispatch concurrency per worker process
    pub worker_concurrency: usize,

    /// Parallel view tasks in the view processor
    pub view_concurrency: usize,

    /// Worker claim poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Whether the tip follower runs at all
    pub tip_follower_enabled: bool,

    /// Seconds of push silence before the tip follower starts polling
    pub tip_follower_timeout_secs: u64,

    /// Tip follower tick interval in seconds
    pub tip_follower_interval_secs: u64,

    /// Whether the integrity loop backfills detected gaps
    pub auto_backfill: bool,

    /// Backfill rate limit in blocks per second
    pub auto_backfill_rate: u32,

    /// Exit at startup if gaps are detected
    pub require_integrity: bool,

    /// Integrity check cadence in seconds
    pub integrity_interval_secs: u64,

    /// Attempts cap before a retryable webhook failure becomes permanent
    pub webhook_max_attempts: i32,

    /// Webhook request timeout in seconds
    pub webhook_timeout_secs: u64,

    /// Age after which a processing job is considered abandoned
    pub job_stale_after_secs: u64,

    /// Stale-claim recovery cadence in seconds
    pub job_recovery_interval_secs: u64,
}

impl Config {
    /// Load configuration from the environment. Missing `DATABASE_URL` is fatal.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| Error::config("DATABASE_URL must be set"))?;

        let config = Self {
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", 10)?,
            port: env_parse("PORT", 3700)?,
            network: env::var("STACKS_NETWORK").unwrap_or_else(|_| "mainnet".to_string()),
            node_url: env::var("STACKS_NODE_URL")
                .unwrap_or_else(|_| "http://localhost:20443".to_string()),
            node_api_url: env::var("STACKS_API_URL")
                .unwrap_or_else(|_| "https://api.hiro.so".to_string()),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 5)?,
            view_concurrency: env_parse("VIEW_CONCURRENCY", 5)?,
            poll_interval_ms: env_parse("POLL_INTERVAL_MS", 1000)?,
            tip_follower_enabled: env_parse("TIP_FOLLOWER_ENABLED", true)?,
            tip_follower_timeout_secs: env_parse("TIP_FOLLOWER_TIMEOUT", 60)?,
            tip_follower_interval_secs: env_parse("TIP_FOLLOWER_INTERVAL", 10)?,
            auto_backfill: env_parse("AUTO_BACKFILL", true)?,
            auto_backfill_rate: env_parse("AUTO_BACKFILL_RATE", 10)?,
            require_integrity: env_parse("REQUIRE_INTEGRITY", false)?,
            integrity_interval_secs: env_parse("INTEGRITY_INTERVAL", 300)?,
            webhook_max_attempts: env_parse("WEBHOOK_MAX_ATTEMPTS", 5)?,
            webhook_timeout_secs: env_parse("WEBHOOK_TIMEOUT", 10)?,
            job_stale_after_secs: env_parse("JOB_STALE_AFTER", 300)?,
            job_recovery_interval_secs: env_parse("JOB_RECOVERY_INTERVAL", 60)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(Error::config("DATABASE_URL must not be empty"));
        }
        if self.worker_concurrency == 0 {
            return Err(Error::config("WORKER_CONCURRENCY must be at least 1"));
        }
        if self.view_concurrency == 0 {
            return Err(Error::config("VIEW_CONCURRENCY must be at least 1"));
        }
        if self.auto_backfill_rate == 0 {
            return Err(Error::config("AUTO_BACKFILL_RATE must be at least 1"));
        }
        if self.webhook_max_attempts < 1 {
            return Err(Error::config("WEBHOOK_MAX_ATTEMPTS must be at least 1"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/secondlayer".to_string(),
            db_max_connections: 10,
            port: 3700,
            network: "mainnet".to_string(),
            node_url: "http://localhost:20443".to_string(),
            node_api_url: "https://api.hiro.so".to_string(),
            worker_concurrency: 5,
            view_concurrency: 5,
            poll_interval_ms: 1000,
            tip_follower_enabled: true,
            tip_follower_timeout_secs: 60,
            tip_follower_interval_secs: 10,
            auto_backfill: true,
            auto_backfill_rate: 10,
            require_integrity: false,
            integrity_interval_secs: 300,
            webhook_max_attempts: 5,
            webhook_timeout_secs: 10,
            job_stale_after_secs: 300,
            job_recovery_interval_secs: 60,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::config(format!("invalid value for {}: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 3700);
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.tip_follower_timeout_secs, 60);
        assert_eq!(config.integrity_interval_secs, 300);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = Config {
            worker_concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_database_url_is_rejected() {
        let config = Config {
            database_url: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
