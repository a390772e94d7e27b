//! Configuration module for Watchtower.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Only `DATABASE_URL` is required; everything else falls back to the
//! defaults below.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Configuration error. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("DATABASE_URL must be set")]
    MissingDatabaseUrl,
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string (required).
    pub database_url: String,
    /// Maximum concurrent live-bus sessions (default: 100).
    pub max_clients: usize,
    /// Maximum endpoint rooms a single session may join (default: 10).
    pub max_rooms_per_client: usize,
    /// Idle timeout after which a silent session is evicted (default: 5 min).
    pub client_timeout: Duration,
    /// Days raw check rows are kept before deletion (default: 7).
    pub detail_retention_days: i64,
    /// Days hourly aggregates are kept (default: 30).
    pub hourly_retention_days: i64,
    /// Days daily aggregates are kept (default: 90).
    pub daily_retention_days: i64,
    /// Rows deleted per batch by the retention job (default: 10000).
    pub cleanup_batch_size: i64,
    /// Master switch for retention deletes (default: true).
    pub cleanup_enabled: bool,
    /// Breaker: failure percentage that opens the circuit (default: 70).
    pub breaker_failure_threshold: u8,
    /// Breaker: sliding sample window (default: 300 s).
    pub breaker_monitoring_period: Duration,
    /// Breaker: samples required before the failure rate is evaluated
    /// (default: 3).
    pub breaker_minimum_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_clients: 100,
            max_rooms_per_client: 10,
            client_timeout: Duration::from_secs(300),
            detail_retention_days: 7,
            hourly_retention_days: 30,
            daily_retention_days: 90,
            cleanup_batch_size: 10_000,
            cleanup_enabled: true,
            breaker_failure_threshold: 70,
            breaker_monitoring_period: Duration::from_secs(300),
            breaker_minimum_requests: 3,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: Postgres connection string (required)
    /// - `MAX_CLIENTS`, `MAX_ROOMS_PER_CLIENT`, `CLIENT_TIMEOUT_MS`
    /// - `DETAIL_RETENTION_DAYS`, `HOURLY_RETENTION_DAYS`,
    ///   `DAILY_RETENTION_DAYS`, `CLEANUP_BATCH_SIZE`, `CLEANUP_ENABLED`
    /// - `BREAKER_FAILURE_THRESHOLD`, `BREAKER_MONITORING_PERIOD_MS`,
    ///   `BREAKER_MINIMUM_REQUESTS`
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        cfg.database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        read_env("MAX_CLIENTS", &mut cfg.max_clients);
        read_env("MAX_ROOMS_PER_CLIENT", &mut cfg.max_rooms_per_client);

        if let Some(ms) = parse_env::<u64>("CLIENT_TIMEOUT_MS") {
            cfg.client_timeout = Duration::from_millis(ms);
        }

        read_env("DETAIL_RETENTION_DAYS", &mut cfg.detail_retention_days);
        read_env("HOURLY_RETENTION_DAYS", &mut cfg.hourly_retention_days);
        read_env("DAILY_RETENTION_DAYS", &mut cfg.daily_retention_days);
        read_env("CLEANUP_BATCH_SIZE", &mut cfg.cleanup_batch_size);

        if let Ok(raw) = env::var("CLEANUP_ENABLED") {
            cfg.cleanup_enabled = parse_bool(&raw).unwrap_or(cfg.cleanup_enabled);
        }

        read_env(
            "BREAKER_FAILURE_THRESHOLD",
            &mut cfg.breaker_failure_threshold,
        );
        if let Some(ms) = parse_env::<u64>("BREAKER_MONITORING_PERIOD_MS") {
            cfg.breaker_monitoring_period = Duration::from_millis(ms);
        }
        read_env("BREAKER_MINIMUM_REQUESTS", &mut cfg.breaker_minimum_requests);

        Ok(cfg)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn read_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Some(v) = parse_env(key) {
        *slot = v;
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
