//! Worker configuration.
//!
//! ## Environment
//!
//! - `BATCH_SIZE`: nodes per sorter/assigner batch (default: 1000)
//! - `MAX_WORKERS`: concurrent stage workers per process (default: 4)
//! - `CONVERSION_TIMEOUT_SECONDS`: per-run wall-clock cap (default: 3600)
//! - `PROGRESS_INTERVAL_SECS`: minimum gap between progress updates (default: 5)
//! - `MAX_RETRIES`: retries for transient store errors and failed stages (default: 3)
//! - `RETRY_INITIAL_DELAY_MS`: first backoff delay (default: 100)
//! - `RETRY_MAX_DELAY_MS`: backoff cap (default: 10000)
//! - `MEMORY_LIMIT_MB`: budget for in-process aggregates (default: 512)
//! - `PERSIST_CHUNK_SIZE`: placements per persistence task (default: 1000)
//! - `HOST` / `PORT`: service bind address (default: 0.0.0.0:8002)
//!
//! Unparseable values fall back to the default; zero sizes are rejected by
//! [`WorkerConfig::validate`].

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;
use crate::retry::RetryConfig;

/// Default nodes per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default worker count.
pub const DEFAULT_MAX_WORKERS: usize = 4;
/// Default per-run timeout.
pub const DEFAULT_CONVERSION_TIMEOUT_SECS: u64 = 3600;
/// Default service port.
pub const DEFAULT_PORT: u16 = 8002;

/// Runtime configuration of the layout engine and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Nodes per sorter/assigner batch.
    pub batch_size: usize,
    /// Concurrent stage workers.
    pub max_workers: usize,
    /// Per-run wall-clock cap.
    pub conversion_timeout: Duration,
    /// Minimum gap between throttled progress updates.
    pub progress_interval: Duration,
    /// Backoff settings for transient store errors and stage resubmission.
    pub retry: RetryConfig,
    /// Budget for in-process aggregates, in bytes.
    pub memory_limit_bytes: usize,
    /// Placements per persistence task.
    pub persist_chunk_size: usize,
    /// Service bind host.
    pub host: String,
    /// Service port.
    pub port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            conversion_timeout: Duration::from_secs(DEFAULT_CONVERSION_TIMEOUT_SECS),
            progress_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
            memory_limit_bytes: 512 * 1024 * 1024,
            persist_chunk_size: 1000,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_or("BATCH_SIZE", defaults.batch_size),
            max_workers: env_or("MAX_WORKERS", defaults.max_workers),
            conversion_timeout: Duration::from_secs(env_or(
                "CONVERSION_TIMEOUT_SECONDS",
                DEFAULT_CONVERSION_TIMEOUT_SECS,
            )),
            progress_interval: Duration::from_secs(env_or("PROGRESS_INTERVAL_SECS", 5)),
            retry: RetryConfig::default()
                .with_max_retries(env_or("MAX_RETRIES", defaults.retry.max_retries))
                .with_initial_delay(Duration::from_millis(env_or("RETRY_INITIAL_DELAY_MS", 100)))
                .with_max_delay(Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 10_000))),
            memory_limit_bytes: env_or("MEMORY_LIMIT_MB", 512usize).saturating_mul(1024 * 1024),
            persist_chunk_size: env_or("PERSIST_CHUNK_SIZE", defaults.persist_chunk_size),
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the worker count.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the per-run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.conversion_timeout = timeout;
        self
    }

    /// Set the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the memory budget in bytes.
    pub fn with_memory_limit_bytes(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let zero = [
            ("batch_size", self.batch_size),
            ("max_workers", self.max_workers),
            ("persist_chunk_size", self.persist_chunk_size),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((name, _)) = zero {
            return Err(LayoutError::Validation(format!("{name} must be greater than zero")));
        }
        if self.conversion_timeout.is_zero() {
            return Err(LayoutError::Validation(
                "conversion_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
