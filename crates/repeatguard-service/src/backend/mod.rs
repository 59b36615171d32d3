//! The key-value store holding all shared idempotency state.
//!
//! A [`Backend`] only has to provide five primitives. The only hard requirement is that
//! [`set_nx`](Backend::set_nx) is atomic across all concurrent callers, as it is the sole source
//! of mutual exclusion for guarded operations. Everything else is plain reads, deletes and TTL
//! updates.
//!
//! Two implementations exist:
//!
//! - [`InMemoryBackend`]: process-local, backed by a [`moka`] cache with per-entry deadlines.
//!   Useful for single-instance deployments and tests.
//! - `RedisBackend` (feature `redis`): shared between any number of instances.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// A shared reference to a [`Backend`].
pub type BackendRef = Arc<dyn Backend>;

/// The storage primitives the idempotency protocol is built on.
///
/// Keys handed to a backend are already isolated tokens; backends never see raw
/// uniqueness keys.
#[async_trait]
pub trait Backend: fmt::Debug + Send + Sync {
    /// Atomically stores `value` under `key` with the given TTL, if `key` does not exist yet.
    ///
    /// Returns whether the key was newly created.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Returns whether `key` exists.
    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Returns the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Re-arms the TTL of an existing `key`. Does nothing if `key` does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Deletes `key`, returning whether it existed.
    async fn del(&self, key: &str) -> Result<bool, BackendError>;

    /// A short, stable name of this backend, used to tag metrics.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InMemoryBackendConfig {
    /// The maximum number of entries held at once.
    ///
    /// When the capacity is exceeded, entries may be evicted before their TTL expired, which
    /// weakens the duplicate detection for them.
    pub max_capacity: u64,
}

impl Default for InMemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisBackendConfig {
    /// Connection URL of the redis server, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,

    /// Timeout for each individual redis command.
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_operation_timeout() -> Duration {
    Duration::from_millis(500)
}

/// The backend to use for storing idempotency state.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory(InMemoryBackendConfig),
    Redis(RedisBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Memory(Default::default())
    }
}

/// Creates the backend described by the given configuration.
pub async fn from_config(config: &BackendConfig) -> anyhow::Result<BackendRef> {
    match config {
        BackendConfig::Memory(config) => {
            tracing::debug!(capacity = config.max_capacity, "Using in-memory backend");
            Ok(Arc::new(InMemoryBackend::new(config.max_capacity)))
        }
        #[cfg(feature = "redis")]
        BackendConfig::Redis(config) => {
            tracing::debug!(url = %config.url, "Using redis backend");
            Ok(Arc::new(RedisBackend::connect(config).await?))
        }
        #[cfg(not(feature = "redis"))]
        BackendConfig::Redis(_) => {
            anyhow::bail!("the redis backend requires the `redis` feature to be enabled")
        }
    }
}
