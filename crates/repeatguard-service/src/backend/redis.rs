use std::future::Future;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, RedisResult};

use crate::error::BackendError;

use super::{Backend, RedisBackendConfig};

/// A [`Backend`] shared across processes through a redis server.
///
/// Every primitive maps onto exactly one redis command, so there is no client-side state
/// between the steps of a guarded call:
///
/// - `set_nx`: `SET key value NX PX ttl`
/// - `exists`: `EXISTS key`
/// - `get`: `GET key`
/// - `expire`: `PEXPIRE key ttl`
/// - `del`: `DEL key`
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    timeout: Duration,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connection", &"<ConnectionManager>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisBackend {
    pub async fn connect(config: &RedisBackendConfig) -> anyhow::Result<Self> {
        let client = Client::open(config.url.as_str()).context("invalid redis url")?;
        let connection = tokio::time::timeout(config.timeout, ConnectionManager::new(client))
            .await
            .context("timeout connecting to redis")?
            .context("failed to connect to redis")?;

        Ok(Self {
            connection,
            timeout: config.timeout,
        })
    }

    /// Runs a single command with the configured timeout.
    async fn query<T, F, Fut>(&self, command: &'static str, f: F) -> Result<T, BackendError>
    where
        T: FromRedisValue,
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let future = f(self.connection.clone());
        let result = tokio::time::timeout(self.timeout, future)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))?;
        Ok(result.with_context(|| format!("redis {command} failed"))?)
    }
}

fn millis(ttl: Duration) -> u64 {
    // redis rejects a PX of zero
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Backend for RedisBackend {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError> {
        let reply: Option<String> = self
            .query("SET", |mut connection| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async(&mut connection)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.query("EXISTS", |mut connection| async move {
            redis::cmd("EXISTS")
                .arg(key)
                .query_async(&mut connection)
                .await
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.query("GET", |mut connection| async move {
            redis::cmd("GET").arg(key).query_async(&mut connection).await
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        let _updated: bool = self
            .query("PEXPIRE", |mut connection| async move {
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(millis(ttl))
                    .query_async(&mut connection)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        let deleted: u64 = self
            .query("DEL", |mut connection| async move {
                redis::cmd("DEL").arg(key).query_async(&mut connection).await
            })
            .await?;
        Ok(deleted > 0)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
