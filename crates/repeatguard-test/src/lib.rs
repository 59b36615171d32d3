//! Helpers for testing guarded operations and backends.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Backends in here wrap an [`InMemoryBackend`], so they behave exactly like the real thing
//!    apart from what they are instrumented for. Hold on to the `Arc` to inspect them after
//!    handing a clone to a [`RepeatGuard`].
//!
//!  - When using [`config_file`], make sure the returned [`TempDir`] is held for as long as the
//!    file is read.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use repeatguard_service::backend::{Backend, InMemoryBackend};
use repeatguard_service::error::BackendError;
use repeatguard_service::{DuplicateKind, RepeatGuard, RepeatPolicy, Window};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `repeatguard` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("repeatguard_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` into a `config.yml` inside a fresh temporary directory.
pub fn config_file(contents: &str) -> (TempDir, PathBuf) {
    let dir = tempdir();
    let path = dir.path().join("config.yml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

/// A policy with a fixed window that replays the first response to duplicates.
pub fn replay_policy(method_lock_ttl: Duration, response_ttl: Duration) -> RepeatPolicy {
    RepeatPolicy::new(Window::Fixed)
        .method_lock_ttl(method_lock_ttl)
        .response_ttl(response_ttl)
        .use_last_response(true)
        .token_key("/id")
}

/// A policy with a fixed window that rejects all duplicates.
pub fn reject_policy(kind: DuplicateKind, message: &str) -> RepeatPolicy {
    RepeatPolicy::new(Window::Fixed)
        .reject_with(kind, message)
        .token_key("/id")
}

/// Creates a guard with `checkout` registered under [`replay_policy`] and `refund` under
/// [`reject_policy`].
pub fn guard(backend: Arc<dyn Backend>) -> RepeatGuard {
    RepeatGuard::builder(backend)
        .policy(
            "checkout",
            replay_policy(Duration::from_secs(10), Duration::from_secs(60)),
        )
        .policy(
            "refund",
            reject_policy(DuplicateKind::Conflict, "refund already in progress"),
        )
        .build()
}

/// A primitive invoked on a [`RecordingBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendCall {
    pub method: &'static str,
    pub key: String,
}

/// An [`InMemoryBackend`] that records every call made to it.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    inner: InMemoryBackend,
    calls: Mutex<Vec<BackendCall>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, method: &'static str, key: &str) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.push(BackendCall {
            method,
            key: key.to_owned(),
        });
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The methods called so far, in order.
    pub fn methods(&self) -> Vec<&'static str> {
        self.calls().into_iter().map(|call| call.method).collect()
    }

    /// How often `method` was called.
    pub fn count(&self, method: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The underlying storage.
    pub fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError> {
        self.record("set_nx", key);
        self.inner.set_nx(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.record("exists", key);
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.record("get", key);
        self.inner.get(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        self.record("expire", key);
        self.inner.expire(key, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        self.record("del", key);
        self.inner.del(key).await
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// An [`InMemoryBackend`] whose selected primitives fail.
#[derive(Debug, Default)]
pub struct FailingBackend {
    inner: InMemoryBackend,
    failing: Vec<&'static str>,
}

impl FailingBackend {
    /// A backend where every primitive fails.
    pub fn new() -> Arc<Self> {
        Self::failing_on(&["set_nx", "exists", "get", "expire", "del"])
    }

    /// A backend where only `methods` fail.
    pub fn failing_on(methods: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryBackend::default(),
            failing: methods.to_vec(),
        })
    }

    fn check(&self, method: &'static str) -> Result<(), BackendError> {
        if self.failing.contains(&method) {
            return Err(anyhow!("{method} is unavailable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FailingBackend {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError> {
        self.check("set_nx")?;
        self.inner.set_nx(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.check("exists")?;
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        self.check("expire")?;
        self.inner.expire(key, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        self.check("del")?;
        self.inner.del(key).await
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Arguments for the `/id` token key of the policy fixtures.
pub fn arguments(id: &str) -> serde_json::Value {
    serde_json::json!({ "id": id })
}
