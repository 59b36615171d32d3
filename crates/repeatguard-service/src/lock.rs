//! The idempotency lock: isolated tokens with fixed or sliding expiry.
//!
//! Callers never talk to the [`Backend`](crate::backend::Backend) with their raw keys. Every key
//! is first turned into an *isolation token*, which is the configured prefix followed by the
//! hex-encoded sha-256 digest of the trimmed key:
//!
//! ```text
//! TMT_6d5b2c...
//! ```
//!
//! This keeps arbitrary business keys of unbounded length out of the store, and namespaces them
//! away from unrelated data living in the same store. The digest is not meant as a security
//! measure.
//!
//! ## Windows
//!
//! A [`claim`](IdempotencyLock::claim) that fails because the entry already exists re-arms the
//! entry's TTL under the [`Sliding`](Window::Sliding) window, so repeated contention keeps
//! extending the protection. Under the [`Fixed`](Window::Fixed) window the entry expires at a fixed
//! offset from the first claim. A successful claim never refreshes anything.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::backend::BackendRef;
use crate::error::BackendError;
use crate::policy::Window;

/// The default prefix of isolation tokens.
pub const DEFAULT_PREFIX: &str = "TMT_";

/// The marker value stored for method locks.
pub const DEFAULT_MARKER: &str = "1";

const RESPONSE_SUFFIX: &str = "_response";

/// Returns the key of the lock scoping a uniqueness key to one operation.
pub fn method_lock_key(uniqueness_key: &str, operation: &str) -> String {
    format!("{uniqueness_key}{operation}")
}

/// Returns the key of the cached response belonging to a method lock key.
pub fn response_key(prefix: &str, method_lock_key: &str) -> String {
    format!("{prefix}{method_lock_key}{RESPONSE_SUFFIX}")
}

/// Claims, inspects and releases isolated entries in a [`Backend`](crate::backend::Backend).
#[derive(Clone, Debug)]
pub struct IdempotencyLock {
    backend: BackendRef,
    prefix: Arc<str>,
}

impl IdempotencyLock {
    /// Creates a lock using the [`DEFAULT_PREFIX`].
    pub fn new(backend: BackendRef) -> Self {
        Self::with_prefix(backend, DEFAULT_PREFIX)
    }

    pub fn with_prefix(backend: BackendRef, prefix: impl Into<Arc<str>>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// The prefix of all isolation tokens.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &BackendRef {
        &self.backend
    }

    /// Derives the isolation token of `key`.
    pub fn isolate(&self, key: &str) -> String {
        let hash = Sha256::digest(key.trim().as_bytes());

        let mut token = String::with_capacity(self.prefix.len() + hash.len() * 2);
        token.push_str(&self.prefix);
        for b in hash {
            // writing to a `String` is infallible
            let _ = write!(token, "{b:02x}");
        }
        token
    }

    /// Tries to claim `key`.
    ///
    /// With a `value`, the entry is atomically created if absent, and `true` is returned if this
    /// call created it. Without a `value`, only the existence of the entry is checked, and `true`
    /// means that it is already present.
    ///
    /// If the result is `false` and `window` is [`Sliding`](Window::Sliding), the entry's TTL is
    /// re-armed to `ttl`.
    pub async fn claim(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Duration,
        window: Window,
    ) -> Result<bool, BackendError> {
        let token = self.isolate(key);
        tracing::debug!(token, ?ttl, %window, "Claiming idempotency token");

        let claimed = match value {
            Some(value) => self.backend.set_nx(&token, value, ttl).await?,
            None => self.backend.exists(&token).await?,
        };

        if !claimed && window == Window::Sliding {
            // repeated attempts keep extending the window, it is only released once no more
            // attempts were made for a full `ttl`
            self.backend.expire(&token, ttl).await?;
        }

        metric!(
            counter("lock.claim") += 1,
            "window" => window.as_str(),
            "acquired" => if claimed { "true" } else { "false" },
            "backend" => self.backend.name(),
        );

        Ok(claimed)
    }

    /// [`claim`](Self::claim) with a [`Sliding`](Window::Sliding) window.
    pub async fn claim_sliding(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.claim(key, value, ttl, Window::Sliding).await
    }

    /// [`claim`](Self::claim) with a [`Fixed`](Window::Fixed) window.
    pub async fn claim_fixed(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.claim(key, value, ttl, Window::Fixed).await
    }

    /// Like [`claim`](Self::claim), but fails with the error produced by `error` if the claim
    /// was not successful.
    pub async fn claim_or_else<E, F>(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Duration,
        window: Window,
        error: F,
    ) -> Result<(), E>
    where
        E: From<BackendError>,
        F: FnOnce() -> E,
    {
        if self.claim(key, value, ttl, window).await? {
            Ok(())
        } else {
            Err(error())
        }
    }

    /// Returns the value stored for `key`, without touching its TTL.
    pub async fn peek(&self, key: &str) -> Result<Option<String>, BackendError> {
        let token = self.isolate(key);
        self.backend.get(&token).await
    }

    /// Re-arms the TTL of `key`. Does nothing if it does not exist.
    pub async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        let token = self.isolate(key);
        tracing::debug!(token, ?ttl, "Refreshing idempotency token");
        self.backend.expire(&token, ttl).await
    }

    /// Deletes `key`, returning whether it existed.
    pub async fn release(&self, key: &str) -> Result<bool, BackendError> {
        let token = self.isolate(key);
        tracing::debug!(token, "Releasing idempotency token");
        self.backend.del(&token).await
    }
}
