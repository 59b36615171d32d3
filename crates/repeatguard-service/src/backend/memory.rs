use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::ops::compute::{CompResult, Op};

use crate::error::BackendError;

use super::Backend;

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    /// When this item expires.
    deadline: Instant,
    /// The stored value.
    value: Arc<str>,
}

impl InMemoryItem {
    fn new(value: &str, ttl: Duration, now: Instant) -> Self {
        Self {
            deadline: now + ttl,
            value: value.into(),
        }
    }

    /// moka evicts expired items lazily, so every access double-checks the deadline.
    fn is_alive(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] [`Instant`] as the explicit
/// expiration time.
struct ItemExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<String, InMemoryItem> for ItemExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &InMemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &InMemoryItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// A process-local [`Backend`].
///
/// All primitives are implemented on top of moka's atomic compute API, which makes
/// [`set_nx`](Backend::set_nx) atomic across all tasks and threads sharing this backend. State is
/// not shared across processes.
#[derive(Clone)]
pub struct InMemoryBackend {
    cache: moka::sync::Cache<String, InMemoryItem>,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl InMemoryBackend {
    pub fn new(max_capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(max_capacity)
            .name("repeatguard")
            .expire_after(ItemExpiration)
            .build();
        Self { cache }
    }

    /// Returns how long `key` still lives, or `None` if it does not exist.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.cache
            .get(key)
            .filter(|item| item.is_alive(now))
            .map(|item| item.deadline - now)
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        let result = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|entry| match entry {
                Some(entry) if entry.value().is_alive(now) => Op::Nop,
                _ => Op::Put(InMemoryItem::new(value, ttl, now)),
            });

        Ok(matches!(
            result,
            CompResult::Inserted(_) | CompResult::ReplacedWith(_)
        ))
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        Ok(self
            .cache
            .get(key)
            .is_some_and(|item| item.is_alive(now)))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let now = Instant::now();
        Ok(self
            .cache
            .get(key)
            .filter(|item| item.is_alive(now))
            .map(|item| item.value.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        let now = Instant::now();
        self.cache
            .entry_by_ref(key)
            .and_compute_with(|entry| match entry {
                Some(entry) if entry.value().is_alive(now) => {
                    let value = Arc::clone(&entry.value().value);
                    Op::Put(InMemoryItem {
                        deadline: now + ttl,
                        value,
                    })
                }
                _ => Op::Nop,
            });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        let result = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|entry| match entry {
                Some(_) => Op::Remove,
                None => Op::Nop,
            });

        Ok(match result {
            CompResult::Removed(entry) => entry.value().is_alive(now),
            _ => false,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
