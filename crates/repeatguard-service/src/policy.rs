use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DuplicateError;

/// The expiry discipline of a claimed entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    /// The TTL is set once, when the entry is first claimed.
    ///
    /// The entry expires at a fixed offset from the first claim, no matter how many duplicate
    /// attempts are made in between.
    Fixed,
    /// Every failed claim re-arms the TTL.
    ///
    /// The entry only expires after a quiet period of `ttl` without any further attempts.
    #[default]
    Sliding,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Fixed => "fixed",
            Window::Sliding => "sliding",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of error raised for a rejected duplicate.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    /// The request was already made.
    #[default]
    Repeated,
    /// The request conflicts with one that is still being processed.
    Conflict,
    /// The caller retries too eagerly.
    TooManyRequests,
    /// A generic rejection.
    Rejected,
}

impl DuplicateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateKind::Repeated => "repeated request",
            DuplicateKind::Conflict => "conflict",
            DuplicateKind::TooManyRequests => "too many requests",
            DuplicateKind::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DuplicateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The declared policy of a guarded operation.
///
/// Policies are registered per operation name on the
/// [`RepeatGuardBuilder`](crate::guard::RepeatGuardBuilder), loaded from the
/// [`Config`](crate::config::Config), or handed to
/// [`RepeatGuard::guarded`](crate::guard::RepeatGuard::guarded) directly.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RepeatPolicy {
    /// The expiry discipline of both the method lock and the cached response.
    pub window: Window,

    /// How long the method lock protects an in-flight call.
    ///
    /// If the winning call crashes, other callers can only claim the operation again after this
    /// expired.
    #[serde(with = "humantime_serde")]
    pub method_lock_ttl: Duration,

    /// How long the response of the first successful call is kept for duplicates.
    #[serde(with = "humantime_serde")]
    pub response_ttl: Duration,

    /// Upper bound for the lifetime of a cached response.
    ///
    /// With a sliding window, duplicate calls re-arm the response TTL. Without a bound, a key
    /// that is retried more often than `response_ttl` keeps its response alive forever. The
    /// bound also applies when the response is first stored.
    #[serde(with = "humantime_serde")]
    pub max_response_age: Option<Duration>,

    /// The kind of error raised for rejected duplicates.
    pub error: DuplicateKind,

    /// The message of the error raised for rejected duplicates.
    pub message: String,

    /// Whether duplicates may receive the cached response of the first call.
    ///
    /// This is handed to the [`DuplicateHandler`](crate::strategy::DuplicateHandler).
    pub use_last_response: bool,

    /// JSON pointers into the call arguments which form the uniqueness key.
    ///
    /// Used by the [`PointerTokenProvider`](crate::strategy::PointerTokenProvider).
    pub token_keys: Vec<String>,
}

impl Default for RepeatPolicy {
    fn default() -> Self {
        Self {
            window: Window::Sliding,
            method_lock_ttl: Duration::from_secs(10),
            response_ttl: Duration::from_secs(60),
            max_response_age: None,
            error: DuplicateKind::Repeated,
            message: "repeated request".into(),
            use_last_response: false,
            token_keys: Vec::new(),
        }
    }
}

impl RepeatPolicy {
    /// Creates the default policy with the given window discipline.
    pub fn new(window: Window) -> Self {
        Self {
            window,
            ..Default::default()
        }
    }

    pub fn method_lock_ttl(mut self, ttl: Duration) -> Self {
        self.method_lock_ttl = ttl;
        self
    }

    pub fn response_ttl(mut self, ttl: Duration) -> Self {
        self.response_ttl = ttl;
        self
    }

    pub fn max_response_age(mut self, age: Duration) -> Self {
        self.max_response_age = Some(age);
        self
    }

    pub fn reject_with(mut self, kind: DuplicateKind, message: impl Into<String>) -> Self {
        self.error = kind;
        self.message = message.into();
        self
    }

    pub fn use_last_response(mut self, use_last_response: bool) -> Self {
        self.use_last_response = use_last_response;
        self
    }

    pub fn token_key(mut self, pointer: impl Into<String>) -> Self {
        self.token_keys.push(pointer.into());
        self
    }

    /// Builds the error raised for a rejected duplicate.
    pub fn duplicate_error(&self) -> DuplicateError {
        DuplicateError::new(self.error, self.message.clone())
    }

    /// The TTL the response of the first successful call is stored with.
    ///
    /// This is [`response_ttl`](Self::response_ttl), bounded by
    /// [`max_response_age`](Self::max_response_age).
    pub fn initial_response_ttl(&self) -> Duration {
        match self.max_response_age {
            Some(max_age) => max_age.min(self.response_ttl),
            None => self.response_ttl,
        }
    }

    /// The TTL a duplicate call re-arms the cached response with.
    ///
    /// Only responses of a [`Window::Sliding`] policy are re-armed.
    ///
    /// This is the full [`response_ttl`](Self::response_ttl), clamped so that the response does
    /// not outlive [`max_response_age`](Self::max_response_age). Returns `None` if the response
    /// has already reached its maximum age and must not be extended anymore.
    pub fn response_refresh_ttl(&self, age: Duration) -> Option<Duration> {
        match self.max_response_age {
            None => Some(self.response_ttl),
            Some(max_age) => {
                let remaining = max_age.checked_sub(age).filter(|d| !d.is_zero())?;
                Some(remaining.min(self.response_ttl))
            }
        }
    }
}
