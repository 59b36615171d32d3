//! Request-level duplicate suppression for async operations.
//!
//! A [`RepeatGuard`](guard::RepeatGuard) wraps an operation together with a
//! [`RepeatPolicy`](policy::RepeatPolicy). For every uniqueness key derived from the call
//! arguments, the operation is executed at most once within the policy's protection window.
//! Duplicate calls either receive the original response or are rejected with the policy's
//! declared [`DuplicateError`](error::DuplicateError).
//!
//! All shared state lives in a [`Backend`](backend::Backend), so the guarantee holds across
//! processes and hosts as long as they share the same store.

#[macro_use]
pub mod metrics;

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod lock;
pub mod logging;
pub mod policy;
pub mod response;
pub mod strategy;
pub mod utils;

pub use context::InvocationContext;
pub use error::{DuplicateError, GuardError};
pub use guard::{GuardedOperation, RepeatGuard, RepeatGuardBuilder};
pub use lock::IdempotencyLock;
pub use policy::{DuplicateKind, RepeatPolicy, Window};
pub use response::CachedResponse;
pub use strategy::{
    DuplicateHandler, Invocation, LastResponseHandler, PointerTokenProvider, TokenProvider,
};
