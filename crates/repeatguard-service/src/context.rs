//! The uniqueness key of the guarded call that is currently executing.
//!
//! Every guarded call creates its own [`InvocationContext`], hands it to the wrapped operation,
//! and additionally installs it as a tokio task-local for code that has no access to the
//! handle. The key is cleared as soon as the guarded call finishes, no matter how it finishes.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinHandle;

tokio::task_local! {
    static CURRENT: InvocationContext;
}

/// A shared slot holding the uniqueness key of a guarded call.
///
/// Clones share the slot, so child tasks holding a clone observe the cleared state once the
/// guarded call is done.
#[derive(Clone, Debug, Default)]
pub struct InvocationContext {
    token: Arc<RwLock<Option<Arc<str>>>>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<Arc<str>>) {
        let mut slot = self.token.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(token.into());
    }

    pub fn get(&self) -> Option<Arc<str>> {
        let slot = self.token.read().unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    pub fn clear(&self) {
        let mut slot = self.token.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    /// The context of the guarded call enclosing the current task, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Shorthand for the uniqueness key of the enclosing guarded call.
    pub fn current_token() -> Option<Arc<str>> {
        Self::current().and_then(|context| context.get())
    }

    /// Runs `future` with this context installed as the [`current`](Self::current) one.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT.scope(self.clone(), future).await
    }

    /// Spawns a child task which inherits this context.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(CURRENT.scope(self.clone(), future))
    }
}
