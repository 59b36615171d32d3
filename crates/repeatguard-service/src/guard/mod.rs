//! Wraps operations into the two-phase idempotency protocol.
//!
//! For each call, the [`TokenProvider`] derives a uniqueness key from the arguments. Two entries
//! are derived from that key:
//!
//! - the *method lock*, which is claimed for the duration of the call so that at most one call
//!   per key and operation executes at any time,
//! - the *response entry*, which keeps the result of the first successful call around for
//!   [`RepeatPolicy::response_ttl`].
//!
//! The first call for a key claims the method lock, runs the operation and stores its result.
//! Every other call, whether it overlaps with the first one or comes in later, takes the
//! duplicate path: it never runs the operation and instead gets an answer from the
//! [`DuplicateHandler`], which either replays the stored response or rejects the call with the
//! policy's [`DuplicateError`](crate::error::DuplicateError).
//!
//! No call ever waits for another one. Correctness relies solely on the atomicity of
//! [`Backend::set_nx`](crate::backend::Backend::set_nx).

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::backend::{self, BackendRef};
use crate::config::Config;
use crate::context::InvocationContext;
use crate::error::GuardError;
use crate::lock::{self, DEFAULT_MARKER, DEFAULT_PREFIX, IdempotencyLock};
use crate::policy::{RepeatPolicy, Window};
use crate::response::CachedResponse;
use crate::strategy::{
    DuplicateHandler, Invocation, LastResponseHandler, PointerTokenProvider, TokenProvider,
};
use crate::utils::defer::{DeferGuard, defer};


/// Runs operations at most once per uniqueness key.
///
/// This is cheap to clone, and all clones share the same backend and registrations.
#[derive(Clone)]
pub struct RepeatGuard {
    lock: IdempotencyLock,
    tokens: Arc<dyn TokenProvider>,
    duplicates: Arc<dyn DuplicateHandler>,
    policies: Arc<BTreeMap<String, RepeatPolicy>>,
}

impl std::fmt::Debug for RepeatGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatGuard")
            .field("lock", &self.lock)
            .field("operations", &self.policies.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a [`RepeatGuard`].
pub struct RepeatGuardBuilder {
    backend: BackendRef,
    prefix: String,
    tokens: Arc<dyn TokenProvider>,
    duplicates: Arc<dyn DuplicateHandler>,
    policies: BTreeMap<String, RepeatPolicy>,
}

impl RepeatGuardBuilder {
    /// Sets the namespace prefix of isolation tokens. Defaults to `TMT_`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replaces the default [`PointerTokenProvider`].
    pub fn token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.tokens = Arc::new(provider);
        self
    }

    /// Replaces the default [`LastResponseHandler`].
    pub fn duplicate_handler(mut self, handler: impl DuplicateHandler + 'static) -> Self {
        self.duplicates = Arc::new(handler);
        self
    }

    /// Registers the policy of `operation`, used by [`RepeatGuard::invoke`].
    pub fn policy(mut self, operation: impl Into<String>, policy: RepeatPolicy) -> Self {
        self.policies.insert(operation.into(), policy);
        self
    }

    /// Registers all policies of `policies`.
    pub fn policies(mut self, policies: impl IntoIterator<Item = (String, RepeatPolicy)>) -> Self {
        self.policies.extend(policies);
        self
    }

    pub fn build(self) -> RepeatGuard {
        RepeatGuard {
            lock: IdempotencyLock::with_prefix(self.backend, self.prefix),
            tokens: self.tokens,
            duplicates: self.duplicates,
            policies: Arc::new(self.policies),
        }
    }
}

impl RepeatGuard {
    pub fn builder(backend: BackendRef) -> RepeatGuardBuilder {
        RepeatGuardBuilder {
            backend,
            prefix: DEFAULT_PREFIX.into(),
            tokens: Arc::new(PointerTokenProvider),
            duplicates: Arc::new(LastResponseHandler),
            policies: BTreeMap::new(),
        }
    }

    /// Creates a guard with the backend, prefix and operation policies of `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let backend = backend::from_config(&config.backend).await?;
        let guard = Self::builder(backend)
            .prefix(config.prefix.clone())
            .policies(config.operations.clone())
            .build();
        Ok(guard)
    }

    /// The lock through which all idempotency state is accessed.
    pub fn lock(&self) -> &IdempotencyLock {
        &self.lock
    }

    /// The policy registered for `operation`.
    pub fn policy(&self, operation: &str) -> Option<&RepeatPolicy> {
        self.policies.get(operation)
    }

    /// Returns a decorator running `operation` under `policy`.
    pub fn guarded(&self, operation: impl Into<Arc<str>>, policy: RepeatPolicy) -> GuardedOperation {
        GuardedOperation {
            guard: self.clone(),
            operation: operation.into(),
            policy: Arc::new(policy),
        }
    }

    /// Runs `f` under the policy registered for `operation`.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        operation: &str,
        arguments: &Value,
        f: F,
    ) -> Result<T, GuardError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<anyhow::Error>,
        F: FnOnce(InvocationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.policy(operation).ok_or_else(|| {
            GuardError::Config(format!("no policy registered for `{operation}`"))
        })?;
        self.invoke_with(operation, policy, arguments, f).await
    }

    /// Runs `f` under an explicit `policy`.
    pub async fn invoke_with<T, E, F, Fut>(
        &self,
        operation: &str,
        policy: &RepeatPolicy,
        arguments: &Value,
        f: F,
    ) -> Result<T, GuardError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<anyhow::Error>,
        F: FnOnce(InvocationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let invocation = Invocation {
            operation,
            arguments,
            policy,
        };
        metric!(counter("guard.access") += 1, "operation" => operation);

        let result = self.run(&invocation, f).await;
        if let Err(error) = &result {
            metric!(
                counter("guard.failure") += 1,
                "operation" => operation,
                "error" => error.metrics_tag(),
            );
        }
        result
    }

    async fn run<T, E, F, Fut>(&self, invocation: &Invocation<'_>, f: F) -> Result<T, GuardError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<anyhow::Error>,
        F: FnOnce(InvocationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self
            .tokens
            .resolve(invocation)
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                GuardError::Config(format!(
                    "no uniqueness key for `{}`",
                    invocation.operation
                ))
            })?;

        let method_key = lock::method_lock_key(&key, invocation.operation);
        let response_key = lock::response_key(self.lock.prefix(), &method_key);
        let policy = invocation.policy;

        let acquired = self
            .lock
            .claim(
                &method_key,
                Some(DEFAULT_MARKER),
                policy.method_lock_ttl,
                policy.window,
            )
            .await?;

        // if this call is dropped while holding the lock, release it in the background
        let release_guard = acquired.then(|| self.release_on_drop(method_key.clone()));

        // the response is read only after claiming, as the winner stores it before releasing
        let result = match self.lock.peek(&response_key).await {
            Ok(None) if acquired => self.execute(invocation, &key, &response_key, f).await,
            Ok(cached) => {
                self.duplicate(invocation, &response_key, cached.as_deref())
                    .await
            }
            Err(error) => Err(error.into()),
        };

        if let Some(guard) = release_guard {
            let _ = guard.disarm();
            release(&self.lock, &method_key).await;
        }

        result
    }

    /// The winning path: runs the operation and stores its response.
    async fn execute<T, E, F, Fut>(
        &self,
        invocation: &Invocation<'_>,
        key: &str,
        response_key: &str,
        f: F,
    ) -> Result<T, GuardError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<anyhow::Error>,
        F: FnOnce(InvocationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let operation = invocation.operation;
        let policy = invocation.policy;
        tracing::debug!(operation, "Executing guarded operation");
        metric!(counter("guard.execute") += 1, "operation" => operation);

        let context = InvocationContext::new();
        context.set(key);
        let _clear = defer({
            let context = context.clone();
            move || context.clear()
        });

        let start = Instant::now();
        let future = context.scope({
            let context = context.clone();
            async move { f(context).await }
        });
        let result = AssertUnwindSafe(future).catch_unwind().await;
        metric!(timer("guard.operation.duration") = start.elapsed(), "operation" => operation);

        let value = match result {
            Ok(Ok(value)) => value,
            Ok(Err(error)) => return Err(GuardError::from_operation(error.into())),
            Err(panic) => {
                return Err(GuardError::internal(anyhow::anyhow!(
                    "guarded operation `{operation}` panicked: {}",
                    panic_message(&*panic)
                )));
            }
        };

        let response = CachedResponse::capture(&value)?.to_json()?;
        let stored = self
            .lock
            .claim(
                response_key,
                Some(&response),
                policy.initial_response_ttl(),
                policy.window,
            )
            .await?;
        if !stored {
            // only possible if the method lock expired while the operation was still running
            tracing::warn!(operation, "A response for this call was already stored");
        }

        Ok(value)
    }

    /// The duplicate path: answers the call without running the operation.
    async fn duplicate<T>(
        &self,
        invocation: &Invocation<'_>,
        response_key: &str,
        cached: Option<&str>,
    ) -> Result<T, GuardError>
    where
        T: DeserializeOwned,
    {
        let operation = invocation.operation;
        let policy = invocation.policy;
        tracing::debug!(operation, "Handling duplicate call");
        metric!(
            counter("guard.duplicate") += 1,
            "operation" => operation,
            "cached" => if cached.is_some() { "true" } else { "false" },
        );

        let last_response = cached.map(CachedResponse::from_json).transpose()?;
        // a fixed window response expires at a fixed offset from the first successful call
        if let (Some(response), Window::Sliding) = (&last_response, policy.window) {
            match policy.response_refresh_ttl(response.age()) {
                Some(ttl) => self.lock.refresh(response_key, ttl).await?,
                None => tracing::debug!(operation, "Cached response reached its maximum age"),
            }
        }

        let handled = self
            .duplicates
            .handle(invocation, last_response.as_ref(), policy.use_last_response)
            .map_err(GuardError::from_operation)?;

        match handled {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => {
                metric!(counter("guard.duplicate.rejected") += 1, "operation" => operation);
                Err(policy.duplicate_error().into())
            }
        }
    }

    fn release_on_drop(&self, method_key: String) -> DeferGuard<impl FnOnce()> {
        let lock = self.lock.clone();
        defer(move || match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release(&lock, &method_key).await });
            }
            Err(_) => {
                tracing::warn!(
                    method_key,
                    "Guarded call was dropped outside of a runtime, its lock expires after its TTL"
                );
            }
        })
    }
}

async fn release(lock: &IdempotencyLock, method_key: &str) {
    if let Err(error) = lock.release(method_key).await {
        let dynerr: &dyn std::error::Error = &error; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "Failed to release method lock");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "Box<dyn Any>"
    }
}

/// An operation bound to its policy, see [`RepeatGuard::guarded`].
#[derive(Clone, Debug)]
pub struct GuardedOperation {
    guard: RepeatGuard,
    operation: Arc<str>,
    policy: Arc<RepeatPolicy>,
}

impl GuardedOperation {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn policy(&self) -> &RepeatPolicy {
        &self.policy
    }

    /// Runs `f` as one call of this operation.
    pub async fn call<T, E, F, Fut>(&self, arguments: &Value, f: F) -> Result<T, GuardError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<anyhow::Error>,
        F: FnOnce(InvocationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guard
            .invoke_with(&self.operation, &self.policy, arguments, f)
            .await
    }
}
