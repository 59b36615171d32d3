//! Pluggable policies for deriving uniqueness keys and answering duplicate calls.

use serde_json::Value;

use crate::policy::RepeatPolicy;
use crate::response::CachedResponse;

/// The identity of a single guarded call.
#[derive(Clone, Copy, Debug)]
pub struct Invocation<'a> {
    /// The name of the guarded operation.
    pub operation: &'a str,
    /// The arguments of the call, as a JSON document.
    pub arguments: &'a Value,
    /// The policy the call is guarded with.
    pub policy: &'a RepeatPolicy,
}

/// Derives the uniqueness key of a call.
///
/// Returning `None`, or a key that is blank, is treated as a misconfiguration of the guarded
/// operation.
pub trait TokenProvider: Send + Sync {
    fn resolve(&self, invocation: &Invocation<'_>) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn(&Invocation<'_>) -> Option<String> + Send + Sync,
{
    fn resolve(&self, invocation: &Invocation<'_>) -> Option<String> {
        self(invocation)
    }
}

/// Resolves [`RepeatPolicy::token_keys`] as JSON pointers into the call arguments.
///
/// The resolved parts are joined with `:`. Strings are used verbatim, all other values with
/// their compact JSON rendering. If any pointer does not resolve to a non-null value, no key is
/// produced.
#[derive(Clone, Copy, Debug, Default)]
pub struct PointerTokenProvider;

impl TokenProvider for PointerTokenProvider {
    fn resolve(&self, invocation: &Invocation<'_>) -> Option<String> {
        let keys = &invocation.policy.token_keys;
        if keys.is_empty() {
            return None;
        }

        let mut parts = Vec::with_capacity(keys.len());
        for pointer in keys {
            let part = match invocation.arguments.pointer(pointer)? {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            parts.push(part);
        }

        Some(parts.join(":"))
    }
}

/// Decides what a duplicate call returns.
pub trait DuplicateHandler: Send + Sync {
    /// Handles a duplicate call.
    ///
    /// `last_response` is the response of the first successful call, if it is still cached.
    /// Returning `Some` makes the duplicate call succeed with that value, which has to
    /// deserialize into the operation's result type. Returning `None` rejects the call with the
    /// policy's [`DuplicateError`](crate::error::DuplicateError).
    fn handle(
        &self,
        invocation: &Invocation<'_>,
        last_response: Option<&CachedResponse>,
        use_last_response: bool,
    ) -> anyhow::Result<Option<Value>>;
}

impl<F> DuplicateHandler for F
where
    F: Fn(&Invocation<'_>, Option<&CachedResponse>, bool) -> anyhow::Result<Option<Value>>
        + Send
        + Sync,
{
    fn handle(
        &self,
        invocation: &Invocation<'_>,
        last_response: Option<&CachedResponse>,
        use_last_response: bool,
    ) -> anyhow::Result<Option<Value>> {
        self(invocation, last_response, use_last_response)
    }
}

/// Replays the cached response of the first call, if the policy allows it.
#[derive(Clone, Copy, Debug, Default)]
pub struct LastResponseHandler;

impl DuplicateHandler for LastResponseHandler {
    fn handle(
        &self,
        _invocation: &Invocation<'_>,
        last_response: Option<&CachedResponse>,
        use_last_response: bool,
    ) -> anyhow::Result<Option<Value>> {
        match last_response {
            Some(response) if use_last_response => Ok(Some(response.payload()?)),
            _ => Ok(None),
        }
    }
}
