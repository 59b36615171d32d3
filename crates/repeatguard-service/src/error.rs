use std::time::Duration;

use thiserror::Error;

use crate::policy::DuplicateKind;

/// The error raised when a duplicate call is rejected.
///
/// This is the expected outcome for a duplicate that the
/// [`DuplicateHandler`](crate::strategy::DuplicateHandler) did not substitute a value for. It is
/// built from the [`RepeatPolicy`](crate::policy::RepeatPolicy) the operation was guarded with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DuplicateError {
    /// The declared kind of rejection.
    pub kind: DuplicateKind,
    /// The declared message.
    pub message: String,
}

impl DuplicateError {
    pub fn new(kind: DuplicateKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors produced by a guarded invocation.
///
/// Callers can tell an intended rejection ([`Duplicate`](Self::Duplicate)) apart from a
/// misconfigured guard ([`Config`](Self::Config)) and from anything that broke along the way
/// ([`Internal`](Self::Internal)).
#[derive(Debug, Error)]
pub enum GuardError {
    /// The uniqueness key could not be resolved, or no policy is registered for the operation.
    #[error("invalid guard configuration: {0}")]
    Config(String),

    /// The call was identified as a duplicate and rejected.
    #[error(transparent)]
    Duplicate(#[from] DuplicateError),

    /// An unexpected failure: the operation itself failed, the result could not be
    /// (de)serialized, the backend failed, or the operation panicked.
    ///
    /// The cause has already been logged when this variant is constructed.
    #[error("guarded call failed: {0:#}")]
    Internal(anyhow::Error),
}

impl GuardError {
    /// Logs the error and wraps it into [`Internal`](Self::Internal).
    #[track_caller]
    pub fn internal(error: impl Into<anyhow::Error>) -> Self {
        let error = error.into();
        let dynerr: &dyn std::error::Error = error.as_ref(); // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "guarded call failed");
        Self::Internal(error)
    }

    /// Translates the failure of a wrapped operation.
    ///
    /// A [`GuardError`] raised from within the operation (e.g. by a nested guarded call) is
    /// passed through unchanged, so duplicate rejections are never wrapped, and internal errors
    /// are not wrapped twice. Everything else becomes [`Internal`](Self::Internal).
    #[track_caller]
    pub fn from_operation(error: anyhow::Error) -> Self {
        match error.downcast::<GuardError>() {
            Ok(error) => error,
            Err(error) => Self::internal(error),
        }
    }

    /// Returns `true` if this is an intended duplicate rejection.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    /// A short, stable name for this error, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Duplicate(_) => "duplicate",
            Self::Internal(_) => "internal",
        }
    }
}

/// An error talking to the [`Backend`](crate::backend::Backend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend did not answer within the configured timeout.
    #[error("backend operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<BackendError> for GuardError {
    #[track_caller]
    fn from(error: BackendError) -> Self {
        Self::internal(error)
    }
}

impl From<serde_json::Error> for GuardError {
    #[track_caller]
    fn from(error: serde_json::Error) -> Self {
        Self::internal(error)
    }
}
