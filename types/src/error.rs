//! Error families.
//!
//! - [`ProgrammerError`]: misuse of the API. Never retried.
//! - [`SyncError`]: what a cooperative task sees when it turns an asynchronous
//!   result back into a synchronous one (job failures, mapped deferred failures).
//! - [`FatalSchedulerError`]: escapes `run()` only. Deliberately not a variant of
//!   `SyncError` so code matching on `SyncError` can never swallow it.

use thiserror::Error;

use crate::Fault;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgrammerError {
    #[error("limit must be positive (got {limit})")]
    InvalidLimit { limit: usize },
    #[error("hooks supplied to {operation} while hooks are disabled")]
    HooksDisabled { operation: &'static str },
    #[error("No deferred status set yet: {diagnostic}")]
    Unresolved { diagnostic: String },
    #[error("deferred result was already consumed")]
    AlreadyConsumed,
    #[error("expected exactly one deferred value, got {count}")]
    UnexpectedArity { count: usize },
    #[error("reactor is not running")]
    ReactorNotRunning,
    #[error("reactor is already running")]
    ReactorAlreadyRunning,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// A job or producer failed; the fault is re-raised as-is.
    #[error(transparent)]
    Job(#[from] Fault),
    /// A deferred was failed by its producer.
    #[error("{message}")]
    Failure { message: String },
    /// A deferred was failed with an error carrying a timeout signature.
    #[error("execution expired")]
    Timeout,
    #[error(transparent)]
    Programmer(#[from] ProgrammerError),
}

impl SyncError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    #[must_use]
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Self::Job(fault) => Some(fault),
            _ => None,
        }
    }
}

// Lets job bodies returning `Result<_, Fault>` use `?` on bridged results.
impl From<SyncError> for Fault {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Job(fault) => fault,
            SyncError::Failure { .. } => Fault::capture_as("BridgeFailure", error),
            SyncError::Timeout => Fault::capture_as("TimeoutFailure", error),
            SyncError::Programmer(error) => Fault::from(error),
        }
    }
}

impl From<ProgrammerError> for Fault {
    fn from(error: ProgrammerError) -> Self {
        Fault::capture(error)
    }
}

#[derive(Debug, Error)]
#[error("fatal scheduler error: {fault}")]
pub struct FatalSchedulerError {
    #[source]
    fault: Fault,
}

impl FatalSchedulerError {
    #[must_use]
    pub fn new(fault: Fault) -> Self {
        Self { fault }
    }

    #[must_use]
    pub fn fault(&self) -> &Fault {
        &self.fault
    }

    #[must_use]
    pub fn into_fault(self) -> Fault {
        self.fault
    }
}
