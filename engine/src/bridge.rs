//! Deferred result bridge.
//!
//! Turns a single-resolution, callback-style asynchronous result into a
//! synchronous value or error inside a cooperative task.
//!
//! ```text
//! producer (any thread)                      consumer (cooperative task)
//! ensure_callback(&d, body) --succeed-->  d  --wait().await--> map_deferred_result(&d)
//!                           --fail------>                       -> Values<T> | SyncError
//! ```
//!
//! A producer failure that was *caught* travels as a success carrying a
//! [`Fault`]; `map_deferred_result` re-raises it. A producer failure that was
//! *reported* through `fail(payload)` is classified: timeout signature,
//! I/O error, or opaque payload.

use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures_util::FutureExt;
use regex::Regex;
use strand_types::{Fault, ProgrammerError, SyncError};
use tokio::sync::Notify;

/// Rendered diagnostics longer than this are truncated.
pub const DIAGNOSTIC_LIMIT: usize = 100;

const TRUNCATED_KEEP: usize = 92;

const TRUNCATION_SUFFIX: &str = "...TRUNC";

/// Success arguments of a resolved deferred.
///
/// `One(v)` and `Many(vs)` keep "one result" apart from "many results": a
/// deferred of `Vec<T>` succeeding with `One(vec)` yields the vector back
/// unchanged, while `Many(vs)` is splatted into separate arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Values<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Values<T> {
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }

    fn from_args(mut args: Vec<T>) -> Self {
        if args.len() == 1
            && let Some(value) = args.pop()
        {
            return Self::One(value);
        }
        Self::Many(args)
    }
}

impl<T> From<T> for Values<T> {
    fn from(value: T) -> Self {
        Self::One(value)
    }
}

/// The error a transport attached to a failure payload.
#[derive(Debug)]
pub enum TransportError {
    Message(String),
    /// OS-level error. Rendered with its `Display` text rather than truncated `Debug`.
    Io(io::Error),
}

impl TransportError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Message(message) => timeout_pattern().is_match(message),
            Self::Io(err) => err.kind() == io::ErrorKind::TimedOut,
        }
    }
}

fn timeout_pattern() -> &'static Regex {
    static TIMEOUT_PATTERN: OnceLock<Regex> = OnceLock::new();
    TIMEOUT_PATTERN.get_or_init(|| Regex::new(r"(?i)timeout").expect("valid timeout regex"))
}

/// A value handed to [`Deferred::fail`].
///
/// Payloads that carry a transport error expose it through `error()`; the
/// bridge uses it to classify timeouts.
pub trait FailurePayload: fmt::Debug {
    fn error(&self) -> Option<&TransportError> {
        None
    }
}

impl FailurePayload for String {}

impl FailurePayload for &'static str {}

impl FailurePayload for Fault {}

/// Failure payload produced by a transport: its error plus whatever response
/// text was available.
#[derive(Debug)]
pub struct TransportFailure {
    pub error: TransportError,
    pub response: Option<String>,
}

impl TransportFailure {
    pub fn new(error: TransportError) -> Self {
        Self {
            error,
            response: None,
        }
    }
}

impl FailurePayload for TransportFailure {
    fn error(&self) -> Option<&TransportError> {
        Some(&self.error)
    }
}

/// Observable resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Succeeded,
    Failed,
    /// Resolved and already read by [`map_deferred_result`].
    Consumed,
}

/// What a deferred succeeded with.
enum Success<T> {
    Args(Vec<T>),
    Fault(Fault),
}

enum State<T, P> {
    Pending,
    Succeeded(Success<T>),
    Failed(P),
    Consumed,
}

impl<T, P> State<T, P> {
    fn status(&self) -> Status {
        match self {
            Self::Pending => Status::Pending,
            Self::Succeeded(_) => Status::Succeeded,
            Self::Failed(_) => Status::Failed,
            Self::Consumed => Status::Consumed,
        }
    }
}

struct Shared<T, P> {
    state: Mutex<State<T, P>>,
    resolved: Notify,
}

/// Single-resolution asynchronous result.
///
/// Clones share the same underlying state, so one clone can be moved to a
/// producer thread while the consumer waits on another. The first resolution
/// wins; later `succeed`/`fail` calls return `false` and are ignored.
pub struct Deferred<T, P = TransportFailure> {
    shared: Arc<Shared<T, P>>,
}

impl<T, P> Clone for Deferred<T, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, P> Default for Deferred<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P> fmt::Debug for Deferred<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("status", &self.status())
            .finish()
    }
}

impl<T, P> Deferred<T, P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending),
                resolved: Notify::new(),
            }),
        }
    }

    /// Resolve successfully with zero or more values.
    pub fn succeed(&self, args: Vec<T>) -> bool {
        self.resolve(State::Succeeded(Success::Args(args)))
    }

    /// Resolve successfully with a caught failure as the value.
    pub fn succeed_with_fault(&self, fault: Fault) -> bool {
        self.resolve(State::Succeeded(Success::Fault(fault)))
    }

    pub fn fail(&self, payload: P) -> bool {
        self.resolve(State::Failed(payload))
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.lock().status()
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status() != Status::Pending
    }

    /// Suspend the calling task until the deferred is resolved.
    pub async fn wait(&self) {
        loop {
            let mut notified = pin!(self.shared.resolved.notified());
            notified.as_mut().enable();
            if self.is_resolved() {
                return;
            }
            notified.await;
        }
    }

    fn resolve(&self, next: State<T, P>) -> bool {
        {
            let mut state = self.lock();
            if !matches!(*state, State::Pending) {
                return false;
            }
            *state = next;
        }
        self.shared.resolved.notify_waiters();
        true
    }

    /// Take the resolution out, leaving `Consumed`. `Pending` is left in place.
    fn take(&self) -> State<T, P> {
        let mut state = self.lock();
        if matches!(*state, State::Pending) {
            return State::Pending;
        }
        std::mem::replace(&mut *state, State::Consumed)
    }

    fn lock(&self) -> MutexGuard<'_, State<T, P>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run `body`, handing back a failure (returned or panicked) as a value.
pub fn return_exception<R, F>(body: F) -> Result<R, Fault>
where
    F: FnOnce() -> Result<R, Fault>,
{
    panic::catch_unwind(AssertUnwindSafe(body))
        .unwrap_or_else(|payload| Err(Fault::from_panic(payload)))
}

/// Async counterpart of [`return_exception`] for task and job bodies.
pub async fn return_exception_async<R, Fut>(body: Fut) -> Result<R, Fault>
where
    Fut: Future<Output = Result<R, Fault>>,
{
    AssertUnwindSafe(body)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(Fault::from_panic(payload)))
}

/// Run `body` and resolve `deferred` with its outcome. Always succeeds the
/// deferred: a failure becomes the success value.
pub fn ensure_callback<T, P, R, F>(deferred: &Deferred<T, P>, body: F) -> bool
where
    F: FnOnce() -> Result<R, Fault>,
    R: Into<Values<T>>,
{
    match return_exception(body) {
        Ok(values) => deferred.succeed(values.into().into_vec()),
        Err(fault) => deferred.succeed_with_fault(fault),
    }
}

/// Read a resolved deferred as a synchronous result.
///
/// Must only be called once resolution is guaranteed, after
/// [`Deferred::wait`] or from the resolving side.
pub fn map_deferred_result<T, P>(deferred: &Deferred<T, P>) -> Result<Values<T>, SyncError>
where
    P: FailurePayload,
{
    match deferred.take() {
        State::Succeeded(Success::Args(args)) => Ok(Values::from_args(args)),
        State::Succeeded(Success::Fault(fault)) => Err(SyncError::Job(fault)),
        State::Failed(payload) => Err(map_failure(&payload)),
        State::Pending => Err(ProgrammerError::Unresolved {
            diagnostic: format_inspect(&Status::Pending),
        }
        .into()),
        State::Consumed => Err(ProgrammerError::AlreadyConsumed.into()),
    }
}

fn map_failure<P: FailurePayload>(payload: &P) -> SyncError {
    let Some(error) = payload.error() else {
        return SyncError::Failure {
            message: format_inspect(payload),
        };
    };

    if error.is_timeout() {
        return SyncError::Timeout;
    }

    let error_text = match error {
        TransportError::Io(err) => err.to_string(),
        TransportError::Message(_) => format_inspect(error),
    };
    SyncError::Failure {
        message: format_failure(&error_text, &format_inspect(payload)),
    }
}

fn format_failure(error: &str, result: &str) -> String {
    format!("ERROR = {error}; RESULT = {result}")
}

/// Render a value with `Debug` and truncate it for inclusion in a message.
pub fn format_inspect<V: fmt::Debug + ?Sized>(value: &V) -> String {
    truncate_diagnostic(&format!("{value:?}"))
}

/// Keep diagnostics at most [`DIAGNOSTIC_LIMIT`] characters: longer text keeps
/// its first 92 characters followed by `...TRUNC`.
#[must_use]
pub fn truncate_diagnostic(text: &str) -> String {
    if text.chars().count() <= DIAGNOSTIC_LIMIT {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(TRUNCATED_KEEP).collect();
    truncated.push_str(TRUNCATION_SUFFIX);
    truncated
}
