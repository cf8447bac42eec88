//! `Fault`: a failure carried as a plain value.
//!
//! Task bodies, job bodies and deferred producers never let a failure unwind
//! across a task, slot or thread boundary. They hand it over as a `Fault`
//! instead, and the receiving side decides whether to log it, aggregate it,
//! or turn it back into an error return.

use std::any::Any;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Kind reported for faults produced from a caught panic.
pub const PANIC_KIND: &str = "panic";

/// A captured failure: a short type name, a message, and optionally the
/// original error for structured access.
#[derive(Clone)]
pub struct Fault {
    kind: Cow<'static, str>,
    message: String,
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl Fault {
    pub fn new(kind: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Capture a typed error. The kind is the error's unqualified type name.
    pub fn capture<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind: Cow::Borrowed(short_type_name::<E>()),
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    /// Capture a typed error under an explicit kind.
    pub fn capture_as<E>(kind: &'static str, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind: Cow::Borrowed(kind),
            ..Self::capture(error)
        }
    }

    /// Build a fault from the payload of a caught panic.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self::new(PANIC_KIND, message)
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.kind == PANIC_KIND
    }

    /// Append text to the message in place.
    pub fn append_message(&mut self, text: &str) {
        self.message.push_str(text);
    }

    /// `"{kind}: {message}"`, the form used when faults are listed together.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }

    /// Access the original error, if this fault was captured from one of type `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.source.as_deref()?.downcast_ref::<E>()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl StdError for Fault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Fault {
    fn from(error: std::io::Error) -> Self {
        Self::capture(error)
    }
}

impl From<anyhow::Error> for Fault {
    fn from(error: anyhow::Error) -> Self {
        let message = format!("{error:#}");
        let source: Box<dyn StdError + Send + Sync + 'static> = error.into();
        Self {
            kind: Cow::Borrowed("Error"),
            message,
            source: Some(Arc::from(source)),
        }
    }
}

/// Unqualified type name: `std::io::error::Error` -> `Error`,
/// `core::num::ParseIntError` -> `ParseIntError`. Generic arguments are dropped.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
