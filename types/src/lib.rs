//! Core domain types for Strand.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

mod error;
mod fault;

pub use error::{FatalSchedulerError, ProgrammerError, SyncError};
pub use fault::{Fault, PANIC_KIND};

use serde::Deserialize;

/// What `run()` does with a failure escaping the reactor body.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Log through the error sink and keep the process alive.
    #[default]
    Log,
    /// Wrap in [`FatalSchedulerError`] and return it from `run()`.
    Raise,
}

impl ErrorPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Raise => "raise",
        }
    }
}
