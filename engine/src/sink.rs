//! Error sink: where swallowed failures go.

use strand_types::Fault;

/// Receives every failure the safety wrapper swallows.
///
/// Implementations must be `Send + Sync`: detached `defer` work reports from a
/// background thread.
pub trait ErrorSink: Send + Sync {
    fn log(&self, fault: &Fault, context: &str);
}

/// Default sink: one `tracing::error!` event per swallowed failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn log(&self, fault: &Fault, context: &str) {
        tracing::error!(
            context,
            kind = fault.kind(),
            message = fault.message(),
            "Swallowed failure"
        );
    }
}
