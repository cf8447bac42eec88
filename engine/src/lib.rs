//! Cooperative scheduling for Strand.
//!
//! Four pieces on top of a single-threaded reactor:
//! - [`Scheduler`]: the only way in to the reactor (run/stop, timers, ticks,
//!   background `defer`), with the safety wrapper and lifecycle hooks.
//! - [`WorkerPool`]: caps how many jobs run at once, with merge/cancel dedup.
//! - [`ParallelJoin`]: fan out N jobs, wait for all, results in submission order.
//! - [`bridge`]: turns a callback-style [`Deferred`] into a plain result.

pub mod bridge;
mod config;
mod join;
mod pool;
mod scheduler;
mod sink;

pub use bridge::{
    Deferred, FailurePayload, Status, TransportError, TransportFailure, Values, ensure_callback,
    map_deferred_result, return_exception, return_exception_async,
};
pub use config::{ConfigError, SchedulerSection, StrandConfig, config_path};
pub use join::{ParallelJoin, Resolved, SIBLING_SEPARATOR};
pub use pool::{
    Job, JobFuture, Merge, PendingJobs, WORKER_CONTEXT, WorkerPool, supersede, yield_to_pending,
};
pub use scheduler::{
    ExceptionHook, Hook, HookSet, ScheduleArgs, ScheduleKind, Scheduler, SchedulerConfig,
    SchedulingContext, TimerHandle,
};
pub use sink::{ErrorSink, TracingSink};

pub use strand_types::{
    ErrorPolicy, FatalSchedulerError, Fault, PANIC_KIND, ProgrammerError, SyncError,
};
