//! Scheduler proxy: the single entry point to the reactor.
//!
//! The reactor is a tokio current-thread runtime driving a [`LocalSet`]. Every
//! task runs on the thread that called [`Scheduler::run`], one at a time,
//! switching only at `.await` points. Nothing else in this crate touches tokio
//! scheduling directly, so tests can construct a scheduler with their own
//! sink and configuration.
//!
//! Each scheduled body is wrapped in the safety wrapper: a failure is handed to
//! the [`ErrorSink`] with the operation name as context. With the wrapper
//! disabled the failure escapes instead. It stops the reactor and comes back
//! from `run()` as a [`FatalSchedulerError`].

mod hooks;

pub use hooks::{
    ExceptionHook, Hook, HookSet, ScheduleArgs, ScheduleKind, SchedulingContext,
};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Waker};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{self, Either, LocalBoxFuture};
use strand_types::{ErrorPolicy, FatalSchedulerError, Fault, ProgrammerError, SyncError};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, LocalSet};
use tokio::time::{self, MissedTickBehavior};

use crate::bridge::{
    Deferred, Values, ensure_callback, map_deferred_result, return_exception,
    return_exception_async,
};
use crate::sink::{ErrorSink, TracingSink};

/// Shortest period a periodic timer will tick at.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Runtime switches, resolved once from configuration and passed in explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub safety_wrapper: bool,
    pub hooks_enabled: bool,
    pub error_policy: ErrorPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            safety_wrapper: true,
            hooks_enabled: true,
            error_policy: ErrorPolicy::Log,
        }
    }
}

/// Handle to a scheduled timer or tick. Dropping it does not cancel.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    task: AbortHandle,
}

impl TimerHandle {
    /// Cancel the timer. A body already running is abandoned at its next
    /// suspension point; its `on_end` listeners still fire.
    pub fn cancel(&self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    sink: Arc<dyn ErrorSink>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    escaped: RefCell<Option<Fault>>,
    shutdown: Notify,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("running", &self.inner.running.get())
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default(), Arc::new(TracingSink))
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            inner: Rc::new(Inner {
                config,
                sink,
                running: Cell::new(false),
                stop_requested: Cell::new(false),
                escaped: RefCell::new(None),
                shutdown: Notify::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.inner.config
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.inner.sink
    }

    #[must_use]
    pub fn reactor_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Start the reactor, run `body` as its first task, and block until
    /// [`stop`](Self::stop) is called.
    ///
    /// Returns `Ok(Some(value))` when the body finished before the stop,
    /// `Ok(None)` when the reactor stopped first or a failure was logged under
    /// [`ErrorPolicy::Log`]. A failure is returned as [`FatalSchedulerError`]
    /// under [`ErrorPolicy::Raise`] or whenever the safety wrapper is off.
    pub fn run<F, Fut, T>(
        &self,
        policy: ErrorPolicy,
        body: F,
    ) -> Result<Option<T>, FatalSchedulerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        if self.reactor_running() {
            return Err(FatalSchedulerError::new(Fault::capture(
                ProgrammerError::ReactorAlreadyRunning,
            )));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| FatalSchedulerError::new(Fault::from(err)))?;
        let local = LocalSet::new();

        self.inner.running.set(true);
        self.inner.stop_requested.set(false);
        self.inner.escaped.take();
        tracing::debug!(policy = policy.as_str(), "Reactor starting");

        let outcome = local.block_on(&runtime, self.drive(body));

        self.inner.running.set(false);
        {
            // Tasks left behind belong to the stopped reactor.
            let _guard = runtime.enter();
            drop(local);
        }
        tracing::debug!(failed = outcome.is_err(), "Reactor stopped");

        match outcome {
            Ok(value) => Ok(value),
            Err(fault) => self.settle(policy, fault),
        }
    }

    /// Run `body` and stop the reactor as soon as it returns.
    pub fn run_and_stop<F, Fut, T>(&self, body: F) -> Result<Option<T>, FatalSchedulerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let this = self.clone();
        self.run(self.inner.config.error_policy, move || async move {
            let value = body().await?;
            this.stop();
            Ok(value)
        })
    }

    /// Ask the reactor to stop after the current task yields.
    pub fn stop(&self) {
        if !self.reactor_running() {
            tracing::warn!("stop() called while the reactor is not running");
            return;
        }
        tracing::debug!("Reactor stop requested");
        self.inner.stop_requested.set(true);
        self.inner.shutdown.notify_waiters();
        // One no-op turn so an idle reactor notices without waiting on a timer.
        tokio::task::spawn_local(async {});
    }

    pub async fn sleep(&self, duration: Duration) {
        time::sleep(duration).await;
    }

    /// Let every other ready task run before continuing.
    pub async fn yield_to_reactor(&self) {
        tokio::task::yield_now().await;
    }

    pub fn add_timer<F, Fut>(
        &self,
        delay: Duration,
        body: F,
    ) -> Result<TimerHandle, ProgrammerError>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<(), Fault>> + 'static,
    {
        self.schedule(
            ScheduleKind::Timer(delay),
            ScheduleArgs::new(),
            HookSet::new(),
            once(body),
        )
    }

    pub fn add_periodic_timer<F, Fut>(
        &self,
        period: Duration,
        body: F,
    ) -> Result<TimerHandle, ProgrammerError>
    where
        F: FnMut() -> Fut + 'static,
        Fut: Future<Output = Result<(), Fault>> + 'static,
    {
        self.schedule(
            ScheduleKind::PeriodicTimer(period),
            ScheduleArgs::new(),
            HookSet::new(),
            body,
        )
    }

    pub fn next_tick<F, Fut>(&self, body: F) -> Result<TimerHandle, ProgrammerError>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<(), Fault>> + 'static,
    {
        self.schedule(
            ScheduleKind::NextTick,
            ScheduleArgs::new(),
            HookSet::new(),
            once(body),
        )
    }

    /// Admit a scheduled operation.
    ///
    /// `on_schedule` listeners fire before this returns. The remaining
    /// listeners fire around each invocation of `body` on the reactor.
    pub fn schedule<F, Fut>(
        &self,
        kind: ScheduleKind,
        args: ScheduleArgs,
        hooks: HookSet,
        mut body: F,
    ) -> Result<TimerHandle, ProgrammerError>
    where
        F: FnMut() -> Fut + 'static,
        Fut: Future<Output = Result<(), Fault>> + 'static,
    {
        if !hooks.is_empty() && !self.inner.config.hooks_enabled {
            return Err(ProgrammerError::HooksDisabled {
                operation: kind.operation(),
            });
        }
        if !self.reactor_running() {
            return Err(ProgrammerError::ReactorNotRunning);
        }

        let mut context = SchedulingContext::new(kind, args);
        hooks.fire_schedule(&mut context);
        tracing::debug!(operation = kind.operation(), "Scheduled");

        let invocation = Invocation {
            scheduler: self.clone(),
            hooks,
            context: RefCell::new(context),
        };
        let task = async move {
            match kind {
                ScheduleKind::NextTick => invocation.invoke(async { body().await }).await,
                ScheduleKind::Timer(delay) => {
                    time::sleep(delay).await;
                    invocation.invoke(async { body().await }).await;
                }
                ScheduleKind::PeriodicTimer(period) => {
                    let period = period.max(MIN_PERIOD);
                    let mut ticks = time::interval_at(time::Instant::now() + period, period);
                    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticks.tick().await;
                        invocation.invoke(async { body().await }).await;
                    }
                }
            }
        };
        Ok(TimerHandle {
            task: tokio::task::spawn_local(task).abort_handle(),
        })
    }

    /// Start `task` now.
    ///
    /// The task runs inline until its first suspension point, then the reactor
    /// owns it. A task that completes without suspending never touches the
    /// reactor, so it may be spawned while the reactor is stopped.
    pub fn spawn<Fut>(&self, task: Fut) -> Result<(), ProgrammerError>
    where
        Fut: Future<Output = ()> + 'static,
    {
        let mut task = Box::pin(task);
        let mut cx = Context::from_waker(Waker::noop());
        if task.as_mut().poll(&mut cx).is_ready() {
            return Ok(());
        }
        if !self.reactor_running() {
            return Err(ProgrammerError::ReactorNotRunning);
        }
        tokio::task::spawn_local(task);
        Ok(())
    }

    /// Run a blocking `body` on the background thread pool and suspend the
    /// caller until it finishes.
    ///
    /// A failure in `body` comes back as [`SyncError::Job`] carrying the
    /// original fault.
    pub async fn defer<T, F>(&self, body: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Result<T, Fault> + Send + 'static,
        T: Send + 'static,
    {
        let deferred: Deferred<T, Fault> = Deferred::new();
        let producer = deferred.clone();
        tokio::task::spawn_blocking(move || {
            ensure_callback(&producer, body);
        });
        deferred.wait().await;
        match map_deferred_result(&deferred)? {
            Values::One(value) => Ok(value),
            Values::Many(values) => Err(ProgrammerError::UnexpectedArity {
                count: values.len(),
            }
            .into()),
        }
    }

    /// Run a blocking `body` on the background thread pool without waiting.
    /// A failure is only logged, under the `"defer"` context.
    pub fn defer_detached<F>(&self, body: F) -> Result<(), ProgrammerError>
    where
        F: FnOnce() -> Result<(), Fault> + Send + 'static,
    {
        if !self.reactor_running() {
            return Err(ProgrammerError::ReactorNotRunning);
        }
        let sink = Arc::clone(&self.inner.sink);
        tokio::task::spawn_blocking(move || {
            if let Err(fault) = return_exception(body) {
                sink.log(&fault, "defer");
            }
        });
        Ok(())
    }

    pub(crate) fn log_fault(&self, fault: &Fault, context: &str) {
        self.inner.sink.log(fault, context);
    }

    /// The safety wrapper: log the failure, or let it escape when disabled.
    fn guard(&self, operation: &str, fault: Fault) {
        if self.inner.config.safety_wrapper {
            self.log_fault(&fault, operation);
            return;
        }
        tracing::debug!(operation, kind = fault.kind(), "Failure escaped the safety wrapper");
        {
            let mut escaped = self.inner.escaped.borrow_mut();
            if escaped.is_none() {
                *escaped = Some(fault);
            }
        }
        self.inner.shutdown.notify_waiters();
    }

    async fn drive<F, Fut, T>(&self, body: F) -> Result<Option<T>, Fault>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let body = pin!(return_exception_async(async move { body().await }));
        let shutdown = pin!(self.shutdown_requested());
        match future::select(body, shutdown).await {
            Either::Left((Ok(value), shutdown)) => {
                shutdown.await?;
                Ok(Some(value))
            }
            Either::Left((Err(fault), _)) | Either::Right((Err(fault), _)) => Err(fault),
            Either::Right((Ok(()), _)) => Ok(None),
        }
    }

    async fn shutdown_requested(&self) -> Result<(), Fault> {
        loop {
            let mut notified = pin!(self.inner.shutdown.notified());
            notified.as_mut().enable();
            if let Some(fault) = self.inner.escaped.borrow_mut().take() {
                return Err(fault);
            }
            if self.inner.stop_requested.get() {
                return Ok(());
            }
            notified.await;
        }
    }

    fn settle<T>(
        &self,
        policy: ErrorPolicy,
        fault: Fault,
    ) -> Result<Option<T>, FatalSchedulerError> {
        if policy == ErrorPolicy::Raise || !self.inner.config.safety_wrapper {
            return Err(FatalSchedulerError::new(fault));
        }
        self.log_fault(&fault, "run");
        Ok(None)
    }
}

/// One admitted operation: its hooks and the context they share.
struct Invocation {
    scheduler: Scheduler,
    hooks: HookSet,
    context: RefCell<SchedulingContext>,
}

impl Invocation {
    async fn invoke<Fut>(&self, body: Fut)
    where
        Fut: Future<Output = Result<(), Fault>>,
    {
        let _end = EndOnDrop(self);
        let outcome = match self.fire(|hooks, context| hooks.fire_start(context)) {
            Ok(()) => return_exception_async(body).await,
            Err(fault) => Err(fault),
        };
        if let Err(fault) = outcome {
            self.fail(fault);
        }
    }

    /// Run listeners with panics captured as a fault.
    fn fire(
        &self,
        listeners: impl FnOnce(&HookSet, &mut SchedulingContext),
    ) -> Result<(), Fault> {
        return_exception(|| {
            listeners(&self.hooks, &mut self.context.borrow_mut());
            Ok(())
        })
    }

    fn operation(&self) -> &'static str {
        self.context.borrow().kind().operation()
    }

    fn fail(&self, fault: Fault) {
        self.context.borrow_mut().set_exception(fault.clone());
        if let Err(hook_fault) = self.fire(|hooks, context| hooks.fire_exception(context, &fault)) {
            self.scheduler.log_fault(&hook_fault, self.operation());
        }
        self.scheduler.guard(self.operation(), fault);
    }
}

/// Fires `on_end` once the invocation is over, including when its task is
/// aborted mid-body.
struct EndOnDrop<'a>(&'a Invocation);

impl Drop for EndOnDrop<'_> {
    fn drop(&mut self) {
        let invocation = self.0;
        if let Err(fault) = invocation.fire(|hooks, context| hooks.fire_end(context)) {
            invocation.scheduler.log_fault(&fault, invocation.operation());
        }
    }
}

/// Adapt a one-shot body to the repeatable form `schedule` takes.
fn once<F, Fut>(body: F) -> impl FnMut() -> LocalBoxFuture<'static, Result<(), Fault>>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<(), Fault>> + 'static,
{
    let mut body = Some(body);
    move || match body.take() {
        Some(body) => body().boxed_local(),
        None => future::ready(Ok(())).boxed_local(),
    }
}
