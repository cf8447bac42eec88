//! Bounded worker pool.
//!
//! Admits jobs FIFO and keeps at most `limit` of them running at once. Each
//! admitted job is spawned through [`Scheduler::spawn`], so a job runs inline
//! until its first suspension point. When a job finishes the pool immediately
//! backfills from the pending queue.
//!
//! A job may dedup itself against the pending queue before it is admitted:
//! see [`Job::merge`], [`supersede`] and [`yield_to_pending`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use strand_types::{Fault, ProgrammerError};

use crate::bridge::return_exception_async;
use crate::scheduler::Scheduler;

/// Error-sink context for failures inside pool jobs.
pub const WORKER_CONTEXT: &str = "worker_pool";

pub type JobFuture<T> = LocalBoxFuture<'static, Result<T, Fault>>;

/// Unit of work for a [`WorkerPool`] or a [`ParallelJoin`](crate::ParallelJoin).
///
/// Any `FnOnce() -> impl Future<Output = Result<T, Fault>>` closure is a job
/// that never merges and ignores cancellation.
pub trait Job<T = ()>: 'static {
    fn run(self: Box<Self>) -> JobFuture<T>;

    /// Identity used by the merge helpers to spot duplicates.
    fn merge_key(&self) -> Option<&str> {
        None
    }

    /// Called on admission when other jobs are still pending.
    ///
    /// The job may cancel or reorder entries in `pending`, then decides
    /// whether it is itself enqueued at the tail or discarded.
    fn merge(&self, pending: &mut PendingJobs) -> Merge {
        let _ = pending;
        Merge::Enqueue
    }

    /// The job was displaced before it ran.
    fn cancel(self: Box<Self>) {}
}

impl<T, F, Fut> Job<T> for F
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, Fault>> + 'static,
{
    fn run(self: Box<Self>) -> JobFuture<T> {
        (*self)().boxed_local()
    }
}

/// Outcome of [`Job::merge`] for the incoming job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Append the incoming job to the tail of the queue.
    Enqueue,
    /// Drop the incoming job. The pool calls its [`Job::cancel`].
    Discard,
}

/// Jobs admitted but not yet started, head first.
#[derive(Default)]
pub struct PendingJobs {
    jobs: VecDeque<Box<dyn Job>>,
}

impl fmt::Debug for PendingJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

impl PendingJobs {
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = Option<&str>> {
        self.jobs.iter().map(|job| job.merge_key())
    }

    /// Index of the first pending job with this merge key.
    #[must_use]
    pub fn position_of(&self, key: &str) -> Option<usize> {
        self.jobs
            .iter()
            .position(|job| job.merge_key() == Some(key))
    }

    /// Remove the job at `index` and tell it it was displaced.
    pub fn cancel(&mut self, index: usize) -> bool {
        match self.jobs.remove(index) {
            Some(job) => {
                tracing::debug!(merge_key = job.merge_key(), "Pending job displaced");
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// Move the job at `from` to `to`, shifting the jobs in between.
    pub fn move_job(&mut self, from: usize, to: usize) -> bool {
        if to >= self.jobs.len() {
            return false;
        }
        match self.jobs.remove(from) {
            Some(job) => {
                self.jobs.insert(to, job);
                true
            }
            None => false,
        }
    }

    fn push_back(&mut self, job: Box<dyn Job>) {
        self.jobs.push_back(job);
    }

    fn pop_front(&mut self) -> Option<Box<dyn Job>> {
        self.jobs.pop_front()
    }
}

/// Merge policy: cancel the pending job sharing `key`, then enqueue the
/// incoming one at the tail.
pub fn supersede(key: &str, pending: &mut PendingJobs) -> Merge {
    if let Some(index) = pending.position_of(key) {
        pending.cancel(index);
    }
    Merge::Enqueue
}

/// Merge policy: if a job with `key` is already pending, drop the incoming one.
#[must_use]
pub fn yield_to_pending(key: &str, pending: &PendingJobs) -> Merge {
    if pending.position_of(key).is_some() {
        Merge::Discard
    } else {
        Merge::Enqueue
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Rc<PoolInner>,
}

struct PoolInner {
    scheduler: Scheduler,
    limit: usize,
    state: RefCell<PoolState>,
}

#[derive(Default)]
struct PoolState {
    pending: PendingJobs,
    active: usize,
    paused: bool,
    draining: bool,
    merging: bool,
    /// Jobs added from a cancel callback while a merge holds the queue.
    held: VecDeque<Box<dyn Job>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("WorkerPool")
            .field("limit", &self.inner.limit)
            .field("active", &state.active)
            .field("pending", &state.pending.len())
            .field("paused", &state.paused)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(scheduler: &Scheduler, limit: usize) -> Result<Self, ProgrammerError> {
        if limit == 0 {
            return Err(ProgrammerError::InvalidLimit { limit });
        }
        Ok(Self {
            inner: Rc::new(PoolInner {
                scheduler: scheduler.clone(),
                limit,
                state: RefCell::new(PoolState::default()),
            }),
        })
    }

    pub fn add(&self, job: impl Job) {
        self.add_boxed(Box::new(job));
    }

    pub fn add_boxed(&self, job: Box<dyn Job>) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.merging {
                state.held.push_back(job);
                return;
            }
        }
        self.admit(job);
        loop {
            let Some(job) = self.inner.state.borrow_mut().held.pop_front() else {
                break;
            };
            self.admit(job);
        }
        if !self.is_paused() {
            self.drain();
        }
    }

    fn admit(&self, job: Box<dyn Job>) {
        let decision = if self.queue_empty() {
            Merge::Enqueue
        } else {
            self.merge(job.as_ref())
        };
        match decision {
            Merge::Enqueue => {
                tracing::trace!(merge_key = job.merge_key(), "Job enqueued");
                self.inner.state.borrow_mut().pending.push_back(job);
            }
            Merge::Discard => {
                tracing::debug!(merge_key = job.merge_key(), "Incoming job discarded by merge");
                job.cancel();
            }
        }
    }

    /// Start pending jobs until the queue is empty or the pool is full.
    ///
    /// Runs regardless of the paused flag. A completion that lands while a
    /// drain is already in progress is picked up by that drain.
    pub fn drain(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        while let Some(job) = self.next_job() {
            let pool = self.clone();
            let worker = async move {
                if let Err(fault) = return_exception_async(async move { job.run().await }).await {
                    pool.inner.scheduler.log_fault(&fault, WORKER_CONTEXT);
                }
                pool.worker_done();
            };
            if let Err(err) = self.inner.scheduler.spawn(worker) {
                self.inner.scheduler.log_fault(&Fault::capture(err), WORKER_CONTEXT);
                let mut state = self.inner.state.borrow_mut();
                state.active = state.active.saturating_sub(1);
            }
        }
        self.inner.state.borrow_mut().draining = false;
    }

    /// Stop `add` from draining. Jobs already running are unaffected.
    pub fn pause(&self) {
        self.set_paused(true);
    }

    /// Re-enable draining on the next `add`. Does not drain by itself.
    pub fn unpause(&self) {
        self.set_paused(false);
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.state.borrow_mut().paused = paused;
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.state.borrow().paused
    }

    #[must_use]
    pub fn workers_empty(&self) -> bool {
        self.active() == 0
    }

    #[must_use]
    pub fn workers_full(&self) -> bool {
        self.active() >= self.inner.limit
    }

    #[must_use]
    pub fn queue_empty(&self) -> bool {
        self.inner.state.borrow().pending.is_empty()
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.state.borrow().active
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    // The queue is lent out while the job merges. Adds from cancel callbacks
    // are held until it is back, then admitted behind the incoming job.
    fn merge(&self, job: &dyn Job) -> Merge {
        let mut pending = {
            let mut state = self.inner.state.borrow_mut();
            state.merging = true;
            std::mem::take(&mut state.pending)
        };
        let decision = job.merge(&mut pending);
        let mut state = self.inner.state.borrow_mut();
        state.pending = pending;
        state.merging = false;
        decision
    }

    fn next_job(&self) -> Option<Box<dyn Job>> {
        let mut state = self.inner.state.borrow_mut();
        if state.active >= self.inner.limit {
            return None;
        }
        let job = state.pending.pop_front()?;
        state.active += 1;
        Some(job)
    }

    fn worker_done(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.active = state.active.saturating_sub(1);
            tracing::trace!(active = state.active, pending = state.pending.len(), "Worker done");
        }
        self.drain();
    }
}
