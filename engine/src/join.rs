//! Parallel join: run N jobs concurrently, wait for all of them, and return
//! their results in submission order.
//!
//! Every job is started before the caller suspends. If the whole batch
//! finishes during dispatch (all jobs synchronous) the caller never suspends.
//! A failed slot does not cut the batch short. Once every slot is resolved,
//! the first failure by submission order is returned with the other failures'
//! text appended to its message.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use futures_util::FutureExt;
use strand_types::{Fault, SyncError};
use tokio::sync::Notify;

use crate::bridge::return_exception_async;
use crate::pool::{Job, JobFuture, Merge, PendingJobs, WorkerPool};
use crate::scheduler::Scheduler;

/// Inserted between the first failure's message and each sibling failure.
pub const SIBLING_SEPARATOR: &str = "\n====================================\n";

/// Final state of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<T> {
    Value(T),
    /// The downstream pool cancelled the job before it ran.
    Cancelled,
}

impl<T> Resolved<T> {
    #[must_use]
    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Cancelled => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

enum Outcome<T> {
    Value(T),
    Failed(Fault),
    Cancelled,
}

impl<T> From<Result<T, Fault>> for Outcome<T> {
    fn from(result: Result<T, Fault>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(fault) => Self::Failed(fault),
        }
    }
}

struct Batch<T> {
    slots: RefCell<Vec<Option<Outcome<T>>>>,
    finished: Notify,
}

impl<T> Batch<T> {
    fn new(size: usize) -> Self {
        Self {
            slots: RefCell::new(std::iter::repeat_with(|| None).take(size).collect()),
            finished: Notify::new(),
        }
    }

    /// First resolution of a slot wins.
    fn resolve(&self, index: usize, outcome: Outcome<T>) {
        let complete = {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = slots.get_mut(index) else {
                return;
            };
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
            slots.iter().all(Option::is_some)
        };
        if complete {
            self.finished.notify_one();
        }
    }

    fn is_complete(&self) -> bool {
        self.slots.borrow().iter().all(Option::is_some)
    }

    fn collect(&self) -> Result<Vec<Resolved<T>>, Fault> {
        let slots = std::mem::take(&mut *self.slots.borrow_mut());
        let mut values = Vec::with_capacity(slots.len());
        let mut first: Option<Fault> = None;
        let mut siblings = Vec::new();
        for outcome in slots.into_iter().flatten() {
            match outcome {
                Outcome::Value(value) => values.push(Resolved::Value(value)),
                Outcome::Cancelled => values.push(Resolved::Cancelled),
                Outcome::Failed(fault) if first.is_none() => first = Some(fault),
                Outcome::Failed(fault) => siblings.push(fault),
            }
        }
        match first {
            Some(mut fault) => {
                for sibling in &siblings {
                    fault.append_message(SIBLING_SEPARATOR);
                    fault.append_message(&sibling.describe());
                }
                Err(fault)
            }
            None => Ok(values),
        }
    }
}

/// Pool job that resolves its batch slot instead of returning a value.
struct SlotJob<T: 'static> {
    index: usize,
    job: Box<dyn Job<T>>,
    batch: Rc<Batch<T>>,
}

impl<T: 'static> Job for SlotJob<T> {
    fn run(self: Box<Self>) -> JobFuture<()> {
        let Self { index, job, batch } = *self;
        async move {
            let outcome = return_exception_async(async move { job.run().await }).await;
            batch.resolve(index, outcome.into());
            Ok(())
        }
        .boxed_local()
    }

    fn merge_key(&self) -> Option<&str> {
        self.job.merge_key()
    }

    fn merge(&self, pending: &mut PendingJobs) -> Merge {
        self.job.merge(pending)
    }

    fn cancel(self: Box<Self>) {
        let Self { index, job, batch } = *self;
        batch.resolve(index, Outcome::Cancelled);
        job.cancel();
    }
}

pub struct ParallelJoin<T: 'static> {
    scheduler: Scheduler,
    downstream: Option<WorkerPool>,
    jobs: Vec<Box<dyn Job<T>>>,
}

impl<T: 'static> fmt::Debug for ParallelJoin<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelJoin")
            .field("jobs", &self.jobs.len())
            .field("downstream", &self.downstream)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> ParallelJoin<T> {
    /// Jobs are spawned directly on the scheduler.
    #[must_use]
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            downstream: None,
            jobs: Vec::new(),
        }
    }

    /// Jobs go through `pool`, whose limit then caps the batch.
    #[must_use]
    pub fn with_pool(scheduler: &Scheduler, pool: &WorkerPool) -> Self {
        Self {
            scheduler: scheduler.clone(),
            downstream: Some(pool.clone()),
            jobs: Vec::new(),
        }
    }

    /// Queue a job. Its slot index is the number of jobs added before it.
    pub fn add(&mut self, job: impl Job<T>) -> &mut Self {
        self.jobs.push(Box::new(job));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Build a batch with `build`, then run it.
    pub async fn parallel<F>(
        scheduler: &Scheduler,
        pool: Option<&WorkerPool>,
        build: F,
    ) -> Result<Vec<Resolved<T>>, SyncError>
    where
        F: FnOnce(&mut Self),
    {
        let mut join = match pool {
            Some(pool) => Self::with_pool(scheduler, pool),
            None => Self::new(scheduler),
        };
        build(&mut join);
        join.run_all().await
    }

    /// Dispatch every job and wait until all slots resolve.
    ///
    /// Results are in submission order. Cancelled slots show up as
    /// [`Resolved::Cancelled`].
    pub async fn run_all(self) -> Result<Vec<Resolved<T>>, SyncError> {
        let Self {
            scheduler,
            downstream,
            jobs,
        } = self;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let batch = Rc::new(Batch::new(jobs.len()));
        tracing::debug!(jobs = jobs.len(), pooled = downstream.is_some(), "Dispatching batch");
        for (index, job) in jobs.into_iter().enumerate() {
            let batch = Rc::clone(&batch);
            match &downstream {
                Some(pool) => pool.add(SlotJob { index, job, batch }),
                None => scheduler.spawn(async move {
                    let outcome = return_exception_async(async move { job.run().await }).await;
                    batch.resolve(index, outcome.into());
                })?,
            }
        }

        while !batch.is_complete() {
            batch.finished.notified().await;
        }
        batch.collect().map_err(SyncError::Job)
    }
}
