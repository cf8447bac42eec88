//! Bounded worker pool: concurrency ceiling, backfill and merge dedup.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use strand_engine::{
    Job, JobFuture, Merge, PendingJobs, SchedulerConfig, WorkerPool, supersede,
    yield_to_pending,
};

use crate::common::{jittered_delays, recording_scheduler};

#[test]
fn active_jobs_never_exceed_limit() {
    for (limit, seed) in [(1, 7), (2, 11), (3, 13), (5, 17)] {
        let (scheduler, sink) = recording_scheduler(SchedulerConfig::default());
        let pool = WorkerPool::new(&scheduler, limit).unwrap();
        let in_flight = Rc::new(Cell::new(0_usize));
        let peak = Rc::new(Cell::new(0_usize));
        let finished = Rc::new(Cell::new(0_usize));

        let inner = scheduler.clone();
        let (in_flight_c, peak_c, finished_c) =
            (Rc::clone(&in_flight), Rc::clone(&peak), Rc::clone(&finished));
        scheduler
            .run_and_stop(move || async move {
                let delays = jittered_delays(seed, 12, 6);
                for (n, delay) in delays.into_iter().enumerate() {
                    let (in_flight, peak, finished, sleeper) = (
                        Rc::clone(&in_flight_c),
                        Rc::clone(&peak_c),
                        Rc::clone(&finished_c),
                        inner.clone(),
                    );
                    pool.add(move || async move {
                        in_flight.set(in_flight.get() + 1);
                        peak.set(peak.get().max(in_flight.get()));
                        sleeper.sleep(delay).await;
                        in_flight.set(in_flight.get() - 1);
                        finished.set(finished.get() + 1);
                        Ok(())
                    });
                    // Stagger some arrivals so admissions interleave with completions.
                    if n % 3 == 0 {
                        inner.sleep(Duration::from_millis(1)).await;
                    }
                }
                while !(pool.workers_empty() && pool.queue_empty()) {
                    inner.sleep(Duration::from_millis(1)).await;
                }
                Ok(())
            })
            .unwrap();

        assert!(peak.get() <= limit, "limit {limit} exceeded: peak {}", peak.get());
        assert_eq!(finished.get(), 12);
        assert!(sink.entries().is_empty());
    }
}

#[test]
fn third_job_starts_only_after_an_earlier_one_ends() {
    let (scheduler, _sink) = recording_scheduler(SchedulerConfig::default());
    let pool = WorkerPool::new(&scheduler, 2).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));

    let inner = scheduler.clone();
    let log_c = Rc::clone(&log);
    scheduler
        .run_and_stop(move || async move {
            for n in 1..=3 {
                let (log, sleeper) = (Rc::clone(&log_c), inner.clone());
                pool.add(move || async move {
                    log.borrow_mut().push(format!("start {n}"));
                    sleeper.sleep(Duration::from_millis(5)).await;
                    log.borrow_mut().push(format!("end {n}"));
                    Ok(())
                });
            }
            while !(pool.workers_empty() && pool.queue_empty()) {
                inner.sleep(Duration::from_millis(1)).await;
            }
            Ok(())
        })
        .unwrap();

    let log = log.borrow();
    let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
    let third_start = position("start 3");
    assert!(
        position("end 1") < third_start || position("end 2") < third_start,
        "unexpected order: {log:?}"
    );
}

#[test]
fn job_failures_are_logged_not_propagated() {
    let (scheduler, sink) = recording_scheduler(SchedulerConfig::default());
    let pool = WorkerPool::new(&scheduler, 2).unwrap();
    let survived = Rc::new(Cell::new(false));

    let inner = scheduler.clone();
    let flag = Rc::clone(&survived);
    let result = scheduler
        .run_and_stop(move || async move {
            let sleeper = inner.clone();
            pool.add(move || async move {
                sleeper.sleep(Duration::from_millis(1)).await;
                Err(strand_engine::Fault::new("ArgumentError", "bad job"))
            });
            pool.add(move || async move {
                flag.set(true);
                Ok(())
            });
            while !pool.workers_empty() {
                inner.sleep(Duration::from_millis(1)).await;
            }
            Ok("reactor kept running")
        })
        .unwrap();

    assert_eq!(result, Some("reactor kept running"));
    assert!(survived.get());
    assert_eq!(
        sink.entries(),
        vec![("worker_pool".to_string(), "ArgumentError: bad job".to_string())]
    );
}

/// Job that dedups against pending jobs with the same key.
struct Dedup {
    key: &'static str,
    newest_wins: bool,
    label: &'static str,
    ran: Rc<RefCell<Vec<&'static str>>>,
    cancelled: Rc<RefCell<Vec<&'static str>>>,
}

impl Job for Dedup {
    fn run(self: Box<Self>) -> JobFuture<()> {
        self.ran.borrow_mut().push(self.label);
        Box::pin(async { Ok(()) })
    }

    fn merge_key(&self) -> Option<&str> {
        Some(self.key)
    }

    fn merge(&self, pending: &mut PendingJobs) -> Merge {
        if self.newest_wins {
            supersede(self.key, pending)
        } else {
            yield_to_pending(self.key, pending)
        }
    }

    fn cancel(self: Box<Self>) {
        self.cancelled.borrow_mut().push(self.label);
    }
}

fn run_dedup_pair(newest_wins: bool) -> (Vec<&'static str>, Vec<&'static str>) {
    let (scheduler, _sink) = recording_scheduler(SchedulerConfig::default());
    let pool = WorkerPool::new(&scheduler, 1).unwrap();
    let ran = Rc::new(RefCell::new(Vec::new()));
    let cancelled = Rc::new(RefCell::new(Vec::new()));

    let inner = scheduler.clone();
    let (ran_c, cancelled_c) = (Rc::clone(&ran), Rc::clone(&cancelled));
    scheduler
        .run_and_stop(move || async move {
            // Occupy the only worker so both duplicates stay pending.
            let sleeper = inner.clone();
            pool.add(move || async move {
                sleeper.sleep(Duration::from_millis(2)).await;
                Ok(())
            });
            pool.add(|| async { Ok(()) });
            for label in ["older", "newer"] {
                pool.add(Dedup {
                    key: "refresh-index",
                    newest_wins,
                    label,
                    ran: Rc::clone(&ran_c),
                    cancelled: Rc::clone(&cancelled_c),
                });
            }
            while !(pool.workers_empty() && pool.queue_empty()) {
                inner.sleep(Duration::from_millis(1)).await;
            }
            Ok(())
        })
        .unwrap();

    let ran = ran.borrow().clone();
    let cancelled = cancelled.borrow().clone();
    (ran, cancelled)
}

#[test]
fn superseding_duplicate_runs_newest_and_cancels_older_once() {
    let (ran, cancelled) = run_dedup_pair(true);
    assert_eq!(ran, vec!["newer"]);
    assert_eq!(cancelled, vec!["older"]);
}

#[test]
fn yielding_duplicate_runs_oldest_and_cancels_newer_once() {
    let (ran, cancelled) = run_dedup_pair(false);
    assert_eq!(ran, vec!["older"]);
    assert_eq!(cancelled, vec!["newer"]);
}

#[test]
fn paused_pool_queues_until_manual_drain() {
    let (scheduler, _sink) = recording_scheduler(SchedulerConfig::default());
    let pool = WorkerPool::new(&scheduler, 2).unwrap();
    let ran = Rc::new(Cell::new(0));

    for _ in 0..3 {
        let ran = Rc::clone(&ran);
        pool.add(move || async move {
            ran.set(ran.get() + 1);
            Ok(())
        });
    }
    assert_eq!(ran.get(), 3);

    pool.pause();
    for _ in 0..6 {
        let ran = Rc::clone(&ran);
        pool.add(move || async move {
            ran.set(ran.get() + 1);
            Ok(())
        });
    }
    assert_eq!(ran.get(), 3);
    assert_eq!(pool.pending_len(), 6);

    pool.drain();
    assert_eq!(ran.get(), 9);
    assert!(pool.queue_empty());
}
