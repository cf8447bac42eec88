//! Parallel join: submission ordering and failure aggregation.

use std::rc::Rc;
use std::time::Duration;

use strand_engine::{
    Deferred, Fault, ParallelJoin, Resolved, SIBLING_SEPARATOR, SchedulerConfig, SyncError,
    TransportError, TransportFailure, Values, WorkerPool, map_deferred_result,
};

use crate::common::{jittered_delays, recording_scheduler};

#[test]
fn results_follow_submission_order_under_random_latency() {
    for seed in [3, 5, 8, 13] {
        let (scheduler, _sink) = recording_scheduler(SchedulerConfig::default());
        let inner = scheduler.clone();
        let values = scheduler
            .run_and_stop(move || async move {
                let delays = jittered_delays(seed, 8, 10);
                let results = ParallelJoin::parallel(&inner, None, |join| {
                    for (n, delay) in delays.into_iter().enumerate() {
                        let sleeper = inner.clone();
                        join.add(move || async move {
                            sleeper.sleep(delay).await;
                            Ok(n)
                        });
                    }
                })
                .await?;
                Ok(results)
            })
            .unwrap()
            .unwrap();

        let expected: Vec<_> = (0..8).map(Resolved::Value).collect();
        assert_eq!(values, expected, "seed {seed}");
    }
}

#[test]
fn first_failure_carries_every_sibling_failure() {
    let (scheduler, sink) = recording_scheduler(SchedulerConfig::default());
    let inner = scheduler.clone();
    let err = scheduler
        .run_and_stop(move || async move {
            let mut join = ParallelJoin::new(&inner);
            let (a, b, c) = (inner.clone(), inner.clone(), inner.clone());
            join.add(move || async move {
                a.sleep(Duration::from_millis(6)).await;
                Err(Fault::new("LoadError", "A load error occurred"))
            });
            join.add(|| async { Ok(1) });
            join.add(move || async move {
                b.sleep(Duration::from_millis(1)).await;
                Err(Fault::new("IndexError", "An index error occurred"))
            });
            join.add(move || async move {
                c.sleep(Duration::from_millis(3)).await;
                Err(anyhow::anyhow!("An argument error occurred").into())
            });
            Ok(join.run_all().await.unwrap_err())
        })
        .unwrap()
        .unwrap();

    let SyncError::Job(fault) = err else {
        panic!("expected a job failure, got {err:?}");
    };
    assert_eq!(fault.kind(), "LoadError");
    let message = fault.message();
    assert!(message.starts_with("A load error occurred"));
    assert!(message.contains(&format!("{SIBLING_SEPARATOR}IndexError: An index error occurred")));
    assert!(message.contains("Error: An argument error occurred"));
    assert!(
        message.find("IndexError").unwrap() < message.find("argument").unwrap(),
        "siblings are appended in submission order"
    );
    assert!(sink.entries().is_empty(), "join failures are returned, not logged");
}

#[test]
fn bridged_timeout_sibling_keeps_its_failure_name() {
    let (scheduler, _sink) = recording_scheduler(SchedulerConfig::default());
    let inner = scheduler.clone();
    let err = scheduler
        .run_and_stop(move || async move {
            let mut join = ParallelJoin::new(&inner);
            join.add(|| async { Err(Fault::new("IndexError", "first")) });
            join.add(|| async {
                let deferred: Deferred<u32> = Deferred::new();
                deferred.fail(TransportFailure::new(TransportError::Message(
                    "read timeout".to_string(),
                )));
                match map_deferred_result(&deferred)? {
                    Values::One(value) => Ok(value),
                    Values::Many(values) => Ok(values.len() as u32),
                }
            });
            Ok(join.run_all().await.unwrap_err())
        })
        .unwrap()
        .unwrap();

    let SyncError::Job(fault) = err else {
        panic!("expected a job failure, got {err:?}");
    };
    assert_eq!(fault.kind(), "IndexError");
    assert_eq!(
        fault.message(),
        format!("first{SIBLING_SEPARATOR}TimeoutFailure: execution expired")
    );
}

#[test]
fn pooled_batch_shares_the_pool_ceiling() {
    let (scheduler, _sink) = recording_scheduler(SchedulerConfig::default());
    let pool = WorkerPool::new(&scheduler, 2).unwrap();
    let inner = scheduler.clone();
    let observer = pool.clone();
    let peak = Rc::new(std::cell::Cell::new(0));
    let peak_c = Rc::clone(&peak);
    let values = scheduler
        .run_and_stop(move || async move {
            let results = ParallelJoin::parallel(&inner, Some(&pool), |join| {
                for n in 0..5 {
                    let (sleeper, observer, peak) =
                        (inner.clone(), observer.clone(), Rc::clone(&peak_c));
                    join.add(move || async move {
                        peak.set(peak.get().max(observer.active()));
                        sleeper.sleep(Duration::from_millis(2)).await;
                        Ok(n * n)
                    });
                }
            })
            .await?;
            Ok(results.into_iter().filter_map(Resolved::value).collect::<Vec<_>>())
        })
        .unwrap();

    assert_eq!(values, Some(vec![0, 1, 4, 9, 16]));
    assert_eq!(peak.get(), 2);
}

#[test]
fn deferred_work_inside_a_batch() {
    let (scheduler, _sink) = recording_scheduler(SchedulerConfig::default());
    let inner = scheduler.clone();
    let values = scheduler
        .run_and_stop(move || async move {
            let mut join = ParallelJoin::new(&inner);
            for n in 1..=3_u64 {
                let worker = inner.clone();
                join.add(move || async move {
                    let doubled = worker.defer(move || Ok(n * 2)).await?;
                    Ok(doubled)
                });
            }
            Ok(join.run_all().await?)
        })
        .unwrap()
        .unwrap();
    assert_eq!(
        values,
        vec![Resolved::Value(2), Resolved::Value(4), Resolved::Value(6)]
    );
}
