//! Deferred result bridge, driven through the public API.

use std::io;

use strand_engine::bridge::{DIAGNOSTIC_LIMIT, truncate_diagnostic};
use strand_engine::{
    Deferred, Fault, ProgrammerError, SyncError, TransportError, TransportFailure, Values,
    ensure_callback, map_deferred_result,
};

#[test]
fn diagnostics_truncate_past_the_limit() {
    let exact = "a".repeat(DIAGNOSTIC_LIMIT);
    assert_eq!(truncate_diagnostic(&exact), exact);

    let over = "b".repeat(DIAGNOSTIC_LIMIT + 1);
    let truncated = truncate_diagnostic(&over);
    assert_eq!(truncated.chars().count(), DIAGNOSTIC_LIMIT);
    assert_eq!(truncated, format!("{}...TRUNC", "b".repeat(92)));
}

#[test]
fn timeout_failure_maps_to_timeout() {
    let deferred: Deferred<String> = Deferred::new();
    deferred.fail(TransportFailure::new(TransportError::Message(
        "Request Timeout after 30s".to_string(),
    )));
    let err = map_deferred_result(&deferred).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "execution expired");
}

#[test]
fn connection_refused_maps_to_failure_with_error_text() {
    let deferred: Deferred<String> = Deferred::new();
    deferred.fail(TransportFailure::new(TransportError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "Connection refused - connect(2) for 127.0.0.1:8080",
    ))));
    match map_deferred_result(&deferred).unwrap_err() {
        SyncError::Failure { message } => {
            assert!(message.contains("Connection refused"), "{message}");
        }
        other => panic!("expected a bridge failure, got {other:?}"),
    }
}

#[test]
fn unresolved_deferred_is_a_programmer_error() {
    let deferred: Deferred<u8> = Deferred::new();
    match map_deferred_result(&deferred).unwrap_err() {
        SyncError::Programmer(err @ ProgrammerError::Unresolved { .. }) => {
            assert!(err.to_string().to_lowercase().contains("no deferred status set"));
        }
        other => panic!("expected a programmer error, got {other:?}"),
    }
}

#[test]
fn ensure_callback_round_trips_values() {
    let single: Deferred<&str> = Deferred::new();
    ensure_callback(&single, || Ok("v"));
    assert_eq!(map_deferred_result(&single).unwrap(), Values::One("v"));

    let many: Deferred<i32> = Deferred::new();
    ensure_callback(&many, || Ok(Values::Many(vec![1, 2, 3])));
    assert_eq!(map_deferred_result(&many).unwrap().into_vec(), vec![1, 2, 3]);

    let nested: Deferred<Vec<i32>> = Deferred::new();
    ensure_callback(&nested, || Ok(vec![1, 2]));
    assert_eq!(map_deferred_result(&nested).unwrap(), Values::One(vec![1, 2]));
}

#[test]
fn ensure_callback_failure_is_reraised_as_the_original_fault() {
    let deferred: Deferred<i32> = Deferred::new();
    ensure_callback(&deferred, || {
        Err::<i32, _>(Fault::new("LoadError", "A load error occurred"))
    });
    let err = map_deferred_result(&deferred).unwrap_err();
    let fault = err.as_fault().unwrap();
    assert_eq!(fault.describe(), "LoadError: A load error occurred");
}

#[tokio::test]
async fn background_producer_wakes_waiting_consumer() {
    let deferred: Deferred<u32> = Deferred::new();
    let producer = deferred.clone();
    let handle = tokio::task::spawn_blocking(move || {
        std::thread::sleep(std::time::Duration::from_millis(5));
        ensure_callback(&producer, || Ok(99_u32))
    });
    deferred.wait().await;
    assert!(handle.await.unwrap());
    assert_eq!(map_deferred_result(&deferred).unwrap(), Values::One(99));
}
