//! Attempt timeouts for native and blocking handlers

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use vigil_core::FailureKind;
use vigil_scheduler::prelude::*;
use vigil_scheduler::{SchedulerError, TaskStatus};

async fn assert_times_out(harness: &Harness, task_type: &str) {
    let id = harness.schedule(
        task_type,
        json!({"ms": 200}),
        ScheduleOptions::new().timeout(Duration::from_millis(100)),
    );

    let err = harness
        .scheduler
        .retrieve_task_result(&id, bounded())
        .await
        .unwrap_err();
    match &err {
        SchedulerError::AttemptFailed { message, .. } => {
            assert!(message.contains("timed out after 100ms"), "{message}");
        }
        other => panic!("expected AttemptFailed, got {other:?}"),
    }

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.status, TaskStatus::Backoff);
    assert_eq!(described.failures, 1);
    assert_eq!(described.failure_kind, Some(FailureKind::Timeout));
    assert!(described.lease_owner.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_native_handler_times_out() {
    let harness = Harness::start();
    assert_times_out(&harness, SLEEP).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_handler_times_out() {
    let harness = Harness::start();
    assert_times_out(&harness, SLEEP_BLOCKING).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_accepted_as_temporary_failure() {
    let harness = Harness::start();
    let id = harness.schedule(
        SLEEP,
        json!({"ms": 200}),
        ScheduleOptions::new().timeout(Duration::from_millis(50)),
    );

    let result = harness
        .scheduler
        .retrieve_task_result(&id, bounded().accept_temp_failure())
        .await
        .unwrap();
    assert_eq!(result, None);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attempt_within_timeout_completes() {
    let harness = Harness::start();
    let id = harness.schedule(
        SLEEP_BLOCKING,
        json!({"ms": 20}),
        ScheduleOptions::new().timeout(Duration::from_secs(5)),
    );

    let result = harness
        .scheduler
        .retrieve_task_result(&id, bounded())
        .await
        .unwrap();
    assert_eq!(result, Some(json!({"slept": 20})));

    harness.stop().await;
}
