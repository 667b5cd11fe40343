//! Temporary failures, backoff, retries and failure limits

mod common;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use common::*;
use serde_json::json;
use vigil_core::FailureKind;
use vigil_scheduler::prelude::*;
use vigil_scheduler::{SchedulerError, TaskStatus};

fn assert_near(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let drift = (actual - expected).num_seconds().abs();
    assert!(drift <= 60, "expected {expected}, got {actual}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_temporary_failure_backs_off() {
    let harness = Harness::start();
    let started = Utc::now();
    let id = harness.schedule(PING, json!({"ping": "FAIL"}), ScheduleOptions::new());

    let result = harness
        .scheduler
        .retrieve_task_result(&id, bounded().accept_temp_failure())
        .await
        .unwrap();
    assert_eq!(result, None);

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.status, TaskStatus::Backoff);
    assert_eq!(described.failures, 1);
    assert_eq!(described.failure_kind, Some(FailureKind::Temporary));
    assert_eq!(described.last_errors.as_deref(), Some("ping failed"));
    assert!(described.finished.is_none());
    assert_near(
        described.next_attempt.unwrap(),
        started + ChronoDuration::minutes(15),
    );

    // Retrying keeps the failure count, so the next backoff step is longer
    let retried_at = Utc::now();
    assert_eq!(harness.retry(&id), 1);
    harness
        .scheduler
        .retrieve_task_result(&id, bounded().accept_temp_failure())
        .await
        .unwrap();

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.failures, 2);
    assert_near(
        described.next_attempt.unwrap(),
        retried_at + ChronoDuration::minutes(30),
    );

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_stops_at_failure_limit() {
    let harness = Harness::start();
    let id = harness.schedule(PING_RETRY2, json!({"ping": "ABORT"}), ScheduleOptions::new());

    let err = harness
        .scheduler
        .retrieve_task_result(&id, bounded())
        .await
        .unwrap_err();
    match &err {
        SchedulerError::TaskAborted { id: aborted, message } => {
            assert_eq!(aborted, &id);
            assert!(message.contains("Task attempted to abort"), "{message}");
        }
        other => panic!("expected TaskAborted, got {other:?}"),
    }

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.failures, 1);
    assert_eq!(described.failure_kind, Some(FailureKind::Abort));
    assert!(described.finished.is_none());
    assert!(described.next_attempt.unwrap() > Utc::now());

    assert_eq!(harness.retry(&id), 1);
    let err = harness
        .scheduler
        .retrieve_task_result(&id, bounded())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::TaskAborted { .. }));
    assert!(err.to_string().contains("Task attempted to abort"));

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.failures, 2);
    assert_eq!(described.status, TaskStatus::Failed);
    assert!(described.finished.is_some());
    assert!(described.next_attempt.is_none());

    // The task is finished, so a further retry changes nothing
    assert_eq!(harness.retry(&id), 0);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pingretry2_succeeds_without_abort() {
    let harness = Harness::start();
    let id = harness.schedule(PING_RETRY2, json!({"ping": "ok"}), ScheduleOptions::new());

    let result = harness
        .scheduler
        .retrieve_task_result(&id, bounded())
        .await
        .unwrap();
    assert_eq!(result, Some(json!({"pong": "ok", "managedtaskid": id})));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permanent_failure_is_raised() {
    let harness = Harness::start();
    let id = harness.schedule(PING, json!({"ping": "PERM"}), ScheduleOptions::new());

    let err = harness
        .scheduler
        .retrieve_task_result(&id, bounded().accept_temp_failure())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::PermanentlyFailed { ref error, .. } if error == "ping rejected"));

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.status, TaskStatus::Failed);
    assert_eq!(described.failures, 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_retry_respects_not_before() {
    let harness = Harness::start();
    let not_before = Utc::now() + ChronoDuration::hours(1);
    let id = harness.schedule(
        PING,
        json!({"ping": 1}),
        ScheduleOptions::new().not_before(not_before),
    );

    assert_eq!(harness.retry(&id), 1);

    let described = harness.scheduler.describe_task(&id).unwrap();
    let next = described.next_attempt.unwrap();
    assert_eq!(next, not_before.trunc_subsecs(3));
    assert_eq!(described.not_before, next);
    assert_eq!(described.status, TaskStatus::Pending);

    harness.stop().await;
}

#[tokio::test]
async fn test_retry_by_type_skips_finished_tasks() {
    let harness = Harness::start();
    let later = Utc::now() + ChronoDuration::hours(1);
    let a = harness.schedule(PING, json!({"ping": "a"}), ScheduleOptions::new().not_before(later));
    let b = harness.schedule(PING, json!({"ping": "b"}), ScheduleOptions::new().not_before(later));
    let other = harness.schedule(SLEEP, json!({"ms": 1}), ScheduleOptions::new().not_before(later));

    let mut work = harness.scheduler.begin_work().unwrap();
    work.cancel_tasks(&[b.clone()]).unwrap();
    work.commit().unwrap();

    let mut work = harness.scheduler.begin_work().unwrap();
    let retried = work.retry_task(RetryTarget::Type(PING.to_string())).unwrap();
    work.commit().unwrap();
    assert_eq!(retried, 1);

    assert_eq!(harness.scheduler.describe_task(&a).unwrap().status, TaskStatus::Pending);
    assert_eq!(
        harness.scheduler.describe_task(&b).unwrap().status,
        TaskStatus::Cancelled
    );
    assert_eq!(
        harness.scheduler.describe_task(&other).unwrap().status,
        TaskStatus::Pending
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_retry_of_missing_task_fails() {
    let harness = Harness::start();
    let mut work = harness.scheduler.begin_work().unwrap();
    let err = work.retry_task(TaskId::generate()).unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound(_)));
    work.rollback();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_handler_error_is_annotated() {
    let harness = Harness::start();
    let id = harness.schedule(BLOCKING_ERROR, json!({}), ScheduleOptions::new());

    harness
        .scheduler
        .retrieve_task_result(&id, bounded().accept_temp_failure())
        .await
        .unwrap();

    let described = harness.scheduler.describe_task(&id).unwrap();
    let errors = described.last_errors.unwrap();
    assert!(errors.starts_with("disk on fire"), "{errors}");
    assert!(
        errors.contains(&format!("at blocking handler '{BLOCKING_ERROR}' (attempt 1)")),
        "{errors}"
    );

    harness.stop().await;
}
