//! Cancellation of idle and executing tasks

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use serde_json::json;
use std::time::Duration;
use vigil_scheduler::prelude::*;
use vigil_scheduler::{SchedulerError, TaskStatus};

#[tokio::test]
async fn test_idle_task_is_cancelled_immediately() {
    let harness = Harness::start();
    let id = harness.schedule(
        PING,
        json!({"ping": 1}),
        ScheduleOptions::new().not_before(Utc::now() + ChronoDuration::hours(1)),
    );

    let mut work = harness.scheduler.begin_work().unwrap();
    let handle = work.cancel_tasks(&[id.clone()]).unwrap();
    work.commit().unwrap();

    assert!(handle.is_immediate());
    assert_eq!(handle.requested(), &[id.clone()]);
    assert_eq!(handle.cancelled_now(), vec![id.clone()]);
    assert!(handle.already_finished().is_empty());
    handle
        .tasks_cancelled(Some(Duration::from_millis(100)))
        .await
        .unwrap();

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.status, TaskStatus::Cancelled);
    assert!(described.cancelled.is_some());
    assert!(described.finished.is_some());

    let err = harness
        .scheduler
        .retrieve_task_result(&id, bounded())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Cancelled(_)));

    let snapshot = harness
        .scheduler
        .retrieve_task_result(&id, bounded().accept_cancel())
        .await
        .unwrap();
    assert_eq!(snapshot, None);

    harness.stop().await;
}

#[tokio::test]
async fn test_rolled_back_cancel_leaves_task_alone() {
    let harness = Harness::start();
    let id = harness.schedule(
        PING,
        json!({"ping": 1}),
        ScheduleOptions::new().not_before(Utc::now() + ChronoDuration::hours(1)),
    );

    let mut work = harness.scheduler.begin_work().unwrap();
    work.cancel_tasks(&[id.clone()]).unwrap();
    work.rollback();

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.status, TaskStatus::Pending);
    assert!(described.cancelled.is_none());

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_executing_task_acknowledges_cancel() {
    let harness = Harness::start();
    let id = harness.schedule(CANCELLABLE, json!({"steps": 1000}), ScheduleOptions::new());
    wait_for_status(&harness.scheduler, &id, TaskStatus::Executing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut work = harness.scheduler.begin_work().unwrap();
    let handle = work.cancel_tasks(&[id.clone()]).unwrap();
    work.commit().unwrap();

    assert!(!handle.is_immediate());
    assert_eq!(handle.awaiting_ack(), &[id.clone()]);

    handle
        .tasks_cancelled(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(harness.recorder.released());

    let described = harness.scheduler.describe_task(&id).unwrap();
    assert_eq!(described.status, TaskStatus::Cancelled);
    assert!(described.lease_owner.is_none());

    let snapshot = harness
        .scheduler
        .retrieve_task_result(&id, bounded().accept_cancel())
        .await
        .unwrap()
        .expect("cancelled attempt leaves a snapshot");
    assert!(snapshot["progress"].is_u64(), "{snapshot}");

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_cancellable_task_runs_to_completion() {
    let harness = Harness::start();
    let id = harness.schedule(SLEEP, json!({"ms": 300}), ScheduleOptions::new());
    wait_for_status(&harness.scheduler, &id, TaskStatus::Executing).await;

    let mut work = harness.scheduler.begin_work().unwrap();
    let handle = work.cancel_tasks(&[id.clone()]).unwrap();
    work.commit().unwrap();
    assert_eq!(handle.awaiting_ack().len(), 1);

    assert_eq!(
        harness.scheduler.describe_task(&id).unwrap().status,
        TaskStatus::CancelRequested
    );

    handle
        .tasks_cancelled(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    // The handler never looked at its channel, so its result stands
    let result = harness
        .scheduler
        .retrieve_task_result(&id, bounded())
        .await
        .unwrap();
    assert_eq!(result, Some(json!({"slept": 300})));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiting_for_cancel_can_time_out() {
    let harness = Harness::start();
    let id = harness.schedule(SLEEP, json!({"ms": 1000}), ScheduleOptions::new());
    wait_for_status(&harness.scheduler, &id, TaskStatus::Executing).await;

    let mut work = harness.scheduler.begin_work().unwrap();
    let handle = work.cancel_tasks(&[id.clone()]).unwrap();
    work.commit().unwrap();

    let err = handle
        .tasks_cancelled(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::CancelTimeout { pending: 1 }));

    handle.tasks_cancelled(None).await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_cancelling_finished_task_is_noop() {
    let harness = Harness::start();
    let id = harness.schedule(PING, json!({"ping": 7}), ScheduleOptions::new());
    let result = harness
        .scheduler
        .retrieve_task_result(&id, bounded())
        .await
        .unwrap();
    assert!(result.is_some());

    let mut work = harness.scheduler.begin_work().unwrap();
    let handle = work.cancel_tasks(&[id.clone()]).unwrap();
    work.commit().unwrap();
    assert!(handle.is_immediate());
    assert_eq!(handle.already_finished(), &[id.clone()]);
    assert!(handle.cancelled_now().is_empty());

    assert_eq!(
        harness.scheduler.describe_task(&id).unwrap().status,
        TaskStatus::Completed
    );

    harness.stop().await;
}
