//! Worker loop: claims due tasks and runs them.

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::execution::{execute_attempt, Claim};
use crate::scheduler::Scheduler;
use crate::task_handler::{ControlMessage, TaskChannel};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use vigil_bus::TASKS_CHANGED;
use vigil_core::{observe, Lease, TaskId};

/// Bookkeeping for one attempt this worker is running.
struct InFlight {
    token: String,
    lease_len: Duration,
    cancel_tx: Option<mpsc::Sender<ControlMessage>>,
    cancel_sent: bool,
}

enum ClaimAttempt {
    Claimed(Box<Claim>),
    /// A cancel-requested task nobody was running; now terminal.
    Finalized,
    Skipped,
}

/// Executes due tasks with the scheduler's registered handlers.
///
/// Several workers, in this process or others, may share one store. Each
/// claim is a lease taken inside an immediate store transaction, so a task
/// has at most one attempt in flight no matter how many workers race for it.
#[derive(Clone)]
pub struct Worker {
    scheduler: Scheduler,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
}

impl Worker {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Owner id written into this worker's leases.
    pub fn id(&self) -> &str {
        &self.scheduler.config().worker_id
    }

    /// Number of attempts currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Signal graceful shutdown.
    pub fn shutdown(&self) {
        info!(worker = %self.id(), "Shutdown signal received");
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
    }

    /// Run the worker loop until [`Worker::shutdown`] is called.
    ///
    /// Attempts run as separate tokio tasks; the loop itself only claims,
    /// renews leases and forwards cancellations. On shutdown it stops
    /// claiming and waits for the attempts it already started.
    pub async fn run(&self) -> Result<()> {
        let config = self.scheduler.config().clone();
        info!(
            worker = %config.worker_id,
            max_concurrent = config.max_concurrent_tasks,
            task_types = ?self.scheduler.handlers().task_types(),
            "Worker starting"
        );

        let wake = self.scheduler.wake_strategy();
        let mut subscription = wake.subscribe(TASKS_CHANGED);
        let mut attempts: JoinSet<Result<()>> = JoinSet::new();
        let mut last_renewal = Instant::now();

        while !self.shutdown.load(Ordering::SeqCst) {
            if last_renewal.elapsed() >= config.renew_interval() {
                self.renew_leases();
                last_renewal = Instant::now();
            }
            self.signal_cancellations();

            let capacity = config.max_concurrent_tasks.saturating_sub(attempts.len());
            let (claims, candidates) = if capacity > 0 {
                match self.claim_due(capacity) {
                    Ok(batch) => batch,
                    Err(e) => {
                        error!(worker = %config.worker_id, "Failed to claim due tasks: {}", e);
                        (Vec::new(), 0)
                    }
                }
            } else {
                (Vec::new(), 0)
            };

            let claimed = claims.len();
            for claim in claims {
                self.spawn_attempt(&mut attempts, *claim);
            }
            observe::set_in_flight(attempts.len());

            if claimed > 0 {
                continue;
            }

            let sleep = self.idle_sleep(&config, candidates > 0 || capacity == 0);
            debug!(worker = %config.worker_id, ?sleep, "No claimable tasks, waiting");

            tokio::select! {
                _ = subscription.changed() => {}
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => log_joined(joined),
                _ = tokio::time::sleep(sleep) => {}
                _ = self.shutdown_notify.notified() => {}
            }
        }

        info!(
            worker = %config.worker_id,
            in_flight = attempts.len(),
            "Worker shutting down, waiting for tasks to complete"
        );
        loop {
            tokio::select! {
                joined = attempts.join_next() => match joined {
                    Some(joined) => log_joined(joined),
                    None => break,
                },
                _ = tokio::time::sleep(config.renew_interval()) => {
                    self.renew_leases();
                    self.signal_cancellations();
                }
            }
        }
        observe::set_in_flight(0);

        info!(worker = %config.worker_id, "Worker stopped");
        Ok(())
    }

    fn spawn_attempt(&self, attempts: &mut JoinSet<Result<()>>, claim: Claim) {
        let task_id = claim.task.id.clone();
        let (cancel_tx, channel) = if claim.handler.options.cancellable {
            let (tx, channel) = TaskChannel::pair();
            (Some(tx), Some(channel))
        } else {
            (None, None)
        };

        self.in_flight.lock().insert(
            task_id.clone(),
            InFlight {
                token: claim.token.clone(),
                lease_len: claim.lease_len,
                cancel_tx,
                cancel_sent: false,
            },
        );

        let scheduler = self.scheduler.clone();
        let in_flight = Arc::clone(&self.in_flight);
        attempts.spawn(async move {
            let result = execute_attempt(scheduler, claim, channel).await;
            in_flight.lock().remove(&task_id);
            result
        });
    }

    /// Sleep until the next task is due, bounded by the poll interval and,
    /// while attempts run, by the lease renewal interval.
    fn idle_sleep(&self, config: &SchedulerConfig, saturated: bool) -> Duration {
        let mut sleep = config.poll_interval;
        if self.in_flight() > 0 {
            sleep = sleep.min(config.renew_interval());
        }
        if saturated {
            // Due tasks exist that this worker cannot take right now
            return sleep;
        }

        match self
            .scheduler
            .store()
            .next_wake_time(&self.scheduler.handlers().task_types())
        {
            Ok(Some(next)) => {
                let until = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep.min(until.max(Duration::from_millis(1)))
            }
            Ok(None) => sleep,
            Err(e) => {
                error!("Failed to read next wake time: {}", e);
                sleep
            }
        }
    }

    /// Claim up to `capacity` due tasks. Also returns how many candidates
    /// the store offered.
    fn claim_due(&self, capacity: usize) -> Result<(Vec<Box<Claim>>, usize)> {
        let candidates = self.scheduler.store().due_tasks(
            Utc::now(),
            &self.scheduler.handlers().task_types(),
            capacity,
        )?;

        let mut claims = Vec::new();
        let mut finalized = false;
        for id in &candidates {
            // A failed candidate must not drop claims already committed
            match self.try_claim(id) {
                Ok(ClaimAttempt::Claimed(claim)) => claims.push(claim),
                Ok(ClaimAttempt::Finalized) => finalized = true,
                Ok(ClaimAttempt::Skipped) => {}
                Err(e) => error!(task_id = %id, "Failed to claim task: {}", e),
            }
        }

        if finalized {
            self.scheduler.bus().publish(TASKS_CHANGED);
        }
        Ok((claims, candidates.len()))
    }

    /// Re-check the candidate inside an immediate transaction and take its
    /// lease if it is still eligible.
    fn try_claim(&self, id: &TaskId) -> Result<ClaimAttempt> {
        let config = self.scheduler.config();
        let mut txn = self.scheduler.store().begin()?;

        let Some(mut task) = txn.load_task(id)? else {
            return Ok(ClaimAttempt::Skipped);
        };
        if task.is_finished() {
            debug!(task_id = %id, "Task finished before it could be claimed");
            return Ok(ClaimAttempt::Skipped);
        }

        let handler = self.scheduler.handlers().get(&task.task_type)?.clone();

        let now = Utc::now();
        if task.cancelled.is_some() && !task.is_executing(now) {
            task.finish_cancelled(now)?;
            txn.update_task(&task)?;
            txn.commit()?;
            info!(task_id = %id, "Finalized cancellation of unattended task");
            return Ok(ClaimAttempt::Finalized);
        }

        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .or(handler.options.timeout);
        let lease_len = config.lease_for(timeout);
        let lease = Lease::new(config.worker_id.clone(), now + to_chrono(lease_len));
        let token = lease.token.clone();

        if !task.try_claim(lease, now) {
            observe::record_claim(false);
            debug!(task_id = %id, "Task no longer eligible, another worker got it");
            return Ok(ClaimAttempt::Skipped);
        }

        txn.update_task(&task)?;
        txn.commit()?;
        observe::record_claim(true);

        debug!(
            task_id = %id,
            worker = %config.worker_id,
            lease_ms = lease_len.as_millis() as u64,
            "Claimed task"
        );

        Ok(ClaimAttempt::Claimed(Box::new(Claim {
            task,
            token,
            lease_len,
            timeout,
            handler,
        })))
    }

    /// Extend the leases of every running attempt in one transaction.
    fn renew_leases(&self) {
        let held: Vec<(TaskId, String, Duration)> = self
            .in_flight
            .lock()
            .iter()
            .map(|(id, f)| (id.clone(), f.token.clone(), f.lease_len))
            .collect();
        if held.is_empty() {
            return;
        }

        let renew = || -> Result<Vec<TaskId>> {
            let now = Utc::now();
            let mut txn = self.scheduler.store().begin()?;
            let mut lost = Vec::new();
            for (id, token, lease_len) in &held {
                match txn.load_task(id)? {
                    Some(mut task) => {
                        if task.renew_lease(token, now + to_chrono(*lease_len)) {
                            txn.update_task(&task)?;
                        } else if !task.is_finished() {
                            lost.push(id.clone());
                        }
                    }
                    None => lost.push(id.clone()),
                }
            }
            txn.commit()?;
            Ok(lost)
        };

        match renew() {
            Ok(lost) => {
                for id in lost {
                    // Someone else may run the task now; stop ours if we can
                    warn!(task_id = %id, worker = %self.id(), "Lease lost while attempt is running");
                    if let Some(flight) = self.in_flight.lock().get_mut(&id) {
                        if let Some(tx) = &flight.cancel_tx {
                            let _ = tx.try_send(ControlMessage::Cancel);
                            flight.cancel_sent = true;
                        }
                    }
                }
            }
            Err(e) => error!(worker = %self.id(), "Failed to renew leases: {}", e),
        }
    }

    /// Forward cancellation requests recorded in the store to the
    /// cancellable attempts this worker is running.
    fn signal_cancellations(&self) {
        let candidates: Vec<(TaskId, mpsc::Sender<ControlMessage>)> = self
            .in_flight
            .lock()
            .iter()
            .filter(|(_, f)| !f.cancel_sent)
            .filter_map(|(id, f)| f.cancel_tx.clone().map(|tx| (id.clone(), tx)))
            .collect();

        for (id, tx) in candidates {
            let requested = match self.scheduler.store().get_task(&id) {
                Ok(Some(task)) => task.cancelled.is_some(),
                Ok(None) => false,
                Err(e) => {
                    error!(task_id = %id, "Failed to check cancellation: {}", e);
                    false
                }
            };
            if !requested {
                continue;
            }

            if let Some(flight) = self.in_flight.lock().get_mut(&id) {
                flight.cancel_sent = true;
            }

            match tx.try_send(ControlMessage::Cancel) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {
                    info!(task_id = %id, worker = %self.id(), "Signalled cancellation to running task");
                    tokio::spawn(async move {
                        tx.closed().await;
                        debug!(task_id = %id, "Cancellation acknowledged, task channel closed");
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(task_id = %id, "Task finished before cancellation was signalled");
                }
            }
        }
    }
}

fn log_joined(joined: std::result::Result<Result<()>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to report task attempt: {}", e),
        Err(e) => error!("Task attempt panicked: {}", e),
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
