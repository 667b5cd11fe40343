//! Scheduler configuration.

use std::time::Duration;

/// Configuration for the scheduler and its workers.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest a worker or waiter sleeps without re-reading the store,
    /// even when no change notification arrives.
    pub poll_interval: Duration,
    /// Maximum number of attempts one worker runs concurrently.
    pub max_concurrent_tasks: usize,
    /// How long a claim stays valid without renewal.
    pub lease_duration: Duration,
    /// Extra lease time on top of a per-attempt timeout.
    pub lease_grace: Duration,
    /// Identifier recorded as the owner of this process's leases.
    pub worker_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_concurrent_tasks: 10,
            lease_duration: Duration::from_secs(30),
            lease_grace: Duration::from_secs(5),
            worker_id: default_worker_id(),
        }
    }
}

fn default_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum concurrent tasks.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Set the grace added to timed attempts' leases.
    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    /// Set the worker id.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Lease length for an attempt with the given timeout.
    pub fn lease_for(&self, timeout: Option<Duration>) -> Duration {
        match timeout {
            Some(timeout) => self.lease_duration.max(timeout + self.lease_grace),
            None => self.lease_duration,
        }
    }

    /// Interval at which a worker wakes up to renew its leases.
    pub fn renew_interval(&self) -> Duration {
        (self.lease_duration / 3).min(self.poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_covers_timeout() {
        let config = SchedulerConfig::new()
            .with_lease_duration(Duration::from_secs(10))
            .with_lease_grace(Duration::from_secs(2));

        assert_eq!(config.lease_for(None), Duration::from_secs(10));
        assert_eq!(config.lease_for(Some(Duration::from_secs(1))), Duration::from_secs(10));
        assert_eq!(config.lease_for(Some(Duration::from_secs(60))), Duration::from_secs(62));
    }

    #[test]
    fn test_worker_ids_are_distinct() {
        assert_ne!(SchedulerConfig::new().worker_id, SchedulerConfig::new().worker_id);
        assert!(SchedulerConfig::new().worker_id.starts_with("worker-"));
    }
}
