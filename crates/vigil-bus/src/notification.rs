//! Change notifications for waking workers and waiters when tasks change

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Event published after every commit that modified task records
pub const TASKS_CHANGED: &str = "tasks_changed";

/// Buffered notifications per event before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 64;

/// Publish/subscribe channel keyed by coarse event names
///
/// Delivery is at-least-once: a subscriber may see duplicates, or one
/// wake-up standing in for several publishes. Subscribers must re-read
/// store state after every wake-up instead of trusting the event itself.
pub trait ChangeBus: Send + Sync {
    /// Notify every current subscriber of `event`
    fn publish(&self, event: &str);

    /// Subscribe to `event`. Only publishes issued after this call are
    /// observed.
    fn subscribe(&self, event: &str) -> Subscription;
}

/// In-process bus backed by one broadcast channel per event
#[derive(Clone, Default)]
pub struct LocalChangeBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
}

impl LocalChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, event: &str) -> broadcast::Sender<()> {
        if let Some(tx) = self.channels.read().get(event) {
            return tx.clone();
        }
        self.channels
            .write()
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl ChangeBus for LocalChangeBus {
    fn publish(&self, event: &str) {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(event) {
            // No receivers is not an error here
            let receivers = tx.send(()).unwrap_or(0);
            trace!(event, receivers, "Published change");
        }
    }

    fn subscribe(&self, event: &str) -> Subscription {
        Subscription {
            inner: SubscriptionInner::Channel(self.sender(event).subscribe()),
        }
    }
}

/// A bus that never delivers anything; every waiter falls back to polling
#[derive(Clone, Copy, Default)]
pub struct PollingBus;

impl ChangeBus for PollingBus {
    fn publish(&self, _event: &str) {}

    fn subscribe(&self, _event: &str) -> Subscription {
        Subscription {
            inner: SubscriptionInner::Never,
        }
    }
}

enum SubscriptionInner {
    Channel(broadcast::Receiver<()>),
    Never,
}

/// Receiving side of a bus subscription
pub struct Subscription {
    inner: SubscriptionInner,
}

impl Subscription {
    /// Wait until something was published on the subscribed event
    ///
    /// Missed notifications (lag) count as a change. A closed channel
    /// never resolves, leaving callers to their polling fallback.
    pub async fn changed(&mut self) {
        match &mut self.inner {
            SubscriptionInner::Channel(rx) => match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Collapse a burst of duplicates into one wake-up
                    while rx.try_recv().is_ok() {}
                }
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            },
            SubscriptionInner::Never => std::future::pending::<()>().await,
        }
    }
}

/// Strategy for waking a loop that waits on task changes
#[derive(Clone)]
pub enum WakeStrategy {
    /// Poll periodically
    Poll { interval: Duration },

    /// Wake on bus notifications, polling at `fallback` in case one is lost
    Notify {
        bus: Arc<dyn ChangeBus>,
        fallback: Duration,
    },
}

impl WakeStrategy {
    /// Create a polling wake strategy with the given interval
    pub fn poll(interval: Duration) -> Self {
        Self::Poll { interval }
    }

    /// Create a notification-based wake strategy
    pub fn notify(bus: Arc<dyn ChangeBus>, fallback: Duration) -> Self {
        Self::Notify { bus, fallback }
    }

    /// Subscribe to `event`. Do this *before* reading store state so a
    /// commit between the read and the wait is not missed.
    pub fn subscribe(&self, event: &str) -> Subscription {
        match self {
            WakeStrategy::Poll { .. } => PollingBus.subscribe(event),
            WakeStrategy::Notify { bus, .. } => bus.subscribe(event),
        }
    }

    /// Longest time a waiter sleeps without re-checking the store
    pub fn interval(&self) -> Duration {
        match self {
            WakeStrategy::Poll { interval } => *interval,
            WakeStrategy::Notify { fallback, .. } => *fallback,
        }
    }

    /// Wait for a change on `subscription`, bounded by the polling
    /// interval and an optional earlier deadline
    pub async fn wait(&self, subscription: &mut Subscription, deadline: Option<tokio::time::Instant>) {
        let mut until = tokio::time::Instant::now() + self.interval();
        if let Some(deadline) = deadline {
            until = until.min(deadline);
        }

        tokio::select! {
            _ = subscription.changed() => {}
            _ = tokio::time::sleep_until(until) => {}
        }
    }
}
