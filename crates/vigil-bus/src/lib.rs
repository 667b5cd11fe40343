//! # Vigil Bus
//!
//! Coarse change notifications for the vigil task scheduler.
//!
//! After a transaction that touched task records commits, the committer
//! publishes [`TASKS_CHANGED`]. Idle workers and result waiters subscribe
//! to it so they re-read the store promptly instead of sleeping out a full
//! polling interval. Notifications carry no payload and may be duplicated;
//! the store stays the only source of truth.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vigil_bus::{ChangeBus, LocalChangeBus, TASKS_CHANGED};
//!
//! # async fn demo() {
//! let bus = LocalChangeBus::new();
//! let mut sub = bus.subscribe(TASKS_CHANGED);
//!
//! bus.publish(TASKS_CHANGED);
//! sub.changed().await;
//! # }
//! ```

pub mod notification;

pub use notification::{
    ChangeBus, LocalChangeBus, PollingBus, Subscription, WakeStrategy, TASKS_CHANGED,
};
