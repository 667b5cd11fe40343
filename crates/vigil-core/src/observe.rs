//! Optional metrics instrumentation for vigil.
//!
//! When the `observe` feature is enabled, key operations emit counters,
//! histograms, and gauges via the [`metrics`] crate. A downstream
//! application must install a metrics recorder (e.g. `metrics-exporter-prometheus`)
//! to collect the data.
//!
//! When the feature is **not** enabled every function in this module is a
//! zero-cost no-op.

/// Record a finished attempt (counter + duration histogram).
///
/// - `vigil.attempt.total` – counter with `outcome` label
/// - `vigil.attempt.duration_seconds` – histogram
#[inline]
pub fn record_attempt(duration: std::time::Duration, outcome: &'static str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("vigil.attempt.total", "outcome" => outcome).increment(1);
        metrics::histogram!("vigil.attempt.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, outcome);
    }
}

/// Record a claim attempt; `won == false` means another worker got there first.
///
/// - `vigil.claim.total` – counter with `result` label (`won` / `lost`)
#[inline]
pub fn record_claim(won: bool) {
    #[cfg(feature = "observe")]
    {
        let result = if won { "won" } else { "lost" };
        metrics::counter!("vigil.claim.total", "result" => result).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = won;
    }
}

/// Record how long a result waiter was suspended.
///
/// - `vigil.wait.duration_seconds` – histogram
#[inline]
pub fn record_wait(duration: std::time::Duration) {
    #[cfg(feature = "observe")]
    {
        metrics::histogram!("vigil.wait.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = duration;
    }
}

/// Set the number of attempts a worker currently has in flight.
///
/// - `vigil.worker.in_flight` – gauge
#[inline]
pub fn set_in_flight(count: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::gauge!("vigil.worker.in_flight").set(count as f64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = count;
    }
}
