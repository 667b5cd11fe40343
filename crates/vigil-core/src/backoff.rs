//! Retry backoff schedule.
//!
//! The delay before the next attempt depends only on how many attempts have
//! failed so far. The table saturates at its last entry.

use std::time::Duration;

/// Backoff delays in minutes, indexed by `failures - 1`.
pub const BACKOFF_MINUTES: [u64; 7] = [15, 30, 60, 120, 240, 480, 1440];

/// Delay before the next attempt after `failures` failed attempts.
///
/// `failures == 0` is treated like the first failure.
pub fn backoff(failures: u32) -> Duration {
    Duration::from_secs(backoff_minutes(failures) * 60)
}

/// Same as [`backoff`] but as a `chrono::Duration` for timestamp arithmetic.
pub fn backoff_delay(failures: u32) -> chrono::Duration {
    chrono::Duration::minutes(backoff_minutes(failures) as i64)
}

fn backoff_minutes(failures: u32) -> u64 {
    let idx = (failures.max(1) as usize - 1).min(BACKOFF_MINUTES.len() - 1);
    BACKOFF_MINUTES[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_table() {
        let minutes: Vec<u64> = (1..=8).map(|f| backoff(f).as_secs() / 60).collect();
        assert_eq!(minutes, vec![15, 30, 60, 120, 240, 480, 1440, 1440]);
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff(50), Duration::from_secs(1440 * 60));
        assert_eq!(backoff(u32::MAX), Duration::from_secs(1440 * 60));
    }

    #[test]
    fn test_zero_failures_uses_first_slot() {
        assert_eq!(backoff(0), backoff(1));
    }

    #[test]
    fn test_chrono_delay_matches() {
        for failures in 0..10 {
            assert_eq!(
                backoff_delay(failures).num_seconds() as u64,
                backoff(failures).as_secs()
            );
        }
    }
}
