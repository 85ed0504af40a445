use std::time::Duration;

use crate::constants::{BACKOFF_BASE_MS, BACKOFF_CAP_MS};

/// Delay before attempt number `attempt` (zero-based):
/// `min(1000 * 2^attempt, 30000)` milliseconds.
///
/// Used both by the persistent retry queue and by the echo transport's
/// reconnect loop.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let millis = BACKOFF_BASE_MS.saturating_mul(factor).min(BACKOFF_CAP_MS);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let delays: Vec<u64> = (0..=5).map(|n| backoff_delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
    }

    #[test]
    fn test_backoff_large_attempts_stay_capped() {
        assert_eq!(backoff_delay(40), Duration::from_millis(BACKOFF_CAP_MS));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_millis(BACKOFF_CAP_MS));
    }
}
