//! Jitter helpers for retry mechanisms

use rand::Rng;
use std::time::Duration;

/// Random jitter between 0 and `max_jitter_ms` (inclusive)
///
/// # Examples
/// ```
/// use dmm_bookbot::utils::jitter::generate_jitter_ms;
///
/// let jitter = generate_jitter_ms(100); // 0-100ms jitter
/// assert!(jitter <= 100);
/// ```
pub fn generate_jitter_ms(max_jitter_ms: u64) -> u64 {
    if max_jitter_ms == 0 {
        return 0;
    }

    rand::rng().random_range(0..=max_jitter_ms)
}

/// Random jitter up to `jitter_percent` of `base_value`
///
/// # Examples
/// ```
/// use dmm_bookbot::utils::jitter::generate_jitter_percent;
///
/// let jitter = generate_jitter_percent(1000, 25); // 0-250ms jitter (25% of 1000)
/// assert!(jitter <= 250);
/// ```
pub fn generate_jitter_percent(base_value: u64, jitter_percent: u8) -> u64 {
    if jitter_percent == 0 || base_value == 0 {
        return 0;
    }

    let max_jitter = (base_value * jitter_percent as u64) / 100;
    generate_jitter_ms(max_jitter)
}

/// Linear backoff for the given 1-based attempt, plus up to 25% jitter
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64 * u64::from(attempt.max(1));
    Duration::from_millis(base_ms + generate_jitter_percent(base_ms, 25))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_jitter_ms() {
        assert_eq!(generate_jitter_ms(0), 0);

        for _ in 0..100 {
            let jitter = generate_jitter_ms(50);
            assert!(jitter <= 50);
        }
    }

    #[test]
    fn test_generate_jitter_percent() {
        assert_eq!(generate_jitter_percent(1000, 0), 0);
        assert_eq!(generate_jitter_percent(0, 25), 0);

        for _ in 0..100 {
            let jitter = generate_jitter_percent(1000, 25);
            assert!(jitter <= 250);
        }
    }

    #[test]
    fn test_retry_delay_grows_with_attempts() {
        let base = Duration::from_millis(100);
        for _ in 0..20 {
            let first = retry_delay(base, 1);
            assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));

            let third = retry_delay(base, 3);
            assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(375));
        }
        assert_eq!(retry_delay(Duration::ZERO, 4), Duration::ZERO);
    }
}
