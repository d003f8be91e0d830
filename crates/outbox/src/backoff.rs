//! Delivery retry policy.
//!
//! Exponential backoff with full jitter: the delay before retry `n` is drawn
//! uniformly from `[0, min(base * 2^(n-1), cap)]`. A receiver's `Retry-After`
//! wins when it asks for at least `base`, even beyond `cap`; only values past
//! [`RETRY_AFTER_LIMIT`] are cut down.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Longest `Retry-After` honoured. Keeps a bogus header (a year, `u64::MAX`)
/// from parking a delivery forever.
pub const RETRY_AFTER_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self { max_attempts, base, cap }
    }

    /// Upper bound of the jittered delay after attempt `attempt` (1-indexed).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |d| d.min(self.cap))
    }

    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }

    /// Delay before the next attempt, honouring `Retry-After`.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(requested) if requested >= self.base => requested.min(RETRY_AFTER_LIMIT),
            _ => self.delay_for_attempt(attempt, &mut rand::thread_rng()),
        }
    }

    /// No further attempt is allowed once `attempts` calls were made.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP-date.
///
/// Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(10, Duration::from_secs(30), Duration::from_secs(3600))
    }

    #[test]
    fn ceiling_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.ceiling(1), Duration::from_secs(30));
        assert_eq!(p.ceiling(2), Duration::from_secs(60));
        assert_eq!(p.ceiling(5), Duration::from_secs(480));
        assert_eq!(p.ceiling(8), Duration::from_secs(3600));
        assert_eq!(p.ceiling(40), Duration::from_secs(3600));
    }

    #[test]
    fn retry_after_overrides_only_above_base() {
        let p = policy();
        assert_eq!(p.next_delay(1, Some(Duration::from_secs(120))), Duration::from_secs(120));
        assert!(p.next_delay(1, Some(Duration::from_secs(1))) <= Duration::from_secs(30));
    }

    #[test]
    fn retry_after_may_exceed_the_backoff_cap() {
        let p = policy();
        assert_eq!(p.next_delay(1, Some(Duration::from_secs(7200))), Duration::from_secs(7200));
        assert_eq!(p.next_delay(3, Some(RETRY_AFTER_LIMIT)), RETRY_AFTER_LIMIT);
        assert_eq!(p.next_delay(1, Some(Duration::from_secs(30 * 86_400))), RETRY_AFTER_LIMIT);
        assert_eq!(p.next_delay(1, Some(Duration::from_secs(u64::MAX))), RETRY_AFTER_LIMIT);
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 26, 0).unwrap();
        assert_eq!(parse_retry_after(" 120 ", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn exhaustion_is_inclusive() {
        let p = policy();
        assert!(!p.is_exhausted(9));
        assert!(p.is_exhausted(10));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_ceiling(attempt in 1u32..64, seed in any::<u64>()) {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let p = policy();
            let d = p.delay_for_attempt(attempt, &mut rng);
            prop_assert!(d <= p.ceiling(attempt));
            prop_assert!(d <= p.cap);
        }
    }
}
