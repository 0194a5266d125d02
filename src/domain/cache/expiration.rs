//! Expiration handling

use chrono::Utc;

/// Expirations above this many seconds are absolute unix timestamps
pub const RELATIVE_EXPIRATION_LIMIT: i64 = 30 * 86_400;

/// Normalizes caller-supplied expirations against a fixed reference time.
///
/// A value above [`RELATIVE_EXPIRATION_LIMIT`] that is not after `now` is
/// read as an offset and turned into `now + value`. Everything else passes
/// through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    now: i64,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpirationPolicy {
    /// Captures the current time as the reference
    pub fn new() -> Self {
        Self::with_now(Utc::now().timestamp())
    }

    pub fn with_now(now: i64) -> Self {
        Self { now }
    }

    pub fn now(&self) -> i64 {
        self.now
    }

    pub fn normalize(&self, expiration: i64) -> i64 {
        if expiration > RELATIVE_EXPIRATION_LIMIT && expiration <= self.now {
            expiration + self.now
        } else {
            expiration
        }
    }
}

/// When a stored entry stops being visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Never,
    /// Unix timestamp in seconds
    At(i64),
    /// Already expired when written
    Expired,
}

impl Deadline {
    /// Resolves a backend expiration value at time `now`: zero never
    /// expires, values up to the limit are relative seconds, larger values
    /// are absolute timestamps, negative values are expired.
    pub fn resolve(expiration: i64, now: i64) -> Self {
        match expiration {
            0 => Deadline::Never,
            e if e < 0 => Deadline::Expired,
            e if e <= RELATIVE_EXPIRATION_LIMIT => Deadline::At(now + e),
            e if e <= now => Deadline::Expired,
            e => Deadline::At(e),
        }
    }

    /// Deadline `secs` seconds after `now`, saturating at the far end
    pub fn after(secs: u64, now: i64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        Deadline::At(now.saturating_add(secs))
    }

    pub fn is_passed(&self, now: i64) -> bool {
        match self {
            Deadline::Never => false,
            Deadline::At(at) => now >= *at,
            Deadline::Expired => true,
        }
    }

    /// Seconds left at time `now`, `None` when the entry never expires
    pub fn remaining(&self, now: i64) -> Option<i64> {
        match self {
            Deadline::Never => None,
            Deadline::At(at) => Some(at.saturating_sub(now).max(0)),
            Deadline::Expired => Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_large_value_before_now_becomes_absolute() {
        let policy = ExpirationPolicy::with_now(NOW);
        let forty_days = 40 * 86_400;

        assert_eq!(policy.normalize(forty_days), forty_days + NOW);
    }

    #[test]
    fn test_small_values_pass_through() {
        let policy = ExpirationPolicy::with_now(NOW);

        assert_eq!(policy.normalize(0), 0);
        assert_eq!(policy.normalize(3600), 3600);
        assert_eq!(policy.normalize(RELATIVE_EXPIRATION_LIMIT), RELATIVE_EXPIRATION_LIMIT);
        assert_eq!(policy.normalize(-5), -5);
    }

    #[test]
    fn test_future_timestamp_passes_through() {
        let policy = ExpirationPolicy::with_now(NOW);
        assert_eq!(policy.normalize(NOW + 60), NOW + 60);
    }

    #[test]
    fn test_now_itself_is_reinterpreted() {
        let policy = ExpirationPolicy::with_now(NOW);
        assert_eq!(policy.normalize(NOW), NOW * 2);
    }

    #[test]
    fn test_reference_time_is_captured_once() {
        let policy = ExpirationPolicy::new();
        let first = policy.now();
        assert_eq!(policy.now(), first);
        assert!(first > 0);
    }

    #[test]
    fn test_deadline_resolution() {
        assert_eq!(Deadline::resolve(0, NOW), Deadline::Never);
        assert_eq!(Deadline::resolve(-1, NOW), Deadline::Expired);
        assert_eq!(Deadline::resolve(60, NOW), Deadline::At(NOW + 60));
        assert_eq!(Deadline::resolve(NOW + 60, NOW), Deadline::At(NOW + 60));
        assert_eq!(Deadline::resolve(NOW - 60, NOW), Deadline::Expired);
    }

    #[test]
    fn test_deadline_remaining() {
        assert_eq!(Deadline::Never.remaining(NOW), None);
        assert_eq!(Deadline::At(NOW + 5).remaining(NOW), Some(5));
        assert!(Deadline::At(NOW).is_passed(NOW));
        assert!(!Deadline::Never.is_passed(NOW));
    }

    #[test]
    fn test_deadline_after_saturates() {
        assert_eq!(Deadline::after(30, NOW), Deadline::At(NOW + 30));
        assert_eq!(Deadline::after(i64::MAX as u64, NOW), Deadline::At(i64::MAX));
        assert_eq!(Deadline::after(u64::MAX, NOW), Deadline::At(i64::MAX));
        assert!(!Deadline::after(u64::MAX, NOW).is_passed(NOW));
    }
}
