//! Exponential backoff state for one rate-limited credential
//!
//! Pure state, no clock access: every operation takes `now` so the policy
//! is testable without sleeping through a two-minute floor.
//!
//! Rules:
//! - first rate-limit (or first after recovery) uses the floor duration
//! - a repeat while still limited doubles the duration, capped at the ceiling
//! - the deadline only grows or holds, never shrinks, until it expires
//! - expiry is observed lazily: `clear_if_expired()` runs at selection time,
//!   there is no background timer

use std::time::{Duration, Instant};

/// Floor and ceiling for the doubling backoff window.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(2 * 60),
            ceiling: Duration::from_secs(60 * 60),
        }
    }
}

/// Backoff state carried by each credential slot.
#[derive(Debug, Default)]
pub struct Backoff {
    duration: Option<Duration>,
    until: Option<Instant>,
    consecutive_failures: u32,
}

impl Backoff {
    /// Record a rate-limit event at `now`: floor on a fresh or recovered
    /// credential, double (capped) while still limited.
    pub fn record(&mut self, policy: &BackoffPolicy, now: Instant) {
        let next = match (self.duration, self.until) {
            (Some(d), Some(u)) if u > now => policy.ceiling.min(d * 2),
            _ => policy.floor,
        };
        self.duration = Some(next);
        self.until = Some(now + next);
        self.consecutive_failures += 1;
    }

    /// Whether the credential is under active backoff at `now`.
    pub fn is_limited(&self, now: Instant) -> bool {
        self.until.is_some_and(|u| u > now)
    }

    /// Clear expired backoff state. Returns true if a transition from
    /// limited to eligible happened.
    pub fn clear_if_expired(&mut self, now: Instant) -> bool {
        match self.until {
            Some(u) if now >= u => {
                self.duration = None;
                self.until = None;
                self.consecutive_failures = 0;
                true
            }
            _ => false,
        }
    }

    /// Deadline of the active backoff window, if any.
    pub fn until(&self) -> Option<Instant> {
        self.until
    }

    /// Time left until the deadline, zero-clamped.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.until.map(|u| u.saturating_duration_since(now))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::default()
    }

    #[test]
    fn default_policy_is_two_minutes_to_one_hour() {
        let p = BackoffPolicy::default();
        assert_eq!(p.floor, Duration::from_secs(120));
        assert_eq!(p.ceiling, Duration::from_secs(3600));
    }

    #[test]
    fn first_event_uses_floor() {
        let mut b = Backoff::default();
        let t0 = Instant::now();
        b.record(&policy(), t0);
        assert_eq!(b.remaining(t0), Some(Duration::from_secs(120)));
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[test]
    fn repeat_before_recovery_doubles() {
        let mut b = Backoff::default();
        let t0 = Instant::now();
        b.record(&policy(), t0);
        let t1 = t0 + Duration::from_secs(1);
        b.record(&policy(), t1);
        assert_eq!(b.remaining(t1), Some(Duration::from_secs(240)));
        let t2 = t1 + Duration::from_secs(1);
        b.record(&policy(), t2);
        assert_eq!(b.remaining(t2), Some(Duration::from_secs(480)));
    }

    #[test]
    fn growth_caps_at_ceiling_and_never_exceeds_it() {
        let mut b = Backoff::default();
        let mut t = Instant::now();
        for _ in 0..20 {
            b.record(&policy(), t);
            t += Duration::from_secs(1);
        }
        assert_eq!(b.remaining(t - Duration::from_secs(1)), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn deadline_never_shrinks_under_repeated_marks() {
        let mut b = Backoff::default();
        let t0 = Instant::now();
        b.record(&policy(), t0);
        let first_deadline = b.until().unwrap();
        b.record(&policy(), t0 + Duration::from_millis(5));
        assert!(b.until().unwrap() >= first_deadline);
        // saturate at the ceiling, then mark again with the same clock value
        let mut t = t0;
        for _ in 0..20 {
            b.record(&policy(), t);
            t += Duration::from_secs(1);
        }
        let capped = b.until().unwrap();
        b.record(&policy(), t - Duration::from_secs(1));
        assert!(b.until().unwrap() >= capped);
    }

    #[test]
    fn event_after_recovery_resets_to_floor() {
        let mut b = Backoff::default();
        let t0 = Instant::now();
        b.record(&policy(), t0);
        b.record(&policy(), t0 + Duration::from_secs(1));
        // deadline is t0+1s+240s; an event past it starts over at the floor
        let later = t0 + Duration::from_secs(600);
        b.record(&policy(), later);
        assert_eq!(b.remaining(later), Some(Duration::from_secs(120)));
    }

    #[test]
    fn clear_if_expired_is_lazy_and_resets_failures() {
        let mut b = Backoff::default();
        let t0 = Instant::now();
        b.record(&policy(), t0);
        assert!(b.is_limited(t0));
        assert!(!b.clear_if_expired(t0));

        let past_deadline = t0 + Duration::from_secs(121);
        assert!(!b.is_limited(past_deadline));
        assert!(b.clear_if_expired(past_deadline));
        assert_eq!(b.consecutive_failures(), 0);
        assert!(b.until().is_none());
    }
}
