use std::time::Instant;

/// Consecutive rejected frames before a connection is considered abusive.
const ABUSE_THRESHOLD: u32 = 50;

/// Token bucket guarding one connection's inbound frames.
///
/// The bucket allows a burst of `capacity` frames and refills at `refill_rate`
/// frames per second. A client that keeps sending into an empty bucket is
/// reported as abusive so the server can drop it.
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: u32,
    refill_rate: f64,
    /// Consecutive violation count (resets on an allowed frame).
    violations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Allowed,
    Limited,
    Abusive,
}

impl TokenBucket {
    pub fn new(capacity: u32, per_second: f64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
            capacity,
            refill_rate: per_second,
            violations: 0,
        }
    }

    pub fn check(&mut self) -> CheckResult {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> CheckResult {
        let cap = self.capacity as f64;
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(cap);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.violations = 0;
            CheckResult::Allowed
        } else {
            self.violations += 1;
            if self.violations >= ABUSE_THRESHOLD {
                CheckResult::Abusive
            } else {
                CheckResult::Limited
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn allows_within_burst() {
        let mut bucket = TokenBucket::new(5, 1.0);
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(bucket.check_at(now), CheckResult::Allowed);
        }
        assert_eq!(bucket.check_at(now), CheckResult::Limited);
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(2, 10.0);
        let now = Instant::now();
        bucket.check_at(now);
        bucket.check_at(now);
        assert_eq!(bucket.check_at(now), CheckResult::Limited);
        let later = now + Duration::from_millis(150);
        assert_eq!(bucket.check_at(later), CheckResult::Allowed);
    }

    #[test]
    fn refill_is_capped() {
        let mut bucket = TokenBucket::new(3, 100.0);
        let now = Instant::now() + Duration::from_secs(60);
        for _ in 0..3 {
            assert_eq!(bucket.check_at(now), CheckResult::Allowed);
        }
        assert_eq!(bucket.check_at(now), CheckResult::Limited);
    }

    #[test]
    fn sustained_flood_is_abusive() {
        let mut bucket = TokenBucket::new(1, 0.001);
        let now = Instant::now();
        assert_eq!(bucket.check_at(now), CheckResult::Allowed);
        for _ in 0..ABUSE_THRESHOLD - 1 {
            assert_eq!(bucket.check_at(now), CheckResult::Limited);
        }
        assert_eq!(bucket.check_at(now), CheckResult::Abusive);
    }
}
