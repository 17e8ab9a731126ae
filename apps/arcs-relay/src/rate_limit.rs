use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Command categories subject to rate limiting, each with its own
/// token-bucket capacity and refill rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    Touch,
    Text,
    Macro,
    Ocr,
    Auth,
}

impl RateCategory {
    pub fn capacity(self) -> f64 {
        match self {
            RateCategory::Touch => 100.0,
            RateCategory::Text => 10.0,
            RateCategory::Macro => 1.0,
            RateCategory::Ocr => 2.0,
            RateCategory::Auth => 5.0,
        }
    }

    /// Tokens restored per second. Auth is capped per minute, so its
    /// refill is spread across 60 seconds.
    pub fn refill_per_sec(self) -> f64 {
        match self {
            RateCategory::Auth => 5.0 / 60.0,
            other => other.capacity(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RateCategory::Touch => "touch",
            RateCategory::Text => "text",
            RateCategory::Macro => "macro",
            RateCategory::Ocr => "ocr",
            RateCategory::Auth => "auth",
        }
    }
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_update: Instant,
}

impl Bucket {
    fn new(category: RateCategory, now: Instant) -> Self {
        Self {
            tokens: category.capacity(),
            capacity: category.capacity(),
            refill_per_sec: category.refill_per_sec(),
            last_update: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_update = now;
    }
}

/// Token-bucket rate limiter with lazy refill.
///
/// Buckets are keyed by `{key}:{category}` where the key is a session id
/// for command categories and a device id (or source address) for auth.
/// The clock source is monotonic, so wall-clock adjustments neither refund
/// nor penalize tokens.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one token from the bucket for `(key, category)`. Returns
    /// false when the bucket is empty after refill; never blocks.
    pub fn allow(&self, category: RateCategory, key: &str) -> bool {
        let composite = format!("{}:{}", key, category);
        let now = Instant::now();

        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(composite)
            .or_insert_with(|| Bucket::new(category, now));

        bucket.refill(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return true;
        }
        false
    }

    /// Drop every bucket belonging to `key`, across all categories.
    /// Called when a session closes so a reconnect starts fresh.
    pub fn reset(&self, key: &str) {
        let prefix = format!("{}:", key);
        self.buckets.lock().retain(|k, _| !k.starts_with(&prefix));
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn touch_burst_is_bounded_by_capacity() {
        let limiter = RateLimiter::new();
        for i in 0..100 {
            assert!(limiter.allow(RateCategory::Touch, "s1"), "tap {} denied", i);
        }
        assert!(!limiter.allow(RateCategory::Touch, "s1"));
    }

    #[test]
    fn auth_attempts_limited_per_minute() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.allow(RateCategory::Auth, "dev1"));
        }
        // Refill is ~0.083 tokens/s; the sixth attempt within the same
        // instant must be denied.
        assert!(!limiter.allow(RateCategory::Auth, "dev1"));
    }

    #[test]
    fn tokens_refill_with_elapsed_time() {
        let limiter = RateLimiter::new();
        while limiter.allow(RateCategory::Touch, "s1") {}

        // 50ms at 100 tokens/s restores ~5 tokens.
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.allow(RateCategory::Touch, "s1"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow(RateCategory::Macro, "s1"));
        assert!(!limiter.allow(RateCategory::Macro, "s1"));
        assert!(limiter.allow(RateCategory::Macro, "s2"));
    }

    #[test]
    fn categories_are_independent_for_same_key() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow(RateCategory::Macro, "s1"));
        assert!(!limiter.allow(RateCategory::Macro, "s1"));
        assert!(limiter.allow(RateCategory::Ocr, "s1"));
        assert!(limiter.allow(RateCategory::Ocr, "s1"));
        assert!(!limiter.allow(RateCategory::Ocr, "s1"));
    }

    #[test]
    fn reset_clears_every_category_for_key() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow(RateCategory::Macro, "s1"));
        assert!(limiter.allow(RateCategory::Text, "s1"));
        assert!(limiter.allow(RateCategory::Touch, "other"));
        assert!(!limiter.allow(RateCategory::Macro, "s1"));

        limiter.reset("s1");
        assert_eq!(limiter.bucket_count(), 1);
        assert!(limiter.allow(RateCategory::Macro, "s1"));
    }

    #[test]
    fn reset_does_not_clobber_prefix_sharing_keys() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow(RateCategory::Macro, "s1"));
        assert!(limiter.allow(RateCategory::Macro, "s10"));
        assert!(!limiter.allow(RateCategory::Macro, "s10"));

        limiter.reset("s1");
        // "s10:macro" does not start with "s1:" and must survive.
        assert!(!limiter.allow(RateCategory::Macro, "s10"));
    }

    #[test]
    fn allowed_count_never_exceeds_capacity_plus_refill() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        let mut allowed = 0u32;
        for _ in 0..500 {
            if limiter.allow(RateCategory::Text, "s1") {
                allowed += 1;
            }
        }
        let elapsed = start.elapsed().as_secs_f64();
        let bound = RateCategory::Text.capacity() + elapsed * RateCategory::Text.refill_per_sec();
        assert!(
            (allowed as f64) <= bound + 1.0,
            "allowed {} exceeds bound {}",
            allowed,
            bound
        );
    }
}
