//! In-memory sliding-window rate limiting.
//!
//! Each key keeps the instants of its recent hits; hits older than the
//! window fall out on the next check.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Limits each key to `max` hits per `window`
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max: usize,
    window: Duration,
    hits: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: DashMap::new(),
        }
    }

    /// Records a hit for `key` if it is under its limit
    ///
    /// ### Returns
    ///
    /// `Err(retry_after)` with the whole seconds until the oldest hit leaves
    /// the window when the key is over its limit
    pub fn check(&self, key: &str) -> Result<(), u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), u64> {
        let mut entry = self.hits.entry(key.to_string()).or_default();
        let hits = entry.value_mut();

        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.max {
            let retry_after = hits
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            // round up so clients never retry too early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            return Err(secs.max(1));
        }

        hits.push_back(now);
        Ok(())
    }

    /// Drops keys whose hits all left the window
    ///
    /// ### Returns
    ///
    /// Number of keys dropped
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let before = self.hits.len();
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });
        before.saturating_sub(self.hits.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_per_key() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));

        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_ok());
        let retry_after = limiter.check("u1").unwrap_err();
        assert!((1..=60).contains(&retry_after));

        assert!(limiter.check("u2").is_ok());
        assert!(limiter.check("u2").is_ok());
        assert!(limiter.check("u2").is_err());
    }

    #[test]
    fn test_window_rollover() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.check_at("u1", start).is_ok());
        assert_eq!(limiter.check_at("u1", start + Duration::from_secs(4)), Err(6));
        assert!(limiter.check_at("u1", start + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_purge_drops_idle_keys() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(1));
        limiter.check("u1").unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(limiter.purge(), 1);
        assert!(limiter.hits.is_empty());
    }
}
