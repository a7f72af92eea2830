// Fixed-window rate limiter keyed by an arbitrary string (phone number, IP).
//
// - Used for OTP issuance: N requests per phone per window
// - Process local. Behind several replicas each replica counts on its own.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: DashMap::new(),
        }
    }

    pub fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(3600))
    }

    /// Counts one hit for `key`. Err carries the time until the window resets.
    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let mut entry = self.buckets.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        let w = entry.value_mut();
        if now.duration_since(w.started) >= self.window {
            w.started = now;
            w.count = 0;
        }
        if w.count >= self.limit {
            return Err(self.window.saturating_sub(now.duration_since(w.started)));
        }
        w.count += 1;
        Ok(())
    }

    pub fn check(&self, key: &str) -> Result<(), ApiError> {
        self.check_at(key, Instant::now()).map_err(|retry| {
            ApiError::TooManyRequests(format!(
                "Too many requests, try again in {} seconds",
                retry.as_secs().max(1)
            ))
        })
    }

    /// Drops windows that have fully elapsed.
    pub fn prune(&self, now: Instant) {
        self.buckets
            .retain(|_, w| now.duration_since(w.started) < self.window);
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let rl = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(rl.check_at("9876543210", t0).is_ok());
        }
        let retry = rl.check_at("9876543210", t0 + Duration::from_secs(20)).unwrap_err();
        assert_eq!(retry, Duration::from_secs(40));
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.check_at("a", t0).is_ok());
        assert!(rl.check_at("b", t0).is_ok());
        assert!(rl.check_at("a", t0).is_err());
    }

    #[test]
    fn window_resets_after_elapsing() {
        let rl = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.check_at("k", t0).is_ok());
        assert!(rl.check_at("k", t0 + Duration::from_secs(59)).is_err());
        assert!(rl.check_at("k", t0 + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn prune_forgets_expired_windows() {
        let rl = RateLimiter::new(5, Duration::from_secs(10));
        let t0 = Instant::now();
        rl.check_at("old", t0).unwrap();
        rl.check_at("new", t0 + Duration::from_secs(8)).unwrap();
        rl.prune(t0 + Duration::from_secs(12));
        assert_eq!(rl.tracked_keys(), 1);
    }

    #[test]
    fn rejection_maps_to_429() {
        let rl = RateLimiter::per_hour(0);
        let err = rl.check("x").unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
    }
}
