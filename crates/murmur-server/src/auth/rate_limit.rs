//! Sliding-window rate limiter for sign-up and sign-in attempts.
//!
//! Attempts are counted per remote IP over a rolling window. The limiter is
//! shared by every session, so it guards its map with a mutex held only for
//! the bookkeeping.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A rate limiter with a per-key attempt budget.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window. Zero disables limiting.
    max_attempts: usize,
    window: Duration,
    /// Per-key attempt timestamps.
    entries: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Auth attempts, `max_attempts` per minute per IP.
    pub fn per_minute(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::from_secs(60))
    }

    /// Record an attempt from `ip` if its budget allows.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&self, ip: IpAddr) -> bool {
        if self.max_attempts == 0 {
            return true;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let attempts = entries.entry(ip).or_default();
        attempts.retain(|t| now.duration_since(*t) < self.window);

        if attempts.len() >= self.max_attempts {
            debug!(%ip, attempts = attempts.len(), "auth attempt rate-limited");
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop keys whose attempts have all aged out.
    pub fn gc(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < self.window);
            !attempts.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn budget_per_ip() {
        let limiter = RateLimiter::per_minute(2);
        assert!(limiter.check_and_record(ip(1)));
        assert!(limiter.check_and_record(ip(1)));
        assert!(!limiter.check_and_record(ip(1)));
        // Other addresses are unaffected.
        assert!(limiter.check_and_record(ip(2)));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check_and_record(ip(1)));
        assert!(!limiter.check_and_record(ip(1)));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check_and_record(ip(1)));
    }

    #[test]
    fn zero_disables() {
        let limiter = RateLimiter::per_minute(0);
        for _ in 0..100 {
            assert!(limiter.check_and_record(ip(1)));
        }
    }

    #[test]
    fn gc_drops_stale_keys() {
        let limiter = RateLimiter::new(5, Duration::from_millis(10));
        limiter.check_and_record(ip(1));
        limiter.check_and_record(ip(2));
        assert_eq!(limiter.tracked(), 2);
        std::thread::sleep(Duration::from_millis(25));
        limiter.gc();
        assert_eq!(limiter.tracked(), 0);
    }
}
