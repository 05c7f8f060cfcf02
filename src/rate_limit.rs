use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    /// Expired entries are swept every `cleanup_interval` checks.
    pub cleanup_interval: u64,
    /// Hard cap on distinct client addresses held in memory.
    pub max_tracked_ips: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(15 * 60),
            cleanup_interval: 100,
            max_tracked_ips: 10_000,
        }
    }
}

/// RateLimiter
///
/// Sliding-window limiter keyed by client IP. Used in front of the login endpoint.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: RwLock<HashMap<IpAddr, Vec<Instant>>>,
    checks: AtomicU64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            checks: AtomicU64::new(0),
        }
    }

    /// Records one attempt from `ip`, or rejects it with 429 when the window is full.
    pub fn check(&self, ip: IpAddr) -> Result<(), ApiError> {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);

        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            self.cleanup();
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if !state.contains_key(&ip) && state.len() >= self.config.max_tracked_ips {
            state.retain(|_, stamps| {
                stamps.retain(|&t| t > cutoff);
                !stamps.is_empty()
            });
            if state.len() >= self.config.max_tracked_ips {
                tracing::warn!(%ip, tracked = state.len(), "rate limiter full, rejecting new client");
                return Err(ApiError::RateLimited);
            }
        }

        let stamps = state.entry(ip).or_default();
        stamps.retain(|&t| t > cutoff);

        if stamps.len() >= self.config.max_requests as usize {
            tracing::warn!(%ip, attempts = stamps.len(), max = self.config.max_requests, "login rate limit exceeded");
            return Err(ApiError::RateLimited);
        }

        stamps.push(now);
        Ok(())
    }

    /// Drops clients with no attempt inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.retain(|_, stamps| {
            stamps.retain(|&t| t > cutoff);
            !stamps.is_empty()
        });
    }

    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, thread};

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn limiter(max_requests: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimitConfig { max_requests, window, ..Default::default() })
    }

    #[test]
    fn test_rejects_after_limit() {
        let limiter = limiter(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.check(ip(1)).is_ok());
        }
        assert!(matches!(limiter.check(ip(1)), Err(ApiError::RateLimited)));
    }

    #[test]
    fn test_clients_are_tracked_separately() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());
        assert!(limiter.check(ip(2)).is_ok());
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(1, Duration::from_millis(200));
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());

        thread::sleep(Duration::from_millis(300));
        assert!(limiter.check(ip(1)).is_ok());
    }

    #[test]
    fn test_cleanup_forgets_idle_clients() {
        let limiter = limiter(5, Duration::from_millis(100));
        limiter.check(ip(1)).unwrap();
        limiter.check(ip(2)).unwrap();
        assert_eq!(limiter.tracked_ips(), 2);

        thread::sleep(Duration::from_millis(150));
        limiter.cleanup();
        assert_eq!(limiter.tracked_ips(), 0);
    }

    #[test]
    fn test_tracked_ip_cap() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_tracked_ips: 2,
            window: Duration::from_secs(60),
            ..Default::default()
        });
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(2)).is_ok());
        assert!(limiter.check(ip(3)).is_err());
        // Known clients keep their quota.
        assert!(limiter.check(ip(1)).is_ok());
    }
}
