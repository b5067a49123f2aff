//! Per-source-address token bucket admission control.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Entries idle for longer than this are evicted on a later `admit`.
pub const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    /// key → bucket state.
    buckets: Mutex<HashMap<String, TokenBucket>>,
    /// Maximum tokens per bucket.
    burst: f64,
    /// Tokens regained per second.
    refill_rate: f64,
    stale_after: Duration,
    enabled: AtomicBool,
}

impl RateLimiter {
    pub fn new(refill_rate: f64, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            burst: burst as f64,
            refill_rate,
            stale_after: STALE_AFTER,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Attempts to take one token for `key`.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    pub(crate) fn admit_at(&self, key: &str, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let stale_after = self.stale_after;
        buckets.retain(|k, b| k == key || now.saturating_duration_since(b.last_seen) <= stale_after);

        let bucket = buckets.entry(key.to_owned()).or_insert(TokenBucket {
            tokens: self.burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Host part of a `host:port` remote address, or the raw string when it does
/// not parse as one.
pub fn client_key(remote: &str) -> String {
    if let Ok(addr) = remote.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    match remote.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() =>
        {
            host.to_owned()
        }
        _ => remote.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_reject() {
        let limiter = RateLimiter::new(1.0, 3);
        let now = Instant::now();

        assert!(limiter.admit_at("10.0.0.1", now));
        assert!(limiter.admit_at("10.0.0.1", now));
        assert!(limiter.admit_at("10.0.0.1", now));
        assert!(!limiter.admit_at("10.0.0.1", now));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = RateLimiter::new(2.0, 1);
        let now = Instant::now();

        assert!(limiter.admit_at("k", now));
        assert!(!limiter.admit_at("k", now + Duration::from_millis(100)));
        assert!(limiter.admit_at("k", now + Duration::from_millis(700)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(0.1, 2);
        let now = Instant::now();

        assert!(limiter.admit_at("a", now));
        assert!(limiter.admit_at("a", now));
        assert!(!limiter.admit_at("a", now));

        assert!(limiter.admit_at("b", now));
        assert!(limiter.admit_at("b", now));
    }

    #[test]
    fn test_stale_entries_evicted() {
        let limiter = RateLimiter::new(1.0, 5);
        let now = Instant::now();

        assert!(limiter.admit_at("old", now));
        assert_eq!(limiter.tracked_keys(), 1);

        let later = now + STALE_AFTER + Duration::from_secs(1);
        assert!(limiter.admit_at("new", later));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_fresh_entries_kept() {
        let limiter = RateLimiter::new(1.0, 5);
        let now = Instant::now();

        limiter.admit_at("a", now);
        limiter.admit_at("b", now + Duration::from_secs(60));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_disabled_admits_without_state() {
        let limiter = RateLimiter::new(0.0, 1);
        limiter.set_enabled(false);

        for _ in 0..10 {
            assert!(limiter.admit("k"));
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_client_key() {
        assert_eq!(client_key("192.168.1.9:5123"), "192.168.1.9");
        assert_eq!(client_key("[::1]:8080"), "::1");
        assert_eq!(client_key("gateway.local:80"), "gateway.local");
        assert_eq!(client_key("not-an-address"), "not-an-address");
        assert_eq!(client_key("::1"), "::1");
    }
}
