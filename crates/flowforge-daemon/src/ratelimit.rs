//! Per-client-IP rate limiting with auth-failure blocking.
//!
//! One entry per client IP tracks a one-minute request window and an
//! auth-failure counter; crossing the failure limit blocks the IP for a
//! configured duration regardless of payload. The map is bounded:
//! pruning runs amortized (every N operations or when over the cap),
//! dropping stale entries first and then evicting least-recently-seen
//! non-blocked entries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rolling window for request and failure counters.
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Entry {
    window_start: Instant,
    request_count: u32,
    auth_failures: u32,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            request_count: 0,
            auth_failures: 0,
            blocked_until: None,
            last_seen: now,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.request_count = 0;
            self.auth_failures = 0;
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Rate limiter state.
#[derive(Debug)]
struct Inner {
    entries: HashMap<String, Entry>,
    op_count: u64,
}

/// Per-IP request limiter with brute-force blocking.
#[derive(Debug)]
pub struct RateLimiter {
    request_limit: u32,
    auth_fail_limit: u32,
    block_duration: Duration,
    max_entries: usize,
    stale_ttl: Duration,
    prune_every: u64,
    inner: Mutex<Inner>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(120, 10, Duration::from_secs(600))
    }
}

impl RateLimiter {
    /// Builds a limiter with the given per-minute request limit, auth
    /// failure limit, and block duration.
    #[must_use]
    pub fn new(request_limit: u32, auth_fail_limit: u32, block_duration: Duration) -> Self {
        Self::with_bounds(request_limit, auth_fail_limit, block_duration, 10_000, None, 256)
    }

    /// Fully parameterized constructor (bounds are test-visible).
    #[must_use]
    pub fn with_bounds(
        request_limit: u32,
        auth_fail_limit: u32,
        block_duration: Duration,
        max_entries: usize,
        stale_ttl: Option<Duration>,
        prune_every: u64,
    ) -> Self {
        let block_duration = if block_duration.is_zero() {
            Duration::from_secs(600)
        } else {
            block_duration
        };
        let stale_ttl =
            stale_ttl.unwrap_or_else(|| Duration::from_secs(1800).max(block_duration * 3));
        Self {
            request_limit: request_limit.max(1),
            auth_fail_limit: auth_fail_limit.max(1),
            block_duration,
            max_entries: max_entries.max(1),
            stale_ttl,
            prune_every: prune_every.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                op_count: 0,
            }),
        }
    }

    /// Admits or rejects one request from `ip`.
    pub fn allow(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.maybe_prune(&mut inner, now);
        let entry = inner
            .entries
            .entry(ip.to_string())
            .or_insert_with(|| Entry::new(now));
        entry.last_seen = now;
        if entry.is_blocked(now) {
            return false;
        }
        entry.roll_window(now);
        entry.request_count += 1;
        entry.request_count <= self.request_limit
    }

    /// Records an auth failure; returns true when the IP is now blocked.
    pub fn add_auth_failure(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.maybe_prune(&mut inner, now);
        let block_duration = self.block_duration;
        let limit = self.auth_fail_limit;
        let entry = inner
            .entries
            .entry(ip.to_string())
            .or_insert_with(|| Entry::new(now));
        entry.last_seen = now;
        entry.roll_window(now);
        entry.auth_failures += 1;
        if entry.auth_failures >= limit {
            entry.blocked_until = Some(now + block_duration);
            return true;
        }
        false
    }

    /// Whether the IP is currently blocked for auth abuse.
    pub fn is_blocked(&self, ip: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner.entries.get(ip).is_some_and(|e| e.is_blocked(now))
    }

    /// Clears the failure counter after a successful authentication.
    pub fn clear_auth_failures(&self, ip: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(ip) {
            entry.auth_failures = 0;
        }
    }

    /// Current entry count (test support).
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    fn maybe_prune(&self, inner: &mut Inner, now: Instant) {
        inner.op_count += 1;
        let due = inner.entries.len() > self.max_entries
            || inner.op_count % self.prune_every == 0;
        if !due {
            return;
        }

        // Stale, unblocked entries go first.
        inner.entries.retain(|_, entry| {
            entry.is_blocked(now) || now.duration_since(entry.last_seen) < self.stale_ttl
        });
        if inner.entries.len() <= self.max_entries {
            return;
        }

        // Still over the cap: evict least-recently-seen, non-blocked
        // entries before touching blocked ones.
        let mut candidates: Vec<(String, Instant, bool)> = inner
            .entries
            .iter()
            .map(|(ip, entry)| (ip.clone(), entry.last_seen, entry.is_blocked(now)))
            .collect();
        candidates.sort_by(|a, b| {
            a.2.cmp(&b.2)
                .then(a.1.cmp(&b.1))
                .then_with(|| a.0.cmp(&b.0))
        });
        let over = inner.entries.len() - self.max_entries;
        for (ip, _, _) in candidates.into_iter().take(over) {
            inner.entries.remove(&ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_limit_applies_per_ip() {
        let limiter = RateLimiter::new(3, 10, Duration::from_secs(600));
        for _ in 0..3 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert!(!limiter.allow("10.0.0.1"));
        // Another IP has its own window.
        assert!(limiter.allow("10.0.0.2"));
    }

    #[test]
    fn auth_failures_block_the_ip() {
        let limiter = RateLimiter::new(100, 3, Duration::from_secs(600));
        assert!(!limiter.add_auth_failure("10.0.0.9"));
        assert!(!limiter.add_auth_failure("10.0.0.9"));
        assert!(limiter.add_auth_failure("10.0.0.9"));
        assert!(limiter.is_blocked("10.0.0.9"));
        assert!(!limiter.allow("10.0.0.9"));
        // Other IPs are unaffected.
        assert!(limiter.allow("10.0.0.10"));
    }

    #[test]
    fn successful_auth_clears_failures() {
        let limiter = RateLimiter::new(100, 3, Duration::from_secs(600));
        limiter.add_auth_failure("10.0.1.1");
        limiter.add_auth_failure("10.0.1.1");
        limiter.clear_auth_failures("10.0.1.1");
        // Counter restarts; two more failures do not block yet.
        assert!(!limiter.add_auth_failure("10.0.1.1"));
        assert!(!limiter.is_blocked("10.0.1.1"));
    }

    #[test]
    fn block_expires() {
        let limiter = RateLimiter::new(100, 1, Duration::from_millis(30));
        assert!(limiter.add_auth_failure("10.0.2.2"));
        assert!(limiter.is_blocked("10.0.2.2"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!limiter.is_blocked("10.0.2.2"));
        assert!(limiter.allow("10.0.2.2"));
    }

    #[test]
    fn map_is_bounded_with_non_blocked_evicted_first() {
        let limiter = RateLimiter::with_bounds(
            100,
            1,
            Duration::from_secs(600),
            4,
            Some(Duration::from_secs(3600)),
            1,
        );
        // One blocked entry plus a crowd of normal ones.
        limiter.add_auth_failure("blocked-ip");
        for i in 0..10 {
            limiter.allow(&format!("10.1.0.{i}"));
        }
        assert!(limiter.entry_count() <= 5, "{}", limiter.entry_count());
        // The blocked entry survives eviction.
        assert!(limiter.is_blocked("blocked-ip"));
    }
}
