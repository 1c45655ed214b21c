//! Per-key fixed-window rate limiter.
//!
//! Each key's bucket is a `{count, window_start}` pair guarded by a single
//! `Mutex`-protected map, the same shared-state idiom this codebase already
//! uses for its room/user tables. A key's bucket is only ever touched while
//! holding the lock, so concurrent `check` calls on the same key cannot lose
//! counts.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    window_start_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks and (if allowed) consumes one unit of `scope_key`'s budget.
    pub async fn check(
        &self,
        scope_key: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> CheckResult {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(scope_key.to_string()).or_insert(Bucket {
            count: 0,
            window_start_ms: now_ms,
        });

        if now_ms - bucket.window_start_ms >= window_ms {
            bucket.count = 0;
            bucket.window_start_ms = now_ms;
        }

        let reset_at_ms = bucket.window_start_ms + window_ms;

        if bucket.count < max {
            bucket.count += 1;
            CheckResult {
                allowed: true,
                remaining: max - bucket.count,
                reset_at_ms,
            }
        } else {
            CheckResult {
                allowed: false,
                remaining: 0,
                reset_at_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_max_then_denies() {
        let limiter = RateLimiter::new();
        let a = limiter.check("user:alice", 2, 60_000, 0).await;
        assert_eq!(a, CheckResult { allowed: true, remaining: 1, reset_at_ms: 60_000 });
        let b = limiter.check("user:alice", 2, 60_000, 0).await;
        assert_eq!(b, CheckResult { allowed: true, remaining: 0, reset_at_ms: 60_000 });
        let c = limiter.check("user:alice", 2, 60_000, 0).await;
        assert_eq!(c, CheckResult { allowed: false, remaining: 0, reset_at_ms: 60_000 });
    }

    #[tokio::test]
    async fn resets_after_window_elapses() {
        let limiter = RateLimiter::new();
        let _ = limiter.check("k", 1, 1_000, 0).await;
        let denied = limiter.check("k", 1, 1_000, 500).await;
        assert!(!denied.allowed);
        let allowed_again = limiter.check("k", 1, 1_000, 1_000).await;
        assert!(allowed_again.allowed);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let _ = limiter.check("alice", 1, 1_000, 0).await;
        let bob = limiter.check("bob", 1, 1_000, 0).await;
        assert!(bob.allowed);
    }

    #[tokio::test]
    async fn concurrent_checks_on_same_key_do_not_over_admit() {
        let limiter = RateLimiter::new();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("shared", 10, 60_000, 0).await
            }));
        }
        let mut allowed_count = 0;
        for h in handles {
            if h.await.unwrap().allowed {
                allowed_count += 1;
            }
        }
        assert_eq!(allowed_count, 10);
    }
}
