//! Per-key dispatch pacing.
//!
//! Remembers when each `rate_key` last dispatched and makes the next caller
//! wait until `gap` has elapsed. Keys are independent.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Entries idle for longer than this are evicted.
pub const RATE_ENTRY_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Default)]
pub struct KeyedRateLimiter {
    last_hit: Mutex<HashMap<String, Instant>>,
}

impl KeyedRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` may dispatch again, then record the hit.
    ///
    /// Empty keys and zero gaps pass immediately. Returns `false` when
    /// cancelled while waiting; the hit is not recorded in that case.
    pub async fn wait(&self, key: &str, gap: Duration, cancel: &CancellationToken) -> bool {
        if key.is_empty() || gap.is_zero() {
            return true;
        }

        loop {
            let wait = {
                let mut last_hit = self.last_hit.lock();
                let now = Instant::now();
                let remaining = last_hit
                    .get(key)
                    .map(|last| gap.saturating_sub(now.saturating_duration_since(*last)))
                    .unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    last_hit.insert(key.to_string(), now);
                    return true;
                }
                remaining
            };

            trace!(rate_key = key, wait_ms = wait.as_millis() as u64, "Rate limited");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Drop entries whose last hit is older than `max_age`.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut last_hit = self.last_hit.lock();
        let before = last_hit.len();
        last_hit.retain(|_, last| now.saturating_duration_since(*last) <= max_age);
        before - last_hit.len()
    }

    pub fn len(&self) -> usize {
        self.last_hit.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_paced() {
        let limiter = KeyedRateLimiter::new();
        let cancel = CancellationToken::new();
        let gap = Duration::from_millis(1000);

        let start = Instant::now();
        assert!(limiter.wait("wh:42", gap, &cancel).await);
        assert!(limiter.wait("wh:42", gap, &cancel).await);
        assert!(start.elapsed() >= gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = KeyedRateLimiter::new();
        let cancel = CancellationToken::new();
        let gap = Duration::from_secs(5);

        let start = Instant::now();
        assert!(limiter.wait("a", gap, &cancel).await);
        assert!(limiter.wait("b", gap, &cancel).await);
        assert!(limiter.wait("", gap, &cancel).await);
        assert!(limiter.wait("a", Duration::ZERO, &cancel).await);
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let limiter = KeyedRateLimiter::new();
        let cancel = CancellationToken::new();
        let gap = Duration::from_secs(60);

        assert!(limiter.wait("k", gap, &cancel).await);
        cancel.cancel();
        assert!(!limiter.wait("k", gap, &cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction() {
        let limiter = KeyedRateLimiter::new();
        let cancel = CancellationToken::new();
        assert!(limiter.wait("old", Duration::from_millis(1), &cancel).await);

        tokio::time::advance(RATE_ENTRY_TTL + Duration::from_secs(1)).await;
        assert!(limiter.wait("fresh", Duration::from_millis(1), &cancel).await);

        assert_eq!(limiter.evict_older_than(RATE_ENTRY_TTL), 1);
        assert_eq!(limiter.len(), 1);
    }
}
