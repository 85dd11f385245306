//! Per-client fixed-window limits for screen captures and pane input.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Buckets beyond this count trigger a sweep of expired windows.
const SWEEP_THRESHOLD: usize = 1024;

struct Bucket {
    count: u32,
    expires_at: Instant,
}

/// Fixed-window limiter: at most `max` hits per key per `window`.
///
/// A bucket is created on the first hit and overwritten once its window has
/// passed, so a key never waits longer than one window.
pub struct FixedWindowLimiter {
    window: Duration,
    max: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit for `key`; returns false when the key is over its limit.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if buckets.len() >= SWEEP_THRESHOLD {
            buckets.retain(|_, b| b.expires_at > now);
        }

        match buckets.get_mut(key) {
            Some(bucket) if bucket.expires_at > now => {
                if bucket.count >= self.max {
                    return false;
                }
                bucket.count += 1;
                true
            }
            _ => {
                buckets.insert(
                    key.to_string(),
                    Bucket {
                        count: 1,
                        expires_at: now + self.window,
                    },
                );
                self.max > 0
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .map(|b| b.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rejects_over_limit_within_window() {
        let rl = FixedWindowLimiter::new(Duration::from_secs(1), 3);
        assert!(rl.check("a"));
        assert!(rl.check("a"));
        assert!(rl.check("a"));
        assert!(!rl.check("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_resets_bucket() {
        let rl = FixedWindowLimiter::new(Duration::from_millis(500), 1);
        assert!(rl.check("a"));
        assert!(!rl.check("a"));

        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(rl.check("a"));
        assert!(!rl.check("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let rl = FixedWindowLimiter::new(Duration::from_secs(10), 1);
        assert!(rl.check("10.0.0.1:screen"));
        assert!(!rl.check("10.0.0.1:screen"));
        assert!(rl.check("10.0.0.2:screen"));
        assert_eq!(rl.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_buckets_are_swept() {
        let rl = FixedWindowLimiter::new(Duration::from_millis(10), 5);
        for i in 0..SWEEP_THRESHOLD {
            rl.check(&format!("k{i}"));
        }
        tokio::time::advance(Duration::from_millis(20)).await;
        rl.check("fresh");
        assert_eq!(rl.len(), 1);
    }
}
