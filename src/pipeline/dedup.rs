//! Windowed duplicate suppression
//!
//! Counts identical sends per key inside a rolling window and rejects the
//! overflow with a retry hint. Rejections are surfaced to the caller,
//! never retried internally.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::{PosternError, Result};

/// Prune dead entries once the table grows past this
const PRUNE_THRESHOLD: usize = 1024;

/// Duplicate key: hash of (user, recipient, kind, payload digest)
pub fn duplicate_key(user: &str, recipient: &str, kind: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update([0]);
    hasher.update(recipient.as_bytes());
    hasher.update([0]);
    hasher.update(kind.as_bytes());
    hasher.update([0]);
    hasher.update(payload);
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{:02x}", b);
        acc
    })
}

struct WindowEntry {
    window_start: Instant,
    count: u32,
}

/// Blocks repeated sends per key inside a fixed window
pub struct DuplicateLimiter {
    window: Duration,
    max: u32,
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl DuplicateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count a send attempt against the key's window.
    /// Rejects with the remaining window as the retry hint.
    pub fn check(&self, key: &str) -> Result<()> {
        if self.max == 0 || self.window.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        let mut entries = self.entries.lock().expect("dedup lock poisoned");

        if entries.len() > PRUNE_THRESHOLD {
            let window = self.window;
            entries.retain(|_, e| now.duration_since(e.window_start) <= window);
        }

        let entry = entries.entry(key.to_string()).or_insert(WindowEntry {
            window_start: now,
            count: 0,
        });

        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= self.max {
            let elapsed = now.duration_since(entry.window_start);
            let retry_after = self.window.saturating_sub(elapsed);
            return Err(PosternError::Duplicate { retry_after });
        }

        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_max_inside_window() {
        let limiter = DuplicateLimiter::new(Duration::from_secs(60), 2);
        let key = duplicate_key("alice", "12025550100", "text", b"hi");

        limiter.check(&key).unwrap();
        limiter.check(&key).unwrap();
        let err = limiter.check(&key).unwrap_err();
        match err {
            PosternError::Duplicate { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let limiter = DuplicateLimiter::new(Duration::from_millis(30), 1);
        let key = duplicate_key("alice", "12025550100", "text", b"hi");

        limiter.check(&key).unwrap();
        assert!(limiter.check(&key).is_err());

        std::thread::sleep(Duration::from_millis(40));
        limiter.check(&key).unwrap();
    }

    #[test]
    fn test_distinct_payloads_have_distinct_keys() {
        let limiter = DuplicateLimiter::new(Duration::from_secs(60), 1);
        let a = duplicate_key("alice", "12025550100", "text", b"hi");
        let b = duplicate_key("alice", "12025550100", "text", b"hello");
        assert_ne!(a, b);

        limiter.check(&a).unwrap();
        limiter.check(&b).unwrap();
    }

    #[test]
    fn test_key_covers_all_dimensions() {
        let base = duplicate_key("alice", "12025550100", "text", b"hi");
        assert_ne!(base, duplicate_key("bob", "12025550100", "text", b"hi"));
        assert_ne!(base, duplicate_key("alice", "12025550101", "text", b"hi"));
        assert_ne!(base, duplicate_key("alice", "12025550100", "image", b"hi"));
    }

    #[test]
    fn test_zero_max_disables_suppression() {
        let limiter = DuplicateLimiter::new(Duration::from_secs(60), 0);
        let key = duplicate_key("alice", "12025550100", "text", b"hi");
        for _ in 0..10 {
            limiter.check(&key).unwrap();
        }
    }
}
