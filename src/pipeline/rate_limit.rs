//! Per-user send rate limiter
//!
//! Enforces a minimum spacing between consecutive sends per user.
//! `wait` reserves the next slot and sleeps until it opens; concurrent
//! callers for the same user are serialized in reservation order.
//! A caller cancelled mid-wait releases its slot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Per-user minimum-spacing limiter
pub struct RateLimiter {
    spacing: Duration,
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Block until the user's next send slot opens
    pub async fn wait(&self, user: &str) {
        if self.spacing.is_zero() {
            return;
        }

        let target = {
            let mut map = self.next_allowed.lock().expect("limiter lock poisoned");
            let now = Instant::now();
            match map.get(user).copied() {
                Some(next) if next > now => {
                    // Reserve the slot after the current queue tail
                    map.insert(user.to_string(), next + self.spacing);
                    Some(next)
                }
                _ => {
                    map.insert(user.to_string(), now + self.spacing);
                    None
                }
            }
        };

        if let Some(target) = target {
            let mut guard = SlotGuard {
                limiter: self,
                user: user.to_string(),
                armed: true,
            };
            tokio::time::sleep_until(target).await;
            guard.armed = false;
        }
    }
}

/// Rolls the reserved slot back if the waiting caller is cancelled
struct SlotGuard<'a> {
    limiter: &'a RateLimiter,
    user: String,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut map = self
            .limiter
            .next_allowed
            .lock()
            .expect("limiter lock poisoned");
        if let Some(next) = map.get(&self.user).copied() {
            if let Some(rolled_back) = next.checked_sub(self.limiter.spacing) {
                map.insert(self.user.clone(), rolled_back);
            }
        }
    }
}
