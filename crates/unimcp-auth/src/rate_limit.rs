//! Sliding-window rate limiting for the auth endpoints.
//!
//! Keyed by caller IP (or any caller-chosen key). Each key keeps the
//! timestamps of its requests inside the window; a request over the limit
//! is rejected with the time until the oldest one ages out.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::AuthError;

/// Sliding-window limiter.
pub struct SlidingWindowLimiter {
    window: Duration,
    max: u32,
    hits: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            hits: DashMap::new(),
        }
    }

    /// Record one request for `key`; `Err(RateLimited)` when over budget.
    pub fn check(&self, key: &str) -> Result<(), AuthError> {
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= self.max as usize {
            let oldest = *entry.front().expect("non-empty over-budget window");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(AuthError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }
        entry.push_back(now);
        Ok(())
    }

    /// Drop keys whose whole window has aged out.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.duration_since(*last) <= window)
        });
    }
}
