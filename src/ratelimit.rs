// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sliding-window rate limiter, millisecond precision, one window per key (§4.2).
//! All state is in-memory; a restart clears it intentionally.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;

/// A single sliding window: a bound and a duration.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub limit: u32,
    pub duration: Duration,
}

impl Window {
    pub const fn new(limit: u32, duration: Duration) -> Self {
        Self { limit, duration }
    }
}

/// Fixed windows from §4.2. `message`/`typing` bounds are configured, not fixed.
pub const PAIR: Window = Window::new(5, Duration::from_secs(60));
pub const AUTH: Window = Window::new(5, Duration::from_secs(60));
pub const OVERSIZE: Window = Window::new(3, Duration::from_secs(60));

struct Bucket {
    timestamps: Vec<u64>,
}

/// Per-key sliding-window counters.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { buckets: Mutex::new(HashMap::new()) }
    }

    /// Attempt against `key` under `window` at time `now_ms`. Discards
    /// timestamps older than the window, rejects at capacity, else records
    /// and accepts.
    pub async fn attempt(&self, key: &str, window: Window, now_ms: u64) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.to_owned()).or_insert_with(|| Bucket { timestamps: Vec::new() });
        let window_ms = window.duration.as_millis() as u64;
        let cutoff = now_ms.saturating_sub(window_ms);
        bucket.timestamps.retain(|&t| t > cutoff);
        if bucket.timestamps.len() as u32 >= window.limit {
            return false;
        }
        bucket.timestamps.push(now_ms);
        true
    }

    /// Drop a key's bucket entirely, e.g. after a session closes.
    pub async fn clear(&self, key: &str) {
        self.buckets.lock().await.remove(key);
    }
}
