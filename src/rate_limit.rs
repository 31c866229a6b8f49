use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Keyed sliding-window rate limiter. Each key keeps the timestamps of its
/// recent hits; hits older than the window are discarded on every check.
pub struct RateLimiter {
    limits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            limits: Mutex::new(HashMap::new()),
        }
    }

    /// Check if a request is allowed. Returns true if allowed, false if rate
    /// limited. `key` names the action being limited, `max` is the max hits
    /// inside a `window_secs`-second sliding window.
    pub fn check(&self, key: &str, max: usize, window_secs: f64) -> bool {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let window = std::time::Duration::from_secs_f64(window_secs);

        let entries = limits.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            return false;
        }
        entries.push(now);
        true
    }
}
