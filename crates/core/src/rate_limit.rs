use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Options for [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Calls allowed per key inside one window.
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of one [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Slots left in the current window after this call.
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Time until the window expires. Zero when a fresh window was just opened
    /// and the call was allowed.
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started_at: Instant,
}

/// Fixed-window call counter keyed by `agentId:endpointId`.
///
/// A window opens on the first call for a key. Expired windows are reset lazily
/// on the next call and swept by [`RateLimiter::cleanup`], which the owner is
/// expected to run on a timer.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// A zero `max_requests` or zero window falls back to 1.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            max_requests: config.max_requests.max(1),
            window: if config.window.is_zero() {
                Duration::from_secs(1)
            } else {
                config.window
            },
        };
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    #[must_use]
    pub fn key(agent_id: &str, endpoint_id: &str) -> String {
        format!("{}:{}", agent_id, endpoint_id)
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Count one call against `key`. A denied call leaves the counter untouched.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let max = self.config.max_requests;

        // The entry guard holds the shard lock, so the read-check-write is atomic.
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started_at: now,
        });

        if now.duration_since(window.started_at) >= self.config.window {
            window.count = 0;
            window.started_at = now;
        }

        let expires_at = window.started_at + self.config.window;
        let retry_after = expires_at.saturating_duration_since(now);
        let reset_at = Utc::now() + chrono::Duration::from_std(retry_after).unwrap_or_default();

        if window.count >= max {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                retry_after,
            };
        }

        window.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: max - window.count,
            reset_at,
            retry_after,
        }
    }

    /// Drop every window whose expiry has passed. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started_at) < window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys (useful for metrics)
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
