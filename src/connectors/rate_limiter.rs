//! Per-exchange fixed-window request limiter.
//!
//! Callers wait for the window to reset instead of failing; the wait is a
//! bounded loop around a short critical section, never held across `.await`.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Request budget for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        // Binance request weight budget
        Self::new(1200, Duration::from_secs(60))
    }
}

#[derive(Debug)]
struct WindowState {
    limit: RateLimit,
    started_at: Instant,
    count: u32,
}

impl WindowState {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            started_at: Instant::now(),
            count: 0,
        }
    }

    /// Take a slot, or report how long until the window resets.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.duration_since(self.started_at);
        if elapsed >= self.limit.window {
            self.started_at = now;
            self.count = 0;
        }
        if self.count < self.limit.max_requests {
            self.count += 1;
            Ok(())
        } else {
            Err(self.limit.window.saturating_sub(elapsed))
        }
    }
}

/// Shared limiter keyed by exchange name.
pub struct RateLimiter {
    default_limit: RateLimit,
    overrides: DashMap<String, RateLimit>,
    windows: DashMap<String, WindowState>,
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            default_limit,
            overrides: DashMap::new(),
            windows: DashMap::new(),
        }
    }

    /// Use a specific budget for one exchange.
    pub fn with_limit(self, exchange: &str, limit: RateLimit) -> Self {
        self.overrides.insert(exchange.to_lowercase(), limit);
        self
    }

    fn limit_for(&self, exchange: &str) -> RateLimit {
        self.overrides
            .get(exchange)
            .map(|l| *l)
            .unwrap_or(self.default_limit)
    }

    /// Wait until a request slot for `exchange` is available.
    pub async fn acquire(&self, exchange: &str) {
        let key = exchange.to_lowercase();
        loop {
            let wait = {
                let limit = self.limit_for(&key);
                let mut state = self
                    .windows
                    .entry(key.clone())
                    .or_insert_with(|| WindowState::new(limit));
                match state.try_acquire(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            debug!("Rate limit reached for {}, waiting {:?}", key, wait);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Requests used in the current window.
    pub fn used(&self, exchange: &str) -> u32 {
        self.windows
            .get(&exchange.to_lowercase())
            .map(|s| s.count)
            .unwrap_or(0)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimit::default())
    }
}
