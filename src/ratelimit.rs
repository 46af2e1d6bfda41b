use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_actions: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_actions: 10,
            window: Duration::from_secs(10),
        }
    }
}

/// Sliding counter of recent actions. Each accepted action occupies one slot
/// for `window` and then frees it on its own, so budget comes back one action
/// at a time rather than all at once.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    active: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            active: VecDeque::with_capacity(config.max_actions),
        }
    }

    /// Counts the action and returns true, or returns false without counting it.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.expire(now);
        if self.active.len() >= self.config.max_actions {
            return false;
        }
        self.active.push_back(now);
        true
    }

    pub fn active(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.active.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.active.front() {
            if now.saturating_duration_since(oldest) < self.config.window {
                break;
            }
            self.active.pop_front();
        }
    }
}
