//! Sliding-window start limiter for the worker.
//!
//! Allows at most `max` starts inside any window of length `window`. A start is
//! only recorded once a job has actually been claimed, so idle polls never use
//! up capacity.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max: 10,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            starts: VecDeque::with_capacity(limit.max as usize),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.starts.front() {
            if now.duration_since(oldest) >= self.limit.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until another start is allowed; zero when one is allowed now.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.evict(now);
        if (self.starts.len() as u32) < self.limit.max {
            return Duration::ZERO;
        }
        match self.starts.front() {
            Some(&oldest) => (oldest + self.limit.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Sleep until a start is allowed.
    pub async fn ready(&mut self) {
        loop {
            let wait = self.wait_time(Instant::now());
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    pub fn record_start(&mut self) {
        self.starts.push_back(Instant::now());
    }
}
