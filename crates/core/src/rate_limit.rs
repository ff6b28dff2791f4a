//! Sliding-window rate limiter for outbound remote API calls.
//!
//! Each limiter instance owns the timestamps of its recent calls. Callers
//! that share a remote quota share one instance (behind an `Arc`); callers
//! with independent quotas get independent instances.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Extra wait added after the oldest call leaves the window.
pub const SAFETY_MARGIN: Duration = Duration::from_millis(50);

/// Quota for the job submission endpoint: 9 calls per minute.
pub const SUBMIT_MAX_REQUESTS: usize = 9;
pub const SUBMIT_WINDOW: Duration = Duration::from_secs(60);

/// Quota for status polling: 2 calls per second.
pub const STATUS_MAX_REQUESTS: usize = 2;
pub const STATUS_WINDOW: Duration = Duration::from_secs(1);

/// Caps calls at `max_requests` per rolling `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            recent: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn for_submissions() -> Self {
        Self::new(SUBMIT_MAX_REQUESTS, SUBMIT_WINDOW)
    }

    pub fn for_status_checks() -> Self {
        Self::new(STATUS_MAX_REQUESTS, STATUS_WINDOW)
    }

    /// Suspend until one more call fits in the window, then record it.
    ///
    /// Never fails; under contention it only delays.
    pub async fn wait_for_slot(&self) {
        loop {
            let delay = {
                let mut recent = self.recent.lock().await;
                let now = Instant::now();
                while recent
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    recent.pop_front();
                }

                if recent.len() < self.max_requests {
                    recent.push_back(now);
                    return;
                }

                // At capacity: wait for the oldest entry to leave the window.
                let oldest = recent[0];
                (oldest + self.window).saturating_duration_since(now) + SAFETY_MARGIN
            };

            tracing::trace!(delay_ms = delay.as_millis() as u64, "Rate limiter waiting");
            tokio::time::sleep(delay).await;
        }
    }

    /// Number of calls currently counted against the window.
    pub async fn in_window(&self) -> usize {
        let recent = self.recent.lock().await;
        let now = Instant::now();
        recent
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}
