//! Sliding-Window Rate Limiter
//!
//! Admission control shared across workers hitting the same vendor: at most
//! N admissions inside any window of W seconds. `acquire` suspends until a
//! slot opens; the admission sequence is only mutated under the lock, so two
//! concurrent callers can never both pass the capacity check in the same
//! window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        assert!(max_requests > 0, "rate limit must admit at least one request");
        Self {
            max_requests,
            window,
            admissions: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    /// Per-minute convenience constructor used by vendor registrations.
    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Wait until one request is admissible, then record the admission.
    ///
    /// Cancellation-safe: dropping the future before it resolves records
    /// nothing.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut admissions = self.admissions.lock().await;
                let now = Instant::now();
                if let Some(cutoff) = now.checked_sub(self.window) {
                    while admissions.front().map_or(false, |&t| t <= cutoff) {
                        admissions.pop_front();
                    }
                }
                if admissions.len() < self.max_requests {
                    admissions.push_back(now);
                    trace!(in_window = admissions.len(), "rate limit admit");
                    return;
                }
                // Sleep with the lock released, then re-check: another task
                // may take the freed slot first.
                let oldest = *admissions.front().expect("non-empty at capacity");
                (oldest + self.window).saturating_duration_since(now)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limit saturated, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Admissions currently inside the window (test/diagnostic hook).
    pub async fn in_flight(&self) -> usize {
        let mut admissions = self.admissions.lock().await;
        if let Some(cutoff) = Instant::now().checked_sub(self.window) {
            while admissions.front().map_or(false, |&t| t <= cutoff) {
                admissions.pop_front();
            }
        }
        admissions.len()
    }
}
