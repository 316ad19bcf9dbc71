use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Global request pacer shared by every worker talking to QuickBooks.
///
/// Keeps a cursor to the next free slot. Each `acquire` takes the slot under
/// the cursor, pushes the cursor one interval further (scaled by ±10% jitter
/// so concurrent workers do not fire in lock-step) and sleeps until its slot.
/// Callers are served in the order they reach the lock.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    next_slot: Arc<Mutex<Instant>>,
    interval: Duration,
}

const JITTER: f64 = 0.10;

impl RateLimiter {
    /// Non-positive or non-finite rates fall back to one request per second.
    pub fn new(max_requests_per_second: f64) -> Self {
        let rps = if max_requests_per_second.is_finite() && max_requests_per_second > 0.0 {
            max_requests_per_second
        } else {
            log::warn!("Invalid request rate {max_requests_per_second}, using 1 req/s");
            1.0
        };
        RateLimiter {
            next_slot: Arc::new(Mutex::new(Instant::now())),
            interval: Duration::from_secs_f64(1.0 / rps),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the caller may issue its next request.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            let factor = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
            *next = slot + self.interval.mul_f64(factor);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
