use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Admission policy for one provider.
#[derive(Debug, Clone)]
pub struct RateLimit {
    /// Calls allowed in flight at once.
    pub max_concurrent: usize,
    /// Time the slot stays closed after a call finishes.
    pub cooldown: Duration,
    /// Minimum spacing between call starts, derived from a requests-per-minute quota.
    pub min_interval: Option<Duration>,
}

impl RateLimit {
    /// One call at a time with a fixed pause after each one.
    pub fn serial(cooldown: Duration) -> Self {
        Self {
            max_concurrent: 1,
            cooldown,
            min_interval: None,
        }
    }

    /// Spacing derived from a requests-per-minute quota.
    pub fn per_minute(requests_per_minute: u32, max_concurrent: usize) -> Self {
        let rpm = requests_per_minute.max(1) as u64;
        Self {
            max_concurrent,
            cooldown: Duration::ZERO,
            min_interval: Some(Duration::from_millis(60_000 / rpm)),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            max_concurrent: Semaphore::MAX_PERMITS,
            cooldown: Duration::ZERO,
            min_interval: None,
        }
    }
}

/// Process-wide admission gate for a single provider.
///
/// All callers of a provider share one limiter. A task suspends in
/// [`RateLimiter::admit`] until a concurrency slot is free and the
/// requests-per-minute spacing allows a new start.
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    cooldown: Duration,
    min_interval: Option<Duration>,
    next_start: Mutex<Option<Instant>>,
}

/// Held for the duration of one provider call.
///
/// Dropping it releases the slot, after the cooldown if one is configured.
pub struct Admission {
    permit: Option<OwnedSemaphorePermit>,
    cooldown: Duration,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max_concurrent.max(1))),
            cooldown: limit.cooldown,
            min_interval: limit.min_interval,
            next_start: Mutex::new(None),
        }
    }

    pub async fn admit(&self) -> Admission {
        // The semaphore is never closed, so a failed acquire only means no slot to hold.
        let permit = self.permits.clone().acquire_owned().await.ok();

        if let Some(interval) = self.min_interval {
            let mut next_start = self.next_start.lock().await;
            if let Some(at) = *next_start {
                tokio::time::sleep_until(at).await;
            }
            *next_start = Some(Instant::now() + interval);
        }

        Admission {
            permit,
            cooldown: self.cooldown,
        }
    }

    /// Slots currently free (ignores pending cooldowns).
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if self.cooldown.is_zero() {
            return;
        }
        let cooldown = self.cooldown;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    drop(permit);
                });
            }
            Err(_) => drop(permit),
        }
    }
}
