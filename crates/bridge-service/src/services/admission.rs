//! Webhook admission control.
//!
//! A token bucket shared by every inbound webhook request. Tokens refill
//! lazily on each acquisition attempt, so there is no background task.
//! Rejected requests are counted for the status endpoint.

use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;

use crate::observability::metrics;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    limited_requests: u64,
}

/// Token-bucket rate limiter with capacity `C` and refill rate `R`/sec.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate: f64,
    bucket: Mutex<Bucket>,
}

/// Snapshot of the limiter for observability.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdmissionStatus {
    pub tokens: u64,
    pub capacity: u64,
    pub rate: u64,
    pub limited_requests: u64,
    /// Percentage of the bucket currently drained.
    pub utilization: f64,
}

impl RateLimiter {
    /// Create a limiter that starts with a full bucket.
    pub fn new(rate: u32, capacity: u32) -> Self {
        Self::starting_at(rate, capacity, Instant::now())
    }

    fn starting_at(rate: u32, capacity: u32, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            rate: f64::from(rate),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: now,
                limited_requests: 0,
            }),
        }
    }

    /// Try to take `n` tokens. Never blocks on time.
    pub fn try_acquire(&self, n: u32) -> bool {
        self.try_acquire_at(n, Instant::now())
    }

    fn try_acquire_at(&self, n: u32, now: Instant) -> bool {
        // Refill and debit happen under one lock acquisition
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        let wanted = f64::from(n);
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            metrics::record_admission(true);
            true
        } else {
            bucket.limited_requests += 1;
            metrics::record_admission(false);
            false
        }
    }

    /// Current limiter state. Tokens are refilled before reporting.
    pub fn status(&self) -> AdmissionStatus {
        self.status_at(Instant::now())
    }

    fn status_at(&self, now: Instant) -> AdmissionStatus {
        let bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        let utilization = if self.capacity > 0.0 {
            ((self.capacity - tokens) / self.capacity * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        AdmissionStatus {
            tokens: tokens.floor() as u64,
            capacity: self.capacity as u64,
            rate: self.rate as u64,
            limited_requests: bucket.limited_requests,
            utilization,
        }
    }
}
