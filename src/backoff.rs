//! Computes the next retry delay from attempt index, error kind, and jitter (§4.B).

use std::time::Duration;

use rand::Rng;

use crate::error::ErrorKind;

/// `delay = 1000 * multiplier^(n-1) ms, * kind multiplier, * jitter in [0.85, 1.15],
/// clamped to [0, maxBackoff]`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_multiplier: 2.0, max_backoff: Duration::from_secs(60) }
    }
}

impl BackoffPolicy {
    pub fn new(base_multiplier: f64, max_backoff: Duration) -> Self {
        Self { base_multiplier, max_backoff }
    }

    pub fn compute(&self, attempt: u32, kind: ErrorKind) -> Duration {
        self.compute_with_rng(attempt, kind, &mut rand::rng())
    }

    pub fn compute_with_rng(&self, attempt: u32, kind: ErrorKind, rng: &mut impl Rng) -> Duration {
        let n = attempt.max(1) as i32;
        let base_ms = 1000.0 * self.base_multiplier.powi(n - 1);
        let kind_multiplier = match kind {
            ErrorKind::RateLimit => 2.0,
            ErrorKind::Timeout => 0.5,
            ErrorKind::Connection => 0.7,
            _ => 1.0,
        };
        let jitter = rng.random_range(0.85..=1.15);
        let delay_ms = (base_ms * kind_multiplier * jitter).max(0.0);
        let max_ms = self.max_backoff.as_millis() as f64;
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }
}
