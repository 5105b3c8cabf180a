//! Per-provider counters, rolling response-time average, and bounded failure
//! history (§4.E).
//!
//! Counters are plain `AtomicU64`s rather than a mutex-guarded struct: the
//! spec requires "all updates serialized per provider" but cross-field
//! consistency isn't load-bearing (derived rates are computed on demand from
//! a snapshot, exactly as `CircuitMetrics` in
//! `tower_resilience_circuitbreaker::circuit` derives `failure_rate` from
//! counters read at snapshot time). The failure-history ring reuses the
//! circuit breaker's dual count/age trim shape.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::{ErrorKind, Severity};

const FAILURE_HISTORY_MAX_ENTRIES: usize = 100;
const FAILURE_HISTORY_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub at: Instant,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub attempt: u32,
    pub response_time: Duration,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limit_hits: u64,
    pub breaker_trips: u64,
    pub avg_response_time: Duration,
    pub last_request_at: Option<Instant>,
    pub success_rate: f64,
}

pub struct MetricsStore {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rate_limit_hits: AtomicU64,
    breaker_trips: AtomicU64,
    avg_response_time_ms: AtomicU64,
    last_request_at: RwLock<Option<Instant>>,
    failure_history: RwLock<VecDeque<FailureEvent>>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            avg_response_time_ms: AtomicU64::new(0),
            last_request_at: RwLock::new(None),
            failure_history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn record_success(&self, response_time: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.update_rolling_average(response_time);
        *self.last_request_at.write().unwrap() = Some(Instant::now());
    }

    pub fn record_failure(&self, kind: ErrorKind, severity: Severity, attempt: u32, response_time: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        if kind == ErrorKind::RateLimit {
            self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.update_rolling_average(response_time);
        *self.last_request_at.write().unwrap() = Some(Instant::now());
        self.push_failure(FailureEvent { at: Instant::now(), kind, severity, attempt, response_time });
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Exponential moving average (alpha = 0.2), matching the smoothing the
    /// teacher applies to its own rolling latency gauges.
    fn update_rolling_average(&self, sample: Duration) {
        let sample_ms = sample.as_millis() as u64;
        let prev = self.avg_response_time_ms.load(Ordering::Relaxed);
        let updated = if prev == 0 { sample_ms } else { ((prev as f64 * 0.8) + (sample_ms as f64 * 0.2)) as u64 };
        self.avg_response_time_ms.store(updated, Ordering::Relaxed);
    }

    fn push_failure(&self, event: FailureEvent) {
        let mut history = self.failure_history.write().unwrap();
        history.push_back(event);
        let now = Instant::now();
        while history.len() > FAILURE_HISTORY_MAX_ENTRIES {
            history.pop_front();
        }
        while let Some(front) = history.front() {
            if now.duration_since(front.at) > FAILURE_HISTORY_RETENTION {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count of failures recorded within the last `window` (used by the
    /// engine's recent-failure-count retry-budget halving, §4.I step 2).
    pub fn recent_failures(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.failure_history.read().unwrap().iter().filter(|e| now.duration_since(e.at) <= window).count()
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.failure_history.read().unwrap().back().map(|e| e.at)
    }

    pub fn avg_response_time(&self) -> Duration {
        Duration::from_millis(self.avg_response_time_ms.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests,
            successes,
            failures,
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            avg_response_time: self.avg_response_time(),
            last_request_at: *self.last_request_at.read().unwrap(),
            success_rate: if requests > 0 { successes as f64 / requests as f64 } else { 0.0 },
        }
    }
}
