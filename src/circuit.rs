//! Per-provider three-state circuit breaker with sliding-window failure rate (§4.C).
//!
//! Shaped after `tower_resilience_circuitbreaker::circuit::Circuit`: same
//! `CircuitState` enum, same atomic state for lock-free reads, same
//! dual count/age window trimming. Diverges where the spec diverges: the
//! open condition also fires on a pure consecutive-failure streak (the
//! teacher's breaker only evaluates the sliding-window rate), and the
//! half-open required-success count is a step function of the failure rate
//! at the moment the circuit opened, rather than a fixed configured value.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::events::{GatewayEvent, GatewayEventKind};

/// `CLOSED` permits, `OPEN` rejects, `HALF_OPEN` trial-admits (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub consecutive_failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub min_requests_for_rate: usize,
    pub window_size: usize,
    pub window_time: Duration,
    pub open_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_requests_for_rate: 10,
            window_size: 100,
            window_time: Duration::from_secs(300),
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn consecutive_failure_threshold(mut self, n: u32) -> Self {
        self.config.consecutive_failure_threshold = n;
        self
    }

    pub fn failure_rate_threshold(mut self, rate: f64) -> Self {
        self.config.failure_rate_threshold = rate;
        self
    }

    pub fn min_requests_for_rate(mut self, n: usize) -> Self {
        self.config.min_requests_for_rate = n;
        self
    }

    pub fn window(mut self, size: usize, time: Duration) -> Self {
        self.config.window_size = size;
        self.config.window_time = time;
        self
    }

    pub fn open_timeout(mut self, d: Duration) -> Self {
        self.config.open_timeout = d;
        self
    }

    pub fn half_open_max_requests(mut self, n: u32) -> Self {
        self.config.half_open_max_requests = n;
        self
    }

    pub fn build(self) -> CircuitBreakerConfig {
        self.config
    }
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: Instant,
    success: bool,
}

/// Point-in-time snapshot, safe to hold without the breaker's internal lock.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: usize,
    pub failures: usize,
    pub failure_rate: f64,
    pub half_open_admitted: u32,
    pub half_open_successes: u32,
    pub time_since_state_change: Duration,
}

/// The state machine described in §3/§4.C. All operations are O(1) amortized;
/// window maintenance is O(k) in the number of evicted entries.
pub struct CircuitBreaker {
    provider: Arc<str>,
    config: CircuitBreakerConfig,
    state: CircuitState,
    state_atomic: Arc<AtomicU8>,
    last_state_change: Instant,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
    failure_rate_at_open: f64,
    window: VecDeque<CallRecord>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            state: CircuitState::Closed,
            state_atomic: Arc::new(AtomicU8::new(CircuitState::Closed as u8)),
            last_state_change: Instant::now(),
            consecutive_failures: 0,
            opened_at: None,
            half_open_admitted: 0,
            half_open_successes: 0,
            failure_rate_at_open: 0.0,
            window: VecDeque::new(),
        }
    }

    /// Lock-free read of the current state, usable from outside the
    /// provider's own lock (e.g. a metrics scrape).
    pub fn state_atomic(&self) -> CircuitState {
        CircuitState::from_u8(self.state_atomic.load(Ordering::Acquire))
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn trim_window(&mut self) {
        let now = Instant::now();
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }
        while let Some(front) = self.window.front() {
            if now.duration_since(front.at) > self.config.window_time {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|r| !r.success).count();
        failures as f64 / self.window.len() as f64
    }

    /// `admit() -> bool`: permits execution per the state rules in §3.
    pub fn admit(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.opened_at.map(|at| at.elapsed() >= self.config.open_timeout).unwrap_or(false) {
                    self.transition(CircuitState::HalfOpen);
                    self.half_open_admitted = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_admitted < self.config.half_open_max_requests {
                    self.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn required_half_open_successes(&self) -> u32 {
        if self.failure_rate_at_open <= 0.5 {
            1
        } else if self.failure_rate_at_open <= 0.7 {
            2
        } else {
            3
        }
    }

    pub fn on_success(&mut self) -> Option<(CircuitState, CircuitState)> {
        self.window.push_back(CallRecord { at: Instant::now(), success: true });
        self.trim_window();
        self.consecutive_failures = 0;

        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.required_half_open_successes() {
                    return Some(self.transition(CircuitState::Closed));
                }
                None
            }
            CircuitState::Closed => None,
            CircuitState::Open => None,
        }
    }

    pub fn on_failure(&mut self) -> Option<(CircuitState, CircuitState)> {
        self.window.push_back(CallRecord { at: Instant::now(), success: false });
        self.trim_window();
        self.consecutive_failures += 1;

        match self.state {
            CircuitState::HalfOpen => Some(self.transition(CircuitState::Open)),
            CircuitState::Closed => {
                let rate = self.failure_rate();
                let total = self.window.len();
                let should_open = self.consecutive_failures >= self.config.consecutive_failure_threshold
                    || (total >= self.config.min_requests_for_rate && rate >= self.config.failure_rate_threshold);
                if should_open {
                    self.failure_rate_at_open = rate;
                    Some(self.transition(CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn transition(&mut self, to: CircuitState) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.state_atomic.store(to as u8, Ordering::Release);
        self.last_state_change = Instant::now();
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.half_open_admitted = 0;
                self.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_admitted = 0;
                self.half_open_successes = 0;
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.half_open_admitted = 0;
                self.half_open_successes = 0;
                self.window.clear();
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(provider = %self.provider, from = from.label(), to = to.label(), "circuit breaker transition");
        #[cfg(feature = "metrics")]
        {
            counter!("gateway_breaker_transitions_total", "provider" => self.provider.to_string(), "to" => to.label()).increment(1);
            gauge!("gateway_breaker_state", "provider" => self.provider.to_string()).set(to as u8 as f64);
        }

        (from, to)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_requests: self.window.len(),
            failures: self.window.iter().filter(|r| !r.success).count(),
            failure_rate: self.failure_rate(),
            half_open_admitted: self.half_open_admitted,
            half_open_successes: self.half_open_successes,
            time_since_state_change: self.last_state_change.elapsed(),
        }
    }

    /// `reset()`: forces `CLOSED`, clears counters and window (P4).
    pub fn reset(&mut self) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = CircuitState::Closed;
        self.state_atomic.store(CircuitState::Closed as u8, Ordering::Release);
        self.last_state_change = Instant::now();
        self.consecutive_failures = 0;
        self.half_open_admitted = 0;
        self.half_open_successes = 0;
        self.opened_at = None;
        self.window.clear();
        (from, CircuitState::Closed)
    }

    pub fn provider(&self) -> &Arc<str> {
        &self.provider
    }

    pub fn event_for(&self, from: CircuitState, to: CircuitState) -> GatewayEvent {
        GatewayEvent::new(GatewayEventKind::CircuitBreakerStateChanged {
            provider: Arc::clone(&self.provider),
            from,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        let config = CircuitBreakerConfigBuilder::new()
            .consecutive_failure_threshold(5)
            .min_requests_for_rate(10)
            .failure_rate_threshold(0.5)
            .open_timeout(Duration::from_millis(20))
            .half_open_max_requests(3)
            .build();
        CircuitBreaker::new("alpha", config)
    }

    #[test]
    fn opens_on_consecutive_failures() {
        let mut b = breaker();
        for _ in 0..4 {
            assert!(b.on_failure().is_none());
        }
        assert_eq!(b.on_failure(), Some((CircuitState::Closed, CircuitState::Open)));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn opens_on_rate_once_min_requests_met_even_below_consecutive_threshold() {
        let mut b = breaker();
        // Interleaved so consecutive_failures never reaches the threshold (5) on
        // its own; only the 10-request, 0.5-rate condition should trip the breaker.
        let mut opened = false;
        for _ in 0..5 {
            b.on_success();
            if b.on_failure().is_some() {
                opened = true;
            }
        }
        assert!(opened, "breaker should open on sliding-window rate alone");
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_admits_at_most_cap_concurrently() {
        let mut b = breaker();
        for _ in 0..5 {
            b.on_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.admit());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.admit());
        assert!(b.admit());
        assert!(!b.admit());
    }

    #[test]
    fn half_open_requires_more_successes_when_prior_failure_rate_was_high() {
        let mut b = breaker();
        // All five are failures -> failure_rate_at_open == 1.0 -> needs 3 successes.
        for _ in 0..5 {
            b.on_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.admit());
        assert!(b.on_success().is_none(), "one success should not yet close a circuit that opened at rate 1.0");
        assert!(b.admit());
        assert!(b.on_success().is_none());
        assert!(b.admit());
        let (from, to) = b.on_success().expect("third success should close");
        assert_eq!(from, CircuitState::HalfOpen);
        assert_eq!(to, CircuitState::Closed);
    }

    #[test]
    fn reset_clears_everything() {
        let mut b = breaker();
        for _ in 0..5 {
            b.on_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.total_requests, 0);
    }

    #[test]
    fn required_successes_step_function() {
        let mut b = breaker();
        b.failure_rate_at_open = 0.4;
        assert_eq!(b.required_half_open_successes(), 1);
        b.failure_rate_at_open = 0.6;
        assert_eq!(b.required_half_open_successes(), 2);
        b.failure_rate_at_open = 0.9;
        assert_eq!(b.required_half_open_successes(), 3);
    }
}
