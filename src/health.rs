//! Per-provider health record, periodic probe loop, and opportunistic signal
//! consumption from real request outcomes (§4.D).
//!
//! The record shape (`status`, `last_probe`, `consecutive_failures`) and its
//! `RwLock`-guarded interior mutability are grounded on
//! `tower_resilience_healthcheck::context::HealthCheckedContext`. Unlike the
//! teacher's `HealthChecker<T>` (generic over one concrete resource type),
//! the gateway's registry is a heterogeneous `Vec<Box<dyn ProviderAdapter>>`,
//! so the probe is invoked through the same `async_trait` object the
//! execution engine already calls (`ProviderAdapter::test_connection`)
//! rather than a second generic trait.

use std::sync::RwLock;
use std::time::{Duration, Instant};

/// One provider's health record (§3). Invariant: `consecutive_failures == 0`
/// iff the last observed outcome was success.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub last_probe_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

struct HealthState {
    is_healthy: bool,
    last_probe_at: Option<Instant>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Owns the mutable health record for one provider. Reads never block writers
/// of a different provider's record — each provider gets its own `HealthTracker`.
pub struct HealthTracker {
    state: RwLock<HealthState>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HealthState {
                is_healthy: true,
                last_probe_at: None,
                consecutive_failures: 0,
                last_error: None,
            }),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let s = self.state.read().unwrap();
        HealthSnapshot {
            is_healthy: s.is_healthy,
            last_probe_at: s.last_probe_at,
            consecutive_failures: s.consecutive_failures,
            last_error: s.last_error.clone(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.read().unwrap().is_healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.read().unwrap().consecutive_failures
    }

    /// Applied after a liveness probe: resets the counter and marks healthy
    /// on success, increments and marks unhealthy on failure. Also used
    /// opportunistically by the execution engine on real request outcomes —
    /// the spec requires both signal sources update the same fields.
    pub fn record_probe_success(&self) {
        let mut s = self.state.write().unwrap();
        s.is_healthy = true;
        s.consecutive_failures = 0;
        s.last_error = None;
        s.last_probe_at = Some(Instant::now());
    }

    pub fn record_probe_failure(&self, error: impl Into<String>) {
        let mut s = self.state.write().unwrap();
        s.is_healthy = false;
        s.consecutive_failures += 1;
        s.last_error = Some(error.into());
        s.last_probe_at = Some(Instant::now());
    }

    /// Opportunistic update from a real request outcome: same field updates
    /// as a probe, but `last_probe_at` is left untouched since no probe ran.
    pub fn record_request_success(&self) {
        let mut s = self.state.write().unwrap();
        s.is_healthy = true;
        s.consecutive_failures = 0;
        s.last_error = None;
    }

    pub fn record_request_failure(&self, error: impl Into<String>) {
        let mut s = self.state.write().unwrap();
        s.is_healthy = false;
        s.consecutive_failures += 1;
        s.last_error = Some(error.into());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), probe_timeout: Duration::from_secs(5) }
    }
}
