//! Property tests for the circuit breaker (§4.C, §8 P2-P4).
//!
//! Invariants tested:
//! - Never admits more than `half_open_max_requests` while half-open
//! - `reset` always yields a clean closed breaker
//! - Opens only via consecutive-failure threshold or sliding-window rate

use std::time::Duration;

use proptest::prelude::*;
use provider_gateway::{CircuitBreaker, CircuitBreakerConfigBuilder, CircuitState};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// P3: half-open never admits more than the configured cap.
    #[test]
    fn half_open_admission_is_capped(
        cap in 1u32..=8,
        probes in 1usize..=40,
    ) {
        let config = CircuitBreakerConfigBuilder::new()
            .consecutive_failure_threshold(1)
            .open_timeout(Duration::from_millis(0))
            .half_open_max_requests(cap)
            .build();
        let mut breaker = CircuitBreaker::new("p", config);

        // One failure opens it (threshold is 1); the zero-length timeout
        // means the very next admit() call transitions Open -> HalfOpen.
        breaker.on_failure();
        prop_assert_eq!(breaker.state(), CircuitState::Open);

        let mut admitted = 0u32;
        for _ in 0..probes {
            if breaker.admit() {
                admitted += 1;
            }
        }
        prop_assert!(admitted <= cap, "admitted {admitted} probes, cap was {cap}");
    }

    /// P4: after reset, the breaker is closed with zeroed counters.
    #[test]
    fn reset_always_yields_clean_closed_breaker(
        failures in 0usize..=20,
        successes in 0usize..=20,
    ) {
        let config = CircuitBreakerConfigBuilder::new()
            .consecutive_failure_threshold(3)
            .failure_rate_threshold(0.5)
            .min_requests_for_rate(5)
            .build();
        let mut breaker = CircuitBreaker::new("p", config);

        for _ in 0..failures {
            breaker.on_failure();
        }
        for _ in 0..successes {
            breaker.on_success();
        }

        breaker.reset();
        prop_assert_eq!(breaker.state(), CircuitState::Closed);
        let snap = breaker.snapshot();
        prop_assert_eq!(snap.consecutive_failures, 0);
        prop_assert_eq!(snap.total_requests, 0);
    }

    /// P2: breaker opens only once the consecutive-failure streak reaches
    /// threshold (rate-based opening is exercised with a disabled rate gate
    /// here by keeping `min_requests_for_rate` above the failure count).
    #[test]
    fn opens_exactly_at_consecutive_failure_threshold(
        threshold in 2u32..=10,
    ) {
        let config = CircuitBreakerConfigBuilder::new()
            .consecutive_failure_threshold(threshold)
            .min_requests_for_rate(1_000_000)
            .build();
        let mut breaker = CircuitBreaker::new("p", config);

        for i in 1..threshold {
            breaker.on_failure();
            prop_assert_eq!(breaker.state(), CircuitState::Closed, "opened early after {i} failures");
        }
        breaker.on_failure();
        prop_assert_eq!(breaker.state(), CircuitState::Open);
    }
}
