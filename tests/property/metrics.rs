//! Property tests for the metrics store (§4.E, §8 P1).

use std::time::Duration;

use proptest::prelude::*;
use provider_gateway::error::{ErrorKind, Severity};
use provider_gateway::MetricsStore;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(60))]

    /// P1: `requests == successes + failures` after any sequence of outcomes.
    #[test]
    fn requests_equals_successes_plus_failures(
        outcomes in prop::collection::vec(any::<bool>(), 0..200),
    ) {
        let store = MetricsStore::new();
        for success in &outcomes {
            if *success {
                store.record_success(Duration::from_millis(1));
            } else {
                store.record_failure(ErrorKind::Unknown, Severity::Medium, 1, Duration::from_millis(1));
            }
        }
        let snap = store.snapshot();
        prop_assert_eq!(snap.requests, snap.successes + snap.failures);
        prop_assert_eq!(snap.requests as usize, outcomes.len());
        let expected_successes = outcomes.iter().filter(|s| **s).count() as u64;
        prop_assert_eq!(snap.successes, expected_successes);
    }

    /// Success rate is always within [0, 1] and zero with no history.
    #[test]
    fn success_rate_is_bounded(
        outcomes in prop::collection::vec(any::<bool>(), 0..200),
    ) {
        let store = MetricsStore::new();
        for success in &outcomes {
            if *success {
                store.record_success(Duration::from_millis(1));
            } else {
                store.record_failure(ErrorKind::Timeout, Severity::Low, 1, Duration::from_millis(1));
            }
        }
        let rate = store.snapshot().success_rate;
        prop_assert!((0.0..=1.0).contains(&rate));
        if outcomes.is_empty() {
            prop_assert_eq!(rate, 0.0);
        }
    }
}
