//! Property tests for the response normalizer's sanitize stage (§4.H, §8 P9).

use proptest::prelude::*;
use provider_gateway::normalizer::sanitize;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(80))]

    /// P9: sanitizing is idempotent — a sanitized string round-trips to itself.
    #[test]
    fn sanitize_is_idempotent(raw in ".{0,200}") {
        let once = sanitize(&raw, 100_000);
        let twice = sanitize(&once, 100_000);
        prop_assert_eq!(once, twice);
    }

    /// Sanitizing never produces output longer than the requested cap.
    #[test]
    fn sanitize_respects_max_len(raw in ".{0,500}", max_len in 1usize..=200) {
        let cleaned = sanitize(&raw, max_len);
        prop_assert!(cleaned.chars().count() <= max_len);
    }

    /// A constructed script/handler/URI payload never survives sanitization.
    #[test]
    fn sanitize_strips_known_injection_markers(
        prefix in "[a-zA-Z0-9 ]{0,20}",
        suffix in "[a-zA-Z0-9 ]{0,20}",
    ) {
        let raw = format!("{prefix}<script>alert(1)</script>{suffix}");
        let cleaned = sanitize(&raw, 100_000);
        prop_assert!(!cleaned.to_lowercase().contains("<script"));
    }
}
