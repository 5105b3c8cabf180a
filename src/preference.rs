//! Composes static priority, performance adjustment, and context/user rules
//! into an effective priority used by selection (§4.F).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Per-request overrides a caller can supply (§6 `execute` options).
#[derive(Debug, Clone, Default)]
pub struct PreferenceRules {
    pub preferred_providers: Vec<Arc<str>>,
    pub exclude_providers: Vec<Arc<str>>,
    pub required_capabilities: Vec<String>,
    pub min_success_rate: Option<f64>,
    pub max_response_time: Option<Duration>,
}

/// Bonus added to the base+performance priority when a provider is named in
/// `preferredProviders`.
const PREFERRED_BONUS: f64 = 5.0;

/// What the resolver needs to know about one candidate provider to compute
/// its effective priority; deliberately independent of the registry's
/// internal locking so it can be built from a snapshot.
#[derive(Debug, Clone)]
pub struct CandidateFacts {
    pub name: Arc<str>,
    pub base_priority: f64,
    pub success_rate: f64,
    pub has_history: bool,
    pub response_time: Duration,
    pub capabilities: HashSet<String>,
    pub enabled: bool,
}

pub struct PreferenceResolver;

impl PreferenceResolver {
    /// Returns `Some(effective_priority)` for an admissible candidate, or
    /// `None` if the rules filter it out entirely.
    pub fn effective_priority(candidate: &CandidateFacts, rules: &PreferenceRules) -> Option<f64> {
        if !candidate.enabled {
            return None;
        }
        if rules.exclude_providers.iter().any(|p| **p == *candidate.name) {
            return None;
        }
        if !rules.required_capabilities.is_empty()
            && !rules.required_capabilities.iter().all(|c| candidate.capabilities.contains(c))
        {
            return None;
        }
        // New providers with zero history bypass the success-rate cutoff.
        if candidate.has_history {
            if let Some(min_rate) = rules.min_success_rate {
                if candidate.success_rate < min_rate {
                    return None;
                }
            }
        }
        if let Some(max_rt) = rules.max_response_time {
            if candidate.has_history && candidate.response_time > max_rt {
                return None;
            }
        }

        let performance_adjusted = (candidate.base_priority + 2.0 * (candidate.success_rate - 0.5)).max(0.1);
        let bonus = if rules.preferred_providers.iter().any(|p| **p == *candidate.name) {
            PREFERRED_BONUS
        } else {
            0.0
        };
        Some(performance_adjusted + bonus)
    }
}
