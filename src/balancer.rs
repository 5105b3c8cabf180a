//! Pure `select(candidates, requirements, state) -> chosen` over the
//! candidate set (§4.G).
//!
//! `Strategy`'s shape (an enum of named selection policies) is grounded on
//! `tower_resilience_healthcheck::selector::SelectionStrategy`
//! (`FirstAvailable`/`RoundRobin`/`PreferHealthy`/`Custom`), generalized to
//! the spec's five strategies; `RoundRobin` reuses the teacher's
//! `AtomicUsize` wraparound counter verbatim. The periodic re-evaluation in
//! `AdaptiveStrategy` mirrors `tower_resilience_adaptive`'s timer-driven
//! algorithm switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

/// One candidate as seen by the balancer: already filtered/priced by the
/// Preference Resolver, carrying just what scoring needs.
#[derive(Debug, Clone)]
pub struct BalancerCandidate {
    pub name: Arc<str>,
    pub effective_priority: f64,
    pub success_rate: f64,
    pub has_history: bool,
    pub avg_response_time: Duration,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_used_at: Option<Instant>,
    pub concurrency_used: u32,
    pub concurrency_max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Weighted,
    RoundRobin,
    LeastConnections,
    FastestResponse,
    Priority,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Weighted => "weighted",
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::FastestResponse => "fastest_response",
            Strategy::Priority => "priority",
        }
    }

    /// Parses the `loadBalancingStrategy`/`setStrategy` configuration string
    /// (§6 External interfaces) into a `Strategy`, accepting both
    /// `snake_case` and `kebab-case` spellings.
    pub fn parse(s: &str) -> Option<Strategy> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "weighted" => Some(Strategy::Weighted),
            "round_robin" => Some(Strategy::RoundRobin),
            "least_connections" => Some(Strategy::LeastConnections),
            "fastest_response" => Some(Strategy::FastestResponse),
            "priority" => Some(Strategy::Priority),
            _ => None,
        }
    }
}

/// Weighted score for one candidate, per §4.G's formula. Exposed so tests and
/// the adaptive evaluator can inspect the breakdown.
pub fn weighted_score(c: &BalancerCandidate) -> f64 {
    let base = c.effective_priority * 20.0;
    let success = c.success_rate * 50.0;
    let rt_ms = c.avg_response_time.as_millis() as f64;
    let response_time_score = (30.0 * (1.0 - (rt_ms / 5000.0).min(1.0))).clamp(0.0, 30.0);
    let health_bonus = if c.is_healthy { 20.0 } else { 0.0 };
    let failure_penalty = -5.0 * c.consecutive_failures as f64;
    let recent_activity_bonus = match c.last_used_at {
        Some(at) if at.elapsed() <= Duration::from_secs(60) => 10.0,
        _ => 0.0,
    };
    let fill_ratio = if c.concurrency_max > 0 { c.concurrency_used as f64 / c.concurrency_max as f64 } else { 0.0 };
    let load_penalty = -20.0 * fill_ratio.clamp(0.0, 1.0);

    base + success + response_time_score + health_bonus + failure_penalty + recent_activity_bonus + load_penalty
}

/// Selects among `candidates` using `strategy`. Pure function plus a
/// round-robin counter carried by the caller (the `LoadBalancer` struct
/// below owns one per registered strategy instance).
fn select_with(strategy: Strategy, candidates: &[BalancerCandidate], round_robin_counter: &AtomicUsize) -> Option<Arc<str>> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        Strategy::Weighted => {
            let scores: Vec<(Arc<str>, f64)> = candidates.iter().map(|c| (Arc::clone(&c.name), weighted_score(c))).collect();
            let min_score = scores.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
            let shift = if min_score < 0.0 { -min_score + 1.0 } else { 1.0 };
            let total: f64 = scores.iter().map(|(_, s)| s + shift).sum();
            let mut pick = rand::rng().random_range(0.0..total);
            for (name, score) in &scores {
                let weight = score + shift;
                if pick < weight {
                    return Some(Arc::clone(name));
                }
                pick -= weight;
            }
            scores.last().map(|(name, _)| Arc::clone(name))
        }
        Strategy::RoundRobin => {
            let healthy: Vec<&BalancerCandidate> = candidates.iter().filter(|c| c.is_healthy).collect();
            let pool = if healthy.is_empty() { candidates.iter().collect::<Vec<_>>() } else { healthy };
            let idx = round_robin_counter.fetch_add(1, Ordering::Relaxed);
            pool.get(idx % pool.len()).map(|c| Arc::clone(&c.name))
        }
        Strategy::LeastConnections => candidates
            .iter()
            .min_by_key(|c| c.concurrency_used)
            .map(|c| Arc::clone(&c.name)),
        Strategy::FastestResponse => candidates
            .iter()
            .min_by_key(|c| c.avg_response_time)
            .map(|c| Arc::clone(&c.name)),
        Strategy::Priority => candidates
            .iter()
            .max_by(|a, b| a.effective_priority.partial_cmp(&b.effective_priority).unwrap_or(std::cmp::Ordering::Equal))
            .map(|c| Arc::clone(&c.name)),
    }
}

/// Aggregate stats the adaptive evaluator inspects to decide whether to
/// switch strategy.
#[derive(Debug, Default)]
struct AdaptiveState {
    last_evaluated: Option<Instant>,
    selections: HashMap<Arc<str>, u64>,
    total_selections: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    pub evaluation_interval: Duration,
    pub response_time_threshold: Duration,
    pub concentration_threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            evaluation_interval: Duration::from_secs(60),
            response_time_threshold: Duration::from_millis(3000),
            concentration_threshold: 0.8,
        }
    }
}

/// Selects among candidates with a current strategy that can be swapped
/// manually (`setStrategy`) or, when `adaptive` is enabled, automatically.
pub struct LoadBalancer {
    strategy: Mutex<Strategy>,
    round_robin_counter: AtomicUsize,
    adaptive: AdaptiveConfig,
    adaptive_state: Mutex<AdaptiveState>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy, adaptive: AdaptiveConfig) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            round_robin_counter: AtomicUsize::new(0),
            adaptive,
            adaptive_state: Mutex::new(AdaptiveState::default()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.lock().unwrap()
    }

    pub fn set_strategy(&self, strategy: Strategy) -> Strategy {
        let mut current = self.strategy.lock().unwrap();
        let previous = *current;
        *current = strategy;
        previous
    }

    pub fn select(&self, candidates: &[BalancerCandidate]) -> Option<Arc<str>> {
        let strategy = self.strategy();
        let chosen = select_with(strategy, candidates, &self.round_robin_counter);
        if let Some(name) = &chosen {
            self.record_selection(name, candidates);
        }
        chosen
    }

    fn record_selection(&self, name: &Arc<str>, candidates: &[BalancerCandidate]) {
        if !self.adaptive.enabled {
            return;
        }
        let mut state = self.adaptive_state.lock().unwrap();
        *state.selections.entry(Arc::clone(name)).or_insert(0) += 1;
        state.total_selections += 1;

        let due = state.last_evaluated.map(|t| t.elapsed() >= self.adaptive.evaluation_interval).unwrap_or(true);
        if !due {
            return;
        }
        state.last_evaluated = Some(Instant::now());

        let avg_response_time = if candidates.is_empty() {
            Duration::ZERO
        } else {
            let total_ms: u128 = candidates.iter().map(|c| c.avg_response_time.as_millis()).sum();
            Duration::from_millis((total_ms / candidates.len() as u128) as u64)
        };

        let max_share = state
            .selections
            .values()
            .copied()
            .max()
            .map(|m| m as f64 / state.total_selections.max(1) as f64)
            .unwrap_or(0.0);

        drop(state);

        if avg_response_time > self.adaptive.response_time_threshold {
            self.set_strategy(Strategy::FastestResponse);
        } else if max_share >= self.adaptive.concentration_threshold {
            self.set_strategy(Strategy::RoundRobin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, priority: f64, rate: f64, rt_ms: u64, healthy: bool, used: u32, max: u32) -> BalancerCandidate {
        BalancerCandidate {
            name: Arc::from(name),
            effective_priority: priority,
            success_rate: rate,
            has_history: true,
            avg_response_time: Duration::from_millis(rt_ms),
            is_healthy: healthy,
            consecutive_failures: 0,
            last_used_at: None,
            concurrency_used: used,
            concurrency_max: max,
        }
    }

    #[test]
    fn priority_picks_highest_effective_priority() {
        let candidates = vec![candidate("a", 5.0, 0.9, 100, true, 0, 10), candidate("b", 9.0, 0.1, 900, true, 0, 10)];
        let balancer = LoadBalancer::new(Strategy::Priority, AdaptiveConfig::default());
        assert_eq!(balancer.select(&candidates).unwrap().as_ref(), "b");
    }

    #[test]
    fn least_connections_picks_minimum_concurrency() {
        let candidates = vec![candidate("a", 5.0, 0.5, 100, true, 8, 10), candidate("b", 5.0, 0.5, 100, true, 2, 10)];
        let balancer = LoadBalancer::new(Strategy::LeastConnections, AdaptiveConfig::default());
        assert_eq!(balancer.select(&candidates).unwrap().as_ref(), "b");
    }

    #[test]
    fn fastest_response_picks_minimum_latency() {
        let candidates = vec![candidate("a", 5.0, 0.5, 900, true, 0, 10), candidate("b", 5.0, 0.5, 50, true, 0, 10)];
        let balancer = LoadBalancer::new(Strategy::FastestResponse, AdaptiveConfig::default());
        assert_eq!(balancer.select(&candidates).unwrap().as_ref(), "b");
    }

    #[test]
    fn round_robin_prefers_healthy_subset_and_wraps() {
        let candidates = vec![candidate("a", 5.0, 0.5, 100, true, 0, 10), candidate("b", 5.0, 0.5, 100, false, 0, 10), candidate("c", 5.0, 0.5, 100, true, 0, 10)];
        let balancer = LoadBalancer::new(Strategy::RoundRobin, AdaptiveConfig::default());
        let first = balancer.select(&candidates).unwrap();
        let second = balancer.select(&candidates).unwrap();
        let third = balancer.select(&candidates).unwrap();
        assert_eq!(first.as_ref(), "a");
        assert_eq!(second.as_ref(), "c");
        assert_eq!(third.as_ref(), "a");
    }

    #[test]
    fn round_robin_falls_back_to_full_set_when_none_healthy() {
        let candidates = vec![candidate("a", 5.0, 0.5, 100, false, 0, 10), candidate("b", 5.0, 0.5, 100, false, 0, 10)];
        let balancer = LoadBalancer::new(Strategy::RoundRobin, AdaptiveConfig::default());
        assert!(balancer.select(&candidates).is_some());
    }

    #[test]
    fn weighted_always_returns_one_of_the_candidates() {
        let candidates = vec![candidate("a", 5.0, 0.9, 50, true, 0, 10), candidate("b", 1.0, 0.1, 4000, false, 9, 10)];
        let balancer = LoadBalancer::new(Strategy::Weighted, AdaptiveConfig::default());
        for _ in 0..20 {
            let pick = balancer.select(&candidates).unwrap();
            assert!(pick.as_ref() == "a" || pick.as_ref() == "b");
        }
    }

    #[test]
    fn score_rewards_health_and_penalizes_load() {
        let healthy_idle = candidate("a", 5.0, 0.5, 100, true, 0, 10);
        let unhealthy_loaded = candidate("b", 5.0, 0.5, 100, false, 10, 10);
        assert!(weighted_score(&healthy_idle) > weighted_score(&unhealthy_loaded));
    }

    #[test]
    fn parse_accepts_known_spellings_and_rejects_unknown() {
        assert_eq!(Strategy::parse("round-robin"), Some(Strategy::RoundRobin));
        assert_eq!(Strategy::parse("FASTEST_RESPONSE"), Some(Strategy::FastestResponse));
        assert_eq!(Strategy::parse("bogus"), None);
    }

    #[test]
    fn set_strategy_returns_previous() {
        let balancer = LoadBalancer::new(Strategy::Priority, AdaptiveConfig::default());
        let previous = balancer.set_strategy(Strategy::RoundRobin);
        assert_eq!(previous, Strategy::Priority);
        assert_eq!(balancer.strategy(), Strategy::RoundRobin);
    }
}
