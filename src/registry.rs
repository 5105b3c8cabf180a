//! Provider map and the per-provider aggregate that owns health, metrics,
//! breaker, and concurrency state (§3 Lifecycle, §5 Shared mutable state,
//! §9 "Cyclic references").
//!
//! Per §9: the breaker, health tracker, and metrics store reference each
//! other only by provider name through this registry, never by direct
//! ownership of one another. A registry-wide `RwLock` guards only the
//! add/remove path; each provider's own fields use their own interior
//! locking, so a reader of one provider's state never blocks a writer of
//! another's, matching `HealthCheckedContext`'s `Arc<RwLock<..>>` pattern
//! generalized to one aggregate struct per provider.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::GatewayError;
use crate::health::HealthTracker;
use crate::metrics_store::MetricsStore;
use crate::provider::{ProviderAdapter, ProviderDescriptor};

/// Everything the engine needs for one registered provider, created at
/// registration and destroyed at unregistration (§3 Lifecycle).
pub struct ProviderEntry {
    pub descriptor: ProviderDescriptor,
    pub adapter: Box<dyn ProviderAdapter>,
    pub health: HealthTracker,
    pub metrics: MetricsStore,
    pub breaker: Mutex<CircuitBreaker>,
    pub concurrency: Semaphore,
    last_used_at: Mutex<Option<Instant>>,
    /// Rolling count of rate-limit-triggered retries on this provider, used
    /// to enforce the backoff policy's "≤3 per sliding 60s window" cap
    /// (§4.B) independent of the general retry budget.
    rate_limit_retries: Mutex<VecDeque<Instant>>,
}

impl ProviderEntry {
    fn new(descriptor: ProviderDescriptor, adapter: Box<dyn ProviderAdapter>, breaker_config: CircuitBreakerConfig) -> Self {
        let max_concurrent = descriptor.max_concurrent.max(1) as usize;
        let name: Arc<str> = Arc::from(descriptor.name.as_str());
        Self {
            breaker: Mutex::new(CircuitBreaker::new(name, breaker_config)),
            concurrency: Semaphore::new(max_concurrent),
            descriptor,
            adapter,
            health: HealthTracker::new(),
            metrics: MetricsStore::new(),
            last_used_at: Mutex::new(None),
            rate_limit_retries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn mark_used(&self) {
        *self.last_used_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn last_used_at(&self) -> Option<Instant> {
        *self.last_used_at.lock().unwrap()
    }

    pub fn concurrency_used(&self) -> u32 {
        let max = self.descriptor.max_concurrent;
        let available = self.concurrency.available_permits() as u32;
        max.saturating_sub(available)
    }

    /// Records a rate-limit retry attempt and reports whether the provider
    /// is still under its 60-second budget (≤3 entries) after recording it.
    pub fn try_record_rate_limit_retry(&self) -> bool {
        let mut window = self.rate_limit_retries.lock().unwrap();
        let now = Instant::now();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= 3 {
            return false;
        }
        window.push_back(now);
        true
    }
}

/// The provider map. Registration/deregistration take the map's write lock
/// only briefly; everything else operates on an `Arc<ProviderEntry>` snapshot
/// obtained under a short read lock.
#[derive(Default)]
pub struct Registry {
    providers: RwLock<HashMap<Arc<str>, Arc<ProviderEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        descriptor: ProviderDescriptor,
        adapter: Box<dyn ProviderAdapter>,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Arc<str>, GatewayError> {
        let name: Arc<str> = Arc::from(descriptor.name.as_str());
        let mut providers = self.providers.write().unwrap();
        if providers.contains_key(&name) {
            return Err(GatewayError::ProviderAlreadyRegistered(descriptor.name.clone()));
        }
        providers.insert(Arc::clone(&name), Arc::new(ProviderEntry::new(descriptor, adapter, breaker_config)));
        Ok(name)
    }

    pub fn unregister(&self, name: &str) -> Result<(), GatewayError> {
        let mut providers = self.providers.write().unwrap();
        if providers.remove(name).is_none() {
            return Err(GatewayError::UnknownProvider(name.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.providers.read().unwrap().get(name).cloned()
    }

    /// A point-in-time snapshot of every registered provider, safe to iterate
    /// without holding the registry lock.
    pub fn snapshot(&self) -> Vec<Arc<ProviderEntry>> {
        self.providers.read().unwrap().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<Arc<str>> {
        self.providers.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RawUpstreamError;
    use crate::provider::{GenerateOptions, GeneratedPayload};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubAdapter;

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<GeneratedPayload, RawUpstreamError> {
            Ok(GeneratedPayload(json!({"content": "ok"})))
        }

        async fn test_connection(&self) -> Result<(), RawUpstreamError> {
            Ok(())
        }
    }

    #[test]
    fn register_then_get_round_trips() {
        let registry = Registry::new();
        registry.register(ProviderDescriptor::new("alpha"), Box::new(StubAdapter), CircuitBreakerConfig::default()).unwrap();
        assert!(registry.get("alpha").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry.register(ProviderDescriptor::new("alpha"), Box::new(StubAdapter), CircuitBreakerConfig::default()).unwrap();
        let result = registry.register(ProviderDescriptor::new("alpha"), Box::new(StubAdapter), CircuitBreakerConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn unregister_removes_the_provider_and_its_state() {
        let registry = Registry::new();
        registry.register(ProviderDescriptor::new("alpha"), Box::new(StubAdapter), CircuitBreakerConfig::default()).unwrap();
        registry.unregister("alpha").unwrap();
        assert!(registry.get("alpha").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_unknown_provider_is_a_contract_error() {
        let registry = Registry::new();
        assert!(registry.unregister("ghost").is_err());
    }

    #[test]
    fn rate_limit_retry_budget_caps_at_three_per_window() {
        let registry = Registry::new();
        let name = registry.register(ProviderDescriptor::new("alpha"), Box::new(StubAdapter), CircuitBreakerConfig::default()).unwrap();
        let entry = registry.get(&name).unwrap();
        assert!(entry.try_record_rate_limit_retry());
        assert!(entry.try_record_rate_limit_retry());
        assert!(entry.try_record_rate_limit_retry());
        assert!(!entry.try_record_rate_limit_retry());
    }
}
