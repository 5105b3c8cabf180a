//! The upstream provider adapter contract consumed by the engine (§6) and the
//! immutable provider descriptor (§3).
//!
//! `ProviderAdapter` is an `async_trait` rather than the teacher's native
//! `async fn in trait` `HealthChecker<T>` (`tower_resilience_healthcheck`):
//! that trait is generic over one concrete resource type, while the
//! gateway's registry is inherently a heterogeneous
//! `Vec<Box<dyn ProviderAdapter>>`, which requires dyn compatibility.
//! Grounded on `LlmProvider` in the domain corpus
//! (`other_examples/*rustant*failover*`).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::classifier::RawUpstreamError;
use crate::normalizer::ProviderShape;

/// The opaque payload a provider returns. Always a fully-resolved
/// `serde_json::Value` — never a boxed future or channel handle — so the
/// engine's unresolved-placeholder safety net (§4.I step 4) only has to
/// check for the documented `"__pending__"` sentinel rather than model
/// literal cross-language promise objects (§9 open question).
#[derive(Debug, Clone)]
pub struct GeneratedPayload(pub Value);

impl GeneratedPayload {
    pub const PENDING_SENTINEL: &'static str = "__pending__";

    pub fn is_well_formed(&self) -> bool {
        !contains_pending_sentinel(&self.0)
    }
}

fn contains_pending_sentinel(value: &Value) -> bool {
    match value {
        Value::String(s) => s == GeneratedPayload::PENDING_SENTINEL,
        Value::Object(map) => map.values().any(contains_pending_sentinel),
        Value::Array(items) => items.iter().any(contains_pending_sentinel),
        _ => false,
    }
}

/// Caller-supplied generation parameters; deliberately minimal since prompt
/// construction is an external collaborator (§1 out of scope).
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub operation_type: Option<String>,
    pub timeout: Option<Duration>,
    pub context: Value,
}

/// External collaborator contract: two operations, `generate` and
/// `test_connection` (§6).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<GeneratedPayload, RawUpstreamError>;

    async fn test_connection(&self) -> Result<(), RawUpstreamError>;
}

/// Per-provider fallback policy (§3 Provider descriptor).
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self { max_retries: 3, backoff_multiplier: 2.0, max_backoff: Duration::from_secs(60) }
    }
}

/// Immutable for a given registration; replacement requires unregister then
/// register (§3 Provider descriptor).
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub base_priority: f64,
    pub enabled: bool,
    pub capabilities: HashSet<String>,
    pub max_concurrent: u32,
    pub requests_per_minute: Option<u32>,
    pub fallback_policy: FallbackPolicy,
    /// Which normalization shape (§4.H/§9 "tagged-variant discriminator")
    /// this provider's payloads follow. Defaults to `Generic`, which covers
    /// any adapter whose upstream doesn't match a named shape.
    pub response_shape: ProviderShape,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_priority: 1.0,
            enabled: true,
            capabilities: HashSet::new(),
            max_concurrent: 10,
            requests_per_minute: None,
            fallback_policy: FallbackPolicy::default(),
            response_shape: ProviderShape::Generic,
        }
    }
}

pub struct ProviderDescriptorBuilder {
    descriptor: ProviderDescriptor,
}

impl ProviderDescriptorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { descriptor: ProviderDescriptor::new(name) }
    }

    pub fn base_priority(mut self, priority: f64) -> Self {
        self.descriptor.base_priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.descriptor.enabled = enabled;
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.descriptor.capabilities.insert(capability.into());
        self
    }

    pub fn max_concurrent(mut self, n: u32) -> Self {
        self.descriptor.max_concurrent = n;
        self
    }

    pub fn requests_per_minute(mut self, n: u32) -> Self {
        self.descriptor.requests_per_minute = Some(n);
        self
    }

    pub fn fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.descriptor.fallback_policy = policy;
        self
    }

    pub fn response_shape(mut self, shape: ProviderShape) -> Self {
        self.descriptor.response_shape = shape;
        self
    }

    pub fn build(self) -> Result<ProviderDescriptor, String> {
        if self.descriptor.base_priority < 0.0 {
            return Err(format!("invalid priority: {}", self.descriptor.base_priority));
        }
        Ok(self.descriptor)
    }
}
