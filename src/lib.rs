//! provider-gateway: a dispatcher that routes generation requests across
//! upstream AI providers with health monitoring, load balancing, circuit
//! breaking, retry/backoff, fallback execution, and response normalization.
//!
//! The orchestration lives in [`engine::Gateway`]; everything else in this
//! crate is a collaborator it composes: [`registry`] owns the provider map
//! and per-provider aggregate state, [`circuit`] is the per-provider breaker,
//! [`health`] and [`metrics_store`] track rolling provider health and
//! metrics, [`balancer`] picks among eligible candidates, [`preference`]
//! filters and scores candidates against caller-supplied rules, [`backoff`]
//! computes retry delays, [`classifier`] turns raw upstream errors into a
//! closed vocabulary of kinds/severities, [`normalizer`] turns a provider's
//! raw payload into canonical text, and [`events`] is the observer hook for
//! all of the above.

pub mod backoff;
pub mod balancer;
pub mod circuit;
pub mod classifier;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics_store;
pub mod normalizer;
pub mod preference;
pub mod provider;
pub mod registry;

pub use backoff::BackoffPolicy;
pub use balancer::{AdaptiveConfig, BalancerCandidate, LoadBalancer, Strategy};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitSnapshot, CircuitState};
pub use classifier::{DefaultClassifier, FailureClassifier, FnClassifier, RawUpstreamError};
pub use engine::{ExecuteOptions, ExecutionOutcome, Gateway, GatewayConfig, GatewayConfigBuilder, OperationShapeHint};
pub use error::{ClassifiedError, ErrorKind, ExhaustionSummary, GatewayError, Severity};
pub use events::{EventListener, EventListeners, FnListener, GatewayEvent, GatewayEventKind};
pub use health::{HealthCheckConfig, HealthSnapshot, HealthTracker};
pub use metrics_store::{FailureEvent, MetricsSnapshot, MetricsStore};
pub use normalizer::{
    NormalizationFailed, NormalizedResponse, NormalizerConfig, OperationShape, ProviderShape, ResponseNormalizer, ShapeExtractor,
    ShapeRegistry,
};
pub use preference::{CandidateFacts, PreferenceRules, PreferenceResolver};
pub use provider::{FallbackPolicy, GenerateOptions, GeneratedPayload, ProviderAdapter, ProviderDescriptor, ProviderDescriptorBuilder};
pub use registry::{ProviderEntry, Registry};
