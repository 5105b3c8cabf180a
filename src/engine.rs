//! Orchestrates selection, admission, retry, fallback and context carry
//! across providers for one request (§4.I) — the gateway's public surface
//! (§6 "Engine surface").
//!
//! Grounded on `FailoverProvider::complete` in
//! `other_examples/*rustant*failover*` for the lock-drop-before-await,
//! try-next-provider-on-failure loop shape, generalized with the spec's
//! retry-same-provider-first behavior, dynamic per-attempt timeouts, and
//! context carry across switches; on `tower_resilience_fallback`'s
//! event-emission pattern and `tower_resilience_executor`'s per-attempt
//! `tokio::time::timeout` wrapping for the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::backoff::BackoffPolicy;
use crate::balancer::{AdaptiveConfig, BalancerCandidate, LoadBalancer, Strategy};
use crate::circuit::{CircuitBreakerConfig, CircuitSnapshot};
use crate::classifier::{DefaultClassifier, FailureClassifier, RawUpstreamError};
use crate::error::{remediation_for, ClassifiedError, ErrorKind, ExhaustionSummary, GatewayError, Severity};
use crate::events::{EventListener, EventListeners, GatewayEvent, GatewayEventKind};
use crate::health::HealthSnapshot;
use crate::metrics_store::MetricsSnapshot;
use crate::normalizer::{NormalizerConfig, OperationShape, ResponseNormalizer};
use crate::preference::{CandidateFacts, PreferenceResolver, PreferenceRules};
use crate::provider::{GenerateOptions, GeneratedPayload, ProviderAdapter, ProviderDescriptor};
use crate::registry::{ProviderEntry, Registry};

/// Builder-configurable engine-wide settings (§6 Configuration table).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub health_check_interval: Duration,
    pub health_probe_timeout: Duration,
    pub max_retry_attempts: u32,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub half_open_max_requests: u32,
    pub failure_rate_threshold: f64,
    pub min_requests_for_rate: usize,
    pub window_size: usize,
    pub window_time: Duration,
    pub max_concurrent_requests: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub priority_levels: Vec<String>,
    pub base_timeout: Duration,
    pub loadbalancing_strategy: Strategy,
    pub adaptive_strategy: bool,
    pub normalizer: NormalizerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(5),
            max_retry_attempts: 3,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
            failure_rate_threshold: 0.5,
            min_requests_for_rate: 10,
            window_size: 100,
            window_time: Duration::from_secs(300),
            max_concurrent_requests: None,
            max_queue_size: None,
            priority_levels: vec!["low".into(), "normal".into(), "high".into()],
            base_timeout: Duration::from_secs(30),
            loadbalancing_strategy: Strategy::Weighted,
            adaptive_strategy: false,
            normalizer: NormalizerConfig::default(),
        }
    }
}

pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn new() -> Self {
        Self { config: GatewayConfig::default() }
    }

    pub fn health_check_interval(mut self, d: Duration) -> Self {
        self.config.health_check_interval = d;
        self
    }

    pub fn max_retry_attempts(mut self, n: u32) -> Self {
        self.config.max_retry_attempts = n;
        self
    }

    pub fn backoff_multiplier(mut self, m: f64) -> Self {
        self.config.backoff_multiplier = m;
        self
    }

    pub fn circuit_breaker_threshold(mut self, n: u32) -> Self {
        self.config.circuit_breaker_threshold = n;
        self
    }

    pub fn circuit_breaker_timeout(mut self, d: Duration) -> Self {
        self.config.circuit_breaker_timeout = d;
        self
    }

    pub fn half_open_max_requests(mut self, n: u32) -> Self {
        self.config.half_open_max_requests = n;
        self
    }

    pub fn failure_rate_threshold(mut self, rate: f64) -> Self {
        self.config.failure_rate_threshold = rate;
        self
    }

    pub fn window(mut self, size: usize, time: Duration) -> Self {
        self.config.window_size = size;
        self.config.window_time = time;
        self
    }

    pub fn max_concurrent_requests(mut self, n: usize) -> Self {
        self.config.max_concurrent_requests = Some(n);
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.config.max_queue_size = Some(n);
        self
    }

    pub fn priority_levels(mut self, levels: Vec<String>) -> Self {
        self.config.priority_levels = levels;
        self
    }

    pub fn base_timeout(mut self, d: Duration) -> Self {
        self.config.base_timeout = d;
        self
    }

    pub fn loadbalancing_strategy(mut self, s: Strategy) -> Self {
        self.config.loadbalancing_strategy = s;
        self
    }

    pub fn adaptive_strategy(mut self, enabled: bool) -> Self {
        self.config.adaptive_strategy = enabled;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request overrides (§6 `execute` options).
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
    pub context: Value,
    pub preserve_context: bool,
    pub operation_type: Option<String>,
    pub operation_shape: OperationShapeHint,
    pub preferred_providers: Vec<Arc<str>>,
    pub exclude_providers: Vec<Arc<str>>,
    pub capabilities: Vec<String>,
    pub min_success_rate: Option<f64>,
    pub max_response_time: Option<Duration>,
    pub user_id: Option<String>,
    pub strategy: Option<Strategy>,
    pub allow_unhealthy: bool,
    pub priority: Option<String>,
}

/// Whether the caller expects JSON-shaped content back (drives the
/// normalizer's Extract/Validate behavior, §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationShapeHint {
    #[default]
    PlainText,
    Json,
}

impl From<OperationShapeHint> for OperationShape {
    fn from(hint: OperationShapeHint) -> Self {
        match hint {
            OperationShapeHint::PlainText => OperationShape::PlainText,
            OperationShapeHint::Json => OperationShape::Json,
        }
    }
}

/// What a successful `execute` returns.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub content: String,
    pub warnings: Vec<String>,
    pub provider: Arc<str>,
    pub total_attempts: u32,
    pub raw: Value,
}

/// Owns the provider registry plus every stateless collaborator (balancer,
/// classifier, normalizer, backoff policy, event dispatch) needed to execute
/// requests. Callers construct one `Gateway` per tenant (§9 "no process-wide
/// singleton").
pub struct Gateway {
    registry: Arc<Registry>,
    balancer: Arc<LoadBalancer>,
    classifier: Arc<dyn FailureClassifier>,
    normalizer: Arc<ResponseNormalizer>,
    backoff: BackoffPolicy,
    events: EventListeners<GatewayEvent>,
    config: GatewayConfig,
    global_inflight: Option<Arc<Semaphore>>,
    health_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(300);
const RECENT_FAILURE_RETRY_HALVING_THRESHOLD: usize = 5;
const MAX_DYNAMIC_TIMEOUT: Duration = Duration::from_secs(120);

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let global_inflight = config.max_concurrent_requests.map(|n| Arc::new(Semaphore::new(n)));
        Self {
            registry: Arc::new(Registry::new()),
            balancer: Arc::new(LoadBalancer::new(
                config.loadbalancing_strategy,
                AdaptiveConfig { enabled: config.adaptive_strategy, ..AdaptiveConfig::default() },
            )),
            classifier: Arc::new(DefaultClassifier),
            normalizer: Arc::new(ResponseNormalizer::new(Default::default(), config.normalizer.clone())),
            backoff: BackoffPolicy::new(config.backoff_multiplier, config.max_backoff),
            events: EventListeners::new(),
            config,
            global_inflight,
            health_task: std::sync::Mutex::new(None),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<ResponseNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn add_event_listener(&mut self, listener: impl EventListener<GatewayEvent> + 'static) {
        self.events.add(listener);
    }

    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            consecutive_failure_threshold: self.config.circuit_breaker_threshold,
            failure_rate_threshold: self.config.failure_rate_threshold,
            min_requests_for_rate: self.config.min_requests_for_rate,
            window_size: self.config.window_size,
            window_time: self.config.window_time,
            open_timeout: self.config.circuit_breaker_timeout,
            half_open_max_requests: self.config.half_open_max_requests,
        }
    }

    /// `register(name, adapter, config)` (§6).
    pub fn register(&self, descriptor: ProviderDescriptor, adapter: Box<dyn ProviderAdapter>) -> Result<(), GatewayError> {
        let name = self.registry.register(descriptor, adapter, self.breaker_config())?;
        self.events.emit(&GatewayEvent::new(GatewayEventKind::ProviderRegistered { provider: name }));
        Ok(())
    }

    /// `unregister(name)` (§6).
    pub fn unregister(&self, name: &str) -> Result<(), GatewayError> {
        self.registry.unregister(name)?;
        self.events.emit(&GatewayEvent::new(GatewayEventKind::ProviderUnregistered { provider: Arc::from(name) }));
        Ok(())
    }

    /// Spawns the periodic health-probe tick (§4.D). Probes run concurrently
    /// across providers via `join_all`, so one provider's probe failure never
    /// blocks another's update. Returns a handle; `shutdown` aborts it.
    pub fn start_health_checks(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let interval = gateway.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                gateway.run_health_probe_cycle().await;
            }
        });
        *self.health_task.lock().unwrap() = Some(handle);
    }

    async fn run_health_probe_cycle(&self) {
        let providers = self.registry.snapshot();
        let probe_timeout = self.config.health_probe_timeout;
        let probes = providers.into_iter().map(|entry| async move {
            let outcome = tokio::time::timeout(probe_timeout, entry.adapter.test_connection()).await;
            match outcome {
                Ok(Ok(())) => {
                    entry.health.record_probe_success();
                    GatewayEventKind::HealthCheckPassed { provider: Arc::from(entry.name()) }
                }
                Ok(Err(e)) => {
                    entry.health.record_probe_failure(e.message.clone());
                    GatewayEventKind::HealthCheckFailed { provider: Arc::from(entry.name()), consecutive_failures: entry.health.consecutive_failures() }
                }
                Err(_) => {
                    entry.health.record_probe_failure("health probe timed out");
                    GatewayEventKind::HealthCheckFailed { provider: Arc::from(entry.name()), consecutive_failures: entry.health.consecutive_failures() }
                }
            }
        });
        for event_kind in futures::future::join_all(probes).await {
            self.events.emit(&GatewayEvent::new(event_kind));
        }
    }

    /// Stops the background health-check task, if one was started.
    pub fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn health(&self, name: &str) -> Result<HealthSnapshot, GatewayError> {
        self.registry.get(name).map(|e| e.health.snapshot()).ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))
    }

    pub fn all_health(&self) -> HashMap<Arc<str>, HealthSnapshot> {
        self.registry.snapshot().into_iter().map(|e| (Arc::from(e.name()), e.health.snapshot())).collect()
    }

    pub fn metrics(&self, name: &str) -> Result<MetricsSnapshot, GatewayError> {
        self.registry.get(name).map(|e| e.metrics.snapshot()).ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))
    }

    pub fn all_metrics(&self) -> HashMap<Arc<str>, MetricsSnapshot> {
        self.registry.snapshot().into_iter().map(|e| (Arc::from(e.name()), e.metrics.snapshot())).collect()
    }

    pub fn breaker_state(&self, name: &str) -> Result<CircuitSnapshot, GatewayError> {
        self.registry
            .get(name)
            .map(|e| e.breaker.lock().unwrap().snapshot())
            .ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))
    }

    pub fn reset_breaker(&self, name: &str) -> Result<(), GatewayError> {
        let entry = self.registry.get(name).ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))?;
        entry.breaker.lock().unwrap().reset();
        Ok(())
    }

    pub fn reset_all_breakers(&self) {
        for entry in self.registry.snapshot() {
            entry.breaker.lock().unwrap().reset();
        }
    }

    /// `setStrategy(name)` (§6): parses the strategy name and installs it.
    pub fn set_strategy(&self, name: &str) -> Result<Strategy, GatewayError> {
        let strategy = Strategy::parse(name).ok_or_else(|| GatewayError::UnknownStrategy(name.to_string()))?;
        let previous = self.balancer.set_strategy(strategy);
        self.events.emit(&GatewayEvent::new(GatewayEventKind::StrategyChanged { from: previous.label(), to: strategy.label() }));
        Ok(strategy)
    }

    /// Builds the ordered candidate list (§4.I step 1): effective priority
    /// desc, then consecutive failures asc, then last-failure-time asc
    /// (providers with no failure history sort first).
    fn ordered_candidates(&self, options: &ExecuteOptions) -> Vec<Arc<ProviderEntry>> {
        let rules = PreferenceRules {
            preferred_providers: options.preferred_providers.clone(),
            exclude_providers: options.exclude_providers.clone(),
            required_capabilities: options.capabilities.clone(),
            min_success_rate: options.min_success_rate,
            max_response_time: options.max_response_time,
        };

        let mut scored: Vec<(f64, Arc<ProviderEntry>)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|entry| {
                let metrics = entry.metrics.snapshot();
                let facts = CandidateFacts {
                    name: Arc::from(entry.name()),
                    base_priority: entry.descriptor.base_priority,
                    success_rate: metrics.success_rate,
                    has_history: metrics.requests > 0,
                    response_time: metrics.avg_response_time,
                    capabilities: entry.descriptor.capabilities.clone(),
                    enabled: entry.descriptor.enabled,
                };
                PreferenceResolver::effective_priority(&facts, &rules).map(|priority| (priority, Arc::clone(&entry)))
            })
            .collect();

        scored.sort_by(|(pa, ea), (pb, eb)| {
            pb.partial_cmp(pa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ea.health.consecutive_failures().cmp(&eb.health.consecutive_failures()))
                .then_with(|| last_failure_sort_key(eb).cmp(&last_failure_sort_key(ea)))
        });

        scored.into_iter().map(|(_, entry)| entry).collect()
    }

    fn balancer_candidates(&self, entries: &[Arc<ProviderEntry>], rules: &PreferenceRules) -> Vec<BalancerCandidate> {
        entries
            .iter()
            .filter_map(|entry| {
                let metrics = entry.metrics.snapshot();
                let facts = CandidateFacts {
                    name: Arc::from(entry.name()),
                    base_priority: entry.descriptor.base_priority,
                    success_rate: metrics.success_rate,
                    has_history: metrics.requests > 0,
                    response_time: metrics.avg_response_time,
                    capabilities: entry.descriptor.capabilities.clone(),
                    enabled: entry.descriptor.enabled,
                };
                let effective_priority = PreferenceResolver::effective_priority(&facts, rules)?;
                Some(BalancerCandidate {
                    name: Arc::from(entry.name()),
                    effective_priority,
                    success_rate: metrics.success_rate,
                    has_history: metrics.requests > 0,
                    avg_response_time: metrics.avg_response_time,
                    is_healthy: entry.health.is_healthy(),
                    consecutive_failures: entry.health.consecutive_failures(),
                    last_used_at: entry.last_used_at(),
                    concurrency_used: entry.concurrency_used(),
                    concurrency_max: entry.descriptor.max_concurrent,
                })
            })
            .collect()
    }

    fn dynamic_timeout(&self, base: Duration, avg_response_time: Duration) -> Duration {
        let rt_ms = avg_response_time.as_millis() as f64;
        let multiplier = (rt_ms / 5000.0).clamp(1.5, 3.0);
        let scaled = base.mul_f64(multiplier);
        scaled.min(MAX_DYNAMIC_TIMEOUT)
    }

    fn build_switch_context(base_context: &Value, previous_provider: Option<&Arc<str>>, attempt_number: u32, switch_reason: Option<ErrorKind>, failure_history: &[String]) -> Value {
        let mut enriched = serde_json::Map::new();
        enriched.insert("payload".to_string(), base_context.clone());
        if let Some(previous) = previous_provider {
            enriched.insert("previousProvider".to_string(), json!(previous.as_ref()));
            enriched.insert("attemptNumber".to_string(), json!(attempt_number));
            enriched.insert("totalAttempts".to_string(), json!(attempt_number));
            enriched.insert("switchReason".to_string(), json!(switch_reason.map(error_kind_label)));
            enriched.insert("failureHistory".to_string(), json!(failure_history));
        }
        Value::Object(enriched)
    }

    /// `execute(operation, providers?, options) -> result` (§4.I / §6). The
    /// gateway's one operation is `generate`: the "operation" callback named
    /// in §6 is realized concretely as a call to the selected provider's
    /// `ProviderAdapter::generate`, since that is the only upstream
    /// operation in scope for this crate (prompt construction and arbitrary
    /// operation dispatch are external collaborators per §1).
    pub async fn execute(&self, prompt: &str, options: ExecuteOptions) -> Result<ExecutionOutcome, GatewayError> {
        let _inflight_permit = match &self.global_inflight {
            Some(sem) => {
                if let Some(max_queue) = self.config.max_queue_size {
                    if sem.available_permits() == 0 && max_queue == 0 {
                        return Err(GatewayError::QueueFull);
                    }
                }
                Some(Arc::clone(sem).acquire_owned().await.expect("semaphore never closed"))
            }
            None => None,
        };

        if let Some(strategy) = options.strategy {
            self.balancer.set_strategy(strategy);
        }

        let rules = PreferenceRules {
            preferred_providers: options.preferred_providers.clone(),
            exclude_providers: options.exclude_providers.clone(),
            required_capabilities: options.capabilities.clone(),
            min_success_rate: options.min_success_rate,
            max_response_time: options.max_response_time,
        };

        let candidates = self.ordered_candidates(&options);
        if candidates.is_empty() {
            return Err(GatewayError::NoEligibleProvider);
        }

        let operation_shape: OperationShape = options.operation_shape.into();
        let mut per_provider_attempts: HashMap<String, u32> = HashMap::new();
        let mut total_attempts: u32 = 0;
        let mut last_classified: Option<ClassifiedError> = None;
        let mut previous_provider: Option<Arc<str>> = None;
        let mut failure_history: Vec<String> = Vec::new();

        // The candidate list is fixed for the lifetime of the request; the
        // load balancer chooses *within* it only when more than one remains
        // admissible, so Priority/RoundRobin/etc. still apply when a caller
        // hasn't narrowed the field via preferredProviders.
        let mut remaining: Vec<Arc<ProviderEntry>> = candidates;

        'provider_loop: while !remaining.is_empty() {
            let balancer_candidates = self.balancer_candidates(&remaining, &rules);
            let chosen_name = match self.balancer.select(&balancer_candidates) {
                Some(name) => name,
                None => break 'provider_loop,
            };
            let Some(pos) = remaining.iter().position(|e| e.name() == chosen_name.as_ref()) else {
                break 'provider_loop;
            };
            let entry = remaining.remove(pos);

            if !options.allow_unhealthy && !entry.health.is_healthy() {
                continue 'provider_loop;
            }

            self.events.emit(&GatewayEvent::new(GatewayEventKind::ProviderSelected {
                provider: Arc::from(entry.name()),
                strategy: self.balancer.strategy().label(),
            }));

            let recent_failures = entry.metrics.recent_failures(RECENT_FAILURE_WINDOW);
            let configured_max = options.max_attempts.unwrap_or(self.config.max_retry_attempts).max(1);
            let max_retries = if recent_failures >= RECENT_FAILURE_RETRY_HALVING_THRESHOLD {
                (configured_max / 2).max(1)
            } else {
                configured_max
            };

            let mut attempt: u32 = 1;
            'attempt_loop: loop {
                if !entry.breaker.lock().unwrap().admit() {
                    break 'attempt_loop;
                }

                let permit = match entry.concurrency.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => break 'attempt_loop,
                };

                total_attempts += 1;
                *per_provider_attempts.entry(entry.name().to_string()).or_insert(0) += 1;

                let avg_response_time = entry.metrics.avg_response_time();
                let base_timeout = options.timeout.unwrap_or(self.config.base_timeout);
                let dynamic_timeout = self.dynamic_timeout(base_timeout, avg_response_time);

                let enriched_context = if options.preserve_context {
                    Self::build_switch_context(&options.context, previous_provider.as_ref(), total_attempts, last_classified.as_ref().map(|c| c.kind), &failure_history)
                } else {
                    options.context.clone()
                };
                let generate_options = GenerateOptions { operation_type: options.operation_type.clone(), timeout: Some(dynamic_timeout), context: enriched_context.clone() };

                let started_at = Instant::now();
                let call_result = tokio::time::timeout(dynamic_timeout, entry.adapter.generate(prompt, &generate_options)).await;
                drop(permit);
                let elapsed = started_at.elapsed();

                let (classified, payload) = match call_result {
                    Err(_elapsed) => (Some(self.classifier.classify(&RawUpstreamError::new("request timed out"))), None),
                    Ok(Err(raw)) => (Some(self.classifier.classify(&raw)), None),
                    Ok(Ok(payload)) => {
                        if !payload.is_well_formed() {
                            return Err(GatewayError::ContractViolation(format!(
                                "provider '{}' returned an unresolved async placeholder: adapters must resolve payloads before returning",
                                entry.name()
                            )));
                        }
                        match self.normalizer.normalize(&payload.0, entry.descriptor.response_shape, operation_shape) {
                            Ok(normalized) => (None, Some((payload, normalized))),
                            Err(_) => (Some(self.classifier.classify(&RawUpstreamError::new("response normalization failed: no string content reachable"))), None),
                        }
                    }
                };

                if let (None, Some((payload, normalized))) = (&classified, &payload) {
                    entry.metrics.record_success(elapsed);
                    // `lock()` must fully drop before any nested re-lock below:
                    // holding it across the `if let` body (temporary lifetime
                    // extension) would self-deadlock on the non-reentrant Mutex.
                    let success_transition = entry.breaker.lock().unwrap().on_success();
                    if let Some((from, to)) = success_transition {
                        self.events.emit(&entry.breaker.lock().unwrap().event_for(from, to));
                    }
                    entry.health.record_request_success();
                    entry.mark_used();
                    self.events.emit(&GatewayEvent::new(GatewayEventKind::OperationSuccess { provider: Arc::from(entry.name()), attempt, duration: elapsed }));
                    return Ok(ExecutionOutcome {
                        content: normalized.content.clone(),
                        warnings: normalized.warnings.clone(),
                        provider: Arc::from(entry.name()),
                        total_attempts,
                        raw: payload.0.clone(),
                    });
                }

                let classified = classified.expect("non-success outcome always classifies an error");
                entry.metrics.record_failure(classified.kind, classified.severity, attempt, elapsed);
                let failure_transition = entry.breaker.lock().unwrap().on_failure();
                if let Some((from, to)) = failure_transition {
                    entry.metrics.record_breaker_trip();
                    self.events.emit(&entry.breaker.lock().unwrap().event_for(from, to));
                }
                entry.health.record_request_failure(classified.message.clone());
                self.events.emit(&GatewayEvent::new(GatewayEventKind::OperationFailure {
                    provider: Arc::from(entry.name()),
                    attempt,
                    kind: classified.kind,
                    severity: classified.severity,
                }));
                failure_history.push(format!("{}: {}", entry.name(), classified.message));
                if failure_history.len() > 20 {
                    failure_history.remove(0);
                }

                let is_critical = classified.severity == Severity::Critical;
                let retryable = classified.retryable && attempt < max_retries;
                let rate_limit_budget_ok = classified.kind != ErrorKind::RateLimit || entry.try_record_rate_limit_retry();

                last_classified = Some(classified.clone());

                if is_critical {
                    // Critical severity forces immediate fallback: at most one
                    // attempt on the offending provider (P6).
                    break 'attempt_loop;
                }
                if retryable && rate_limit_budget_ok {
                    tokio::time::sleep(self.backoff.compute(attempt, classified.kind)).await;
                    attempt += 1;
                    continue 'attempt_loop;
                }
                break 'attempt_loop;
            }

            previous_provider = Some(Arc::from(entry.name()));
        }

        let summary = ExhaustionSummary {
            attempt_count: total_attempts,
            per_provider_attempts,
            last_kind: last_classified.as_ref().map(|c| c.kind).unwrap_or(ErrorKind::Unknown),
            last_severity: last_classified.as_ref().map(|c| c.severity).unwrap_or(Severity::Medium),
            last_message: last_classified.as_ref().map(|c| c.message.clone()).unwrap_or_else(|| "no eligible provider admitted a request".to_string()),
            remediation: remediation_for(last_classified.as_ref()),
        };
        self.events.emit(&GatewayEvent::new(GatewayEventKind::AllProvidersFailed { attempt_count: summary.attempt_count, last_kind: summary.last_kind }));
        Err(GatewayError::AllProvidersExhausted(summary))
    }
}

fn error_kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Timeout => "timeout",
        ErrorKind::RateLimit => "rate_limit",
        ErrorKind::Authentication => "authentication",
        ErrorKind::Connection => "connection",
        ErrorKind::ServerError => "server_error",
        ErrorKind::ClientError => "client_error",
        ErrorKind::Quota => "quota",
        ErrorKind::CircuitOpen => "circuit_open",
        ErrorKind::Unknown => "unknown",
    }
}

/// Sort key for "longest since last failure first": a provider that has
/// never failed sorts as if its last failure were infinitely long ago.
fn last_failure_sort_key(entry: &Arc<ProviderEntry>) -> Duration {
    match entry.metrics.last_failure_at() {
        Some(at) => at.elapsed(),
        None => Duration::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RawUpstreamError;
    use crate::provider::{GenerateOptions as GenOpts, GeneratedPayload as Payload, ProviderDescriptorBuilder};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct ScriptedAdapter {
        /// Each call pops the front of this script; `Ok` succeeds with the
        /// given payload, `Err` fails with the given message.
        script: StdMutex<std::collections::VecDeque<Result<Value, String>>>,
        calls: AtomicU32,
        contexts: Arc<StdMutex<Vec<Value>>>,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<Result<Value, String>>) -> Self {
            Self { script: StdMutex::new(script.into()), calls: AtomicU32::new(0), contexts: Arc::new(StdMutex::new(Vec::new())) }
        }

        fn with_shared_contexts(script: Vec<Result<Value, String>>, contexts: Arc<StdMutex<Vec<Value>>>) -> Self {
            Self { script: StdMutex::new(script.into()), calls: AtomicU32::new(0), contexts }
        }

        fn always_fail(message: &str) -> Self {
            Self::new(std::iter::repeat_with(|| Err(message.to_string())).take(32).collect())
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn generate(&self, _prompt: &str, options: &GenOpts) -> Result<Payload, RawUpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().unwrap().push(options.context.clone());
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(value)) => Ok(Payload(value)),
                Some(Err(message)) => Err(RawUpstreamError::new(message)),
                None => Err(RawUpstreamError::new("script exhausted")),
            }
        }

        async fn test_connection(&self) -> Result<(), RawUpstreamError> {
            Ok(())
        }
    }

    fn gateway_with(max_retry_attempts: u32) -> Gateway {
        let config = GatewayConfigBuilder::new()
            .max_retry_attempts(max_retry_attempts)
            .circuit_breaker_threshold(100)
            .build();
        Gateway::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_succeed_on_same_provider() {
        let gateway = gateway_with(3);
        let adapter = ScriptedAdapter::new(vec![
            Err("request timed out".into()),
            Err("request timed out".into()),
            Ok(json!({"content": "hello there"})),
        ]);
        gateway.register(ProviderDescriptorBuilder::new("alpha").build().unwrap(), Box::new(adapter)).unwrap();

        let outcome = gateway.execute("hello", ExecuteOptions::default()).await.unwrap();
        assert_eq!(outcome.content, "hello there");
        assert_eq!(outcome.provider.as_ref(), "alpha");

        let metrics = gateway.metrics("alpha").unwrap();
        assert_eq!(metrics.requests, 3);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 2);
    }

    #[tokio::test]
    async fn critical_error_causes_immediate_switch_to_next_provider() {
        let gateway = gateway_with(3);
        let a = ScriptedAdapter::always_fail("Authentication failed");
        let b = ScriptedAdapter::new(vec![Ok(json!({"content": "from b"}))]);
        gateway.register(ProviderDescriptorBuilder::new("a").base_priority(10.0).build().unwrap(), Box::new(a)).unwrap();
        gateway.register(ProviderDescriptorBuilder::new("b").base_priority(1.0).build().unwrap(), Box::new(b)).unwrap();

        let mut options = ExecuteOptions::default();
        options.strategy = Some(Strategy::Priority);
        let outcome = gateway.execute("hello", options).await.unwrap();
        assert_eq!(outcome.provider.as_ref(), "b");

        let metrics_a = gateway.metrics("a").unwrap();
        assert_eq!(metrics_a.requests, 1, "critical severity allows only one attempt on the offending provider");
    }

    #[tokio::test]
    async fn fallback_exhausted_reports_all_providers() {
        let gateway = gateway_with(1);
        for name in ["a", "b", "c"] {
            let adapter = ScriptedAdapter::always_fail("Persistent failure");
            gateway.register(ProviderDescriptorBuilder::new(name).build().unwrap(), Box::new(adapter)).unwrap();
        }

        let err = gateway.execute("hello", ExecuteOptions::default()).await.unwrap_err();
        match err {
            GatewayError::AllProvidersExhausted(summary) => {
                assert_eq!(summary.per_provider_attempts.len(), 3);
                assert_eq!(summary.last_message, "Persistent failure");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn context_carries_previous_provider_and_switch_reason_after_switch() {
        let gateway = gateway_with(1);
        let a = ScriptedAdapter::always_fail("server_error: bad gateway");
        let b_contexts = Arc::new(StdMutex::new(Vec::new()));
        let b = ScriptedAdapter::with_shared_contexts(vec![Ok(json!({"content": "ok from b"}))], Arc::clone(&b_contexts));
        gateway.register(ProviderDescriptorBuilder::new("a").base_priority(10.0).build().unwrap(), Box::new(a)).unwrap();
        gateway.register(ProviderDescriptorBuilder::new("b").base_priority(1.0).build().unwrap(), Box::new(b)).unwrap();

        let mut options = ExecuteOptions::default();
        options.strategy = Some(Strategy::Priority);
        options.preserve_context = true;
        options.context = json!({"question": "what is the capital of France"});
        let outcome = gateway.execute("hello", options).await.unwrap();
        assert_eq!(outcome.provider.as_ref(), "b");

        let contexts = b_contexts.lock().unwrap();
        let seen = contexts.first().expect("b should have been called once");
        assert_eq!(seen["previousProvider"], json!("a"));
        assert_eq!(seen["switchReason"], json!("server_error"));
        assert_eq!(seen["payload"]["question"], json!("what is the capital of France"));
    }

    #[tokio::test]
    async fn contract_violation_on_pending_sentinel_is_fatal() {
        let gateway = gateway_with(3);
        let adapter = ScriptedAdapter::new(vec![Ok(json!({"content": "__pending__"}))]);
        gateway.register(ProviderDescriptorBuilder::new("alpha").build().unwrap(), Box::new(adapter)).unwrap();

        let err = gateway.execute("hello", ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ContractViolation(_)));
    }

    #[tokio::test]
    async fn no_eligible_provider_when_registry_is_empty() {
        let gateway = gateway_with(3);
        let err = gateway.execute("hello", ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoEligibleProvider));
    }

    #[tokio::test]
    async fn unregister_then_execute_reports_no_eligible_provider() {
        let gateway = gateway_with(3);
        let adapter = ScriptedAdapter::new(vec![Ok(json!({"content": "hi"}))]);
        gateway.register(ProviderDescriptorBuilder::new("alpha").build().unwrap(), Box::new(adapter)).unwrap();
        gateway.unregister("alpha").unwrap();

        let err = gateway.execute("hello", ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoEligibleProvider));
    }
}
