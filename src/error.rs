//! Classification vocabulary and the gateway's own aggregate error type.

use std::collections::HashMap;

/// Closed set of upstream failure categories (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    Authentication,
    Connection,
    ServerError,
    ClientError,
    Quota,
    CircuitOpen,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// An upstream error after classification.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub message: String,
}

/// Composite failure returned once every candidate provider has been exhausted.
#[derive(Debug, Clone)]
pub struct ExhaustionSummary {
    pub attempt_count: u32,
    pub per_provider_attempts: HashMap<String, u32>,
    pub last_kind: ErrorKind,
    pub last_severity: Severity,
    pub last_message: String,
    pub remediation: &'static str,
}

/// Errors the gateway itself raises: contract violations are fatal for the call,
/// exhaustion is the terminal outcome of a normal fallback chain.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider already registered: {0}")]
    ProviderAlreadyRegistered(String),
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("invalid priority: {0}")]
    InvalidPriority(String),
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("all providers exhausted after {} attempts: {}", .0.attempt_count, .0.last_message)]
    AllProvidersExhausted(ExhaustionSummary),
    #[error("no eligible provider for this request")]
    NoEligibleProvider,
    #[error("request queue is full")]
    QueueFull,
}

impl GatewayError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            GatewayError::UnknownProvider(_)
                | GatewayError::UnknownStrategy(_)
                | GatewayError::InvalidPriority(_)
                | GatewayError::ContractViolation(_)
                | GatewayError::ProviderAlreadyRegistered(_)
        )
    }

    pub fn is_exhaustion(&self) -> bool {
        matches!(self, GatewayError::AllProvidersExhausted(_))
    }
}

/// Picks a short, caller-actionable remediation label for an exhaustion summary.
pub fn remediation_for(last: Option<&ClassifiedError>) -> &'static str {
    match last {
        Some(e) if e.severity == Severity::Critical => "immediate_fallback",
        Some(e) if e.kind == ErrorKind::RateLimit => "backoff_and_retry",
        Some(e) if e.kind == ErrorKind::CircuitOpen => "skip_provider",
        Some(_) => "backoff_and_retry",
        None => "skip_provider",
    }
}
