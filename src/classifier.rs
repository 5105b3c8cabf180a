//! Maps a raw upstream error to `{kind, severity, retryable}` (§4.A).
//!
//! Shaped after `tower_resilience_circuitbreaker::classifier::FailureClassifier`:
//! a trait plus a default implementation plus a closure-backed escape hatch.

use std::error::Error as StdError;
use std::fmt;

use crate::error::{ClassifiedError, ErrorKind, Severity};

/// The error an upstream provider adapter reports back to the engine.
pub struct RawUpstreamError {
    pub message: String,
    pub status: Option<u16>,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl RawUpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None, source: None }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Debug for RawUpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawUpstreamError")
            .field("message", &self.message)
            .field("status", &self.status)
            .finish()
    }
}

impl fmt::Display for RawUpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for RawUpstreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

/// Classifies a raw upstream error into the canonical kind/severity/retryable triple.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &RawUpstreamError) -> ClassifiedError;
}

/// The classifier described in §4.A, with severities matching the spec's
/// listed examples (authentication/forbidden/suspended/permanent-quota →
/// critical; rate_limit/service_unavailable/bad_gateway → high;
/// timeout/connection-reset → low; everything else medium).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, error: &RawUpstreamError) -> ClassifiedError {
        let lower = error.message.to_lowercase();
        let kind = classify_kind(error.status, &lower);
        let severity = classify_severity(kind, &lower);
        let retryable = matches!(
            kind,
            ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Connection | ErrorKind::ServerError | ErrorKind::Unknown
        ) && severity != Severity::Critical;
        ClassifiedError { kind, severity, retryable, message: error.message.clone() }
    }
}

fn classify_kind(status: Option<u16>, lower: &str) -> ErrorKind {
    if let Some(status) = status {
        match status {
            401 | 403 => return ErrorKind::Authentication,
            408 => return ErrorKind::Timeout,
            429 => return ErrorKind::RateLimit,
            400 | 404 | 422 => return ErrorKind::ClientError,
            500..=599 => return ErrorKind::ServerError,
            _ => {}
        }
    }
    classify_kind_from_message(lower)
}

fn classify_kind_from_message(lower: &str) -> ErrorKind {
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorKind::RateLimit
    } else if lower.contains("authentication") || lower.contains("unauthorized") || lower.contains("forbidden") || lower.contains("invalid api key") {
        ErrorKind::Authentication
    } else if lower.contains("quota") || lower.contains("suspended") {
        ErrorKind::Quota
    } else if lower.contains("circuit") && lower.contains("open") {
        ErrorKind::CircuitOpen
    } else if lower.contains("connection") || lower.contains("reset") || lower.contains("refused") || lower.contains("econnreset") {
        ErrorKind::Connection
    } else if lower.contains("bad gateway") || lower.contains("service unavailable") || lower.contains("internal server") {
        ErrorKind::ServerError
    } else if lower.contains("bad request") || lower.contains("not found") || lower.contains("invalid") {
        ErrorKind::ClientError
    } else {
        ErrorKind::Unknown
    }
}

fn classify_severity(kind: ErrorKind, lower: &str) -> Severity {
    match kind {
        ErrorKind::Authentication => Severity::Critical,
        ErrorKind::Quota if lower.contains("suspend") || lower.contains("permanent") => Severity::Critical,
        ErrorKind::ClientError if lower.contains("forbidden") => Severity::Critical,
        ErrorKind::RateLimit => Severity::High,
        ErrorKind::ServerError if lower.contains("unavailable") || lower.contains("bad gateway") => Severity::High,
        ErrorKind::Timeout | ErrorKind::Connection => Severity::Low,
        _ => Severity::Medium,
    }
}

/// Wraps a closure as a `FailureClassifier`, for callers with a custom upstream
/// error taxonomy.
pub struct FnClassifier<F>(pub F);

impl<F> FailureClassifier for FnClassifier<F>
where
    F: Fn(&RawUpstreamError) -> ClassifiedError + Send + Sync,
{
    fn classify(&self, error: &RawUpstreamError) -> ClassifiedError {
        (self.0)(error)
    }
}
