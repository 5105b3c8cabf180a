//! Observability events and the listener registry that dispatches them.
//!
//! The dispatch machinery (`EventListener`, `EventListeners`, `FnListener`) mirrors
//! `tower_resilience_core::events`: listeners are boxed trait objects, `emit` never
//! lets one listener's panic take down a caller's request, and closures can register
//! via `FnListener` without implementing the trait by hand.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::circuit::CircuitState;
use crate::error::{ErrorKind, Severity};

/// A listener invoked for every event of type `E`.
pub trait EventListener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

pub type BoxedEventListener<E> = Arc<dyn EventListener<E>>;

/// A registry of listeners for one event type. Cheaply `Clone`, so it can be
/// shared across every per-provider component via `Arc`.
pub struct EventListeners<E> {
    listeners: Vec<BoxedEventListener<E>>,
}

impl<E> EventListeners<E> {
    pub fn new() -> Self {
        Self { listeners: Vec::new() }
    }

    pub fn add(&mut self, listener: impl EventListener<E> + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Dispatches `event` to every registered listener. A listener panic is
    /// caught and logged/counted (when the relevant feature is on) rather than
    /// propagated — a broken listener must never take down a request.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let listener = Arc::clone(listener);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if result.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!("gateway event listener panicked");
                #[cfg(feature = "metrics")]
                metrics::counter!("gateway_listener_panics_total").increment(1);
            }
        }
    }
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self { listeners: self.listeners.clone() }
    }
}

/// Adapts a plain closure into an `EventListener`.
pub struct FnListener<F> {
    f: F,
}

impl<F> FnListener<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<E, F> EventListener<E> for FnListener<F>
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}

/// One gateway event, timestamped at emission.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub at: Instant,
    pub kind: GatewayEventKind,
}

impl GatewayEvent {
    pub fn new(kind: GatewayEventKind) -> Self {
        Self { at: Instant::now(), kind }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// The closed event set from the external-interfaces contract.
#[derive(Debug, Clone)]
pub enum GatewayEventKind {
    ProviderRegistered { provider: Arc<str> },
    ProviderUnregistered { provider: Arc<str> },
    ProviderSelected { provider: Arc<str>, strategy: &'static str },
    OperationSuccess { provider: Arc<str>, attempt: u32, duration: Duration },
    OperationFailure { provider: Arc<str>, attempt: u32, kind: ErrorKind, severity: Severity },
    AllProvidersFailed { attempt_count: u32, last_kind: ErrorKind },
    HealthCheckPassed { provider: Arc<str> },
    HealthCheckFailed { provider: Arc<str>, consecutive_failures: u32 },
    CircuitBreakerStateChanged { provider: Arc<str>, from: CircuitState, to: CircuitState },
    StrategyChanged { from: &'static str, to: &'static str },
}

impl GatewayEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            GatewayEventKind::ProviderRegistered { .. } => "providerRegistered",
            GatewayEventKind::ProviderUnregistered { .. } => "providerUnregistered",
            GatewayEventKind::ProviderSelected { .. } => "providerSelected",
            GatewayEventKind::OperationSuccess { .. } => "operationSuccess",
            GatewayEventKind::OperationFailure { .. } => "operationFailure",
            GatewayEventKind::AllProvidersFailed { .. } => "allProvidersFailed",
            GatewayEventKind::HealthCheckPassed { .. } => "healthCheckPassed",
            GatewayEventKind::HealthCheckFailed { .. } => "healthCheckFailed",
            GatewayEventKind::CircuitBreakerStateChanged { .. } => "circuitBreakerStateChanged",
            GatewayEventKind::StrategyChanged { .. } => "strategyChanged",
        }
    }
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_all_listeners() {
        let mut listeners: EventListeners<GatewayEvent> = EventListeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&count);
        listeners.add(FnListener::new(move |_: &GatewayEvent| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = Arc::clone(&count);
        listeners.add(FnListener::new(move |_: &GatewayEvent| {
            c2.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.emit(&GatewayEvent::new(GatewayEventKind::ProviderRegistered {
            provider: Arc::from("alpha"),
        }));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let mut listeners: EventListeners<GatewayEvent> = EventListeners::new();
        listeners.add(FnListener::new(|_: &GatewayEvent| panic!("boom")));
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&count);
        listeners.add(FnListener::new(move |_: &GatewayEvent| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.emit(&GatewayEvent::new(GatewayEventKind::ProviderUnregistered {
            provider: Arc::from("alpha"),
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
