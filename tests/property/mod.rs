mod backoff;
mod circuit_breaker;
mod metrics;
mod normalizer;
