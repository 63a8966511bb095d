#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Resilience layer for outbound HTTP
//!
//! Wraps a base transport (any `tower::Service` over `http` types) in a
//! fixed chain of layers, outer to inner:
//!
//! 1. **Observability** - one `outgoing_http` span per logical request,
//!    per-attempt events and bounded-cardinality metrics
//! 2. **Retry** - attempt loop with reason codes, exponential backoff with
//!    jitter, `Retry-After` as a floor and a total time budget
//! 3. **Breaker** - per-host circuit breaker with half-open trial requests
//! 4. **Base** - the actual I/O ([`HyperTransport`] by default)
//!
//! Every layer is optional; a disabled layer is absent from the stack.
//! The caller's [`CallContext`] (cancellation and deadline) travels in the
//! request extensions and is honored by every layer, including backoff waits.
//!
//! Non-2xx statuses are not errors: the chain returns `Ok(response)` and
//! the caller owns the response body.
//!
//! # Example
//!
//! ```ignore
//! use rhttp::{CallContext, RequestBody, RequestExt, ResilientTransport, TransportConfig};
//! use std::time::Duration;
//!
//! let transport = ResilientTransport::with_default_base(TransportConfig::all_defaults())?;
//!
//! let request = http::Request::get("https://api.example.com/items")
//!     .body(RequestBody::empty())?
//!     .with_context(CallContext::new().with_timeout(Duration::from_secs(5)));
//!
//! let response = transport.send(request).await?;
//! ```
//!
//! # Features
//!
//! - `otel` - W3C trace-context propagation and OpenTelemetry span
//!   attributes via `tracing-opentelemetry`

mod attempt;
pub mod breaker;
mod builder;
mod config;
mod context;
mod error;
mod layers;
pub mod otel;
mod request;
mod response;
mod transport;

#[cfg(test)]
mod testing;

pub use attempt::{AttemptRecord, Outcome, RetryDecision, RetryReason};
pub use breaker::{BreakerCounts, BreakerRegistry, CircuitState, Permit};
pub use builder::{BoxedTransport, LayerKind, ResilientTransport, TransportBuilder};
pub use config::{
    AttributeHook, BackoffPolicy, BreakerConfig, DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT,
    ExponentialBackoff, FailurePredicate, KeyFn, MethodPredicate, ObservabilityConfig,
    RetryAfterConfig, RetryClassifier, RetryConfig, StateChangeHook, StatusPredicate,
    TransportConfig, TransportSecurity, TripPredicate, is_host_failure, is_idempotent_method,
    is_server_error, is_server_error_or_throttled,
};
pub use context::{CallContext, RequestExt};
pub use error::{BoxError, ConfigError, HttpError};
pub use layers::{
    ATTEMPTS_TOTAL, BREAKER_TRANSITIONS_TOTAL, BreakerLayer, BreakerService, ObservabilityLayer,
    ObservabilityService, REQUEST_ATTEMPTS, REQUEST_DURATION_SECONDS, REQUESTS_TOTAL,
    RETRY_ATTEMPT_HEADER, RetryLayer, RetryService, method_label,
};
pub use request::{BodyFactory, RequestBody, destination_host};
pub use response::{ResponseBody, StatusClass, parse_retry_after};
pub use transport::{HyperTransport, HyperTransportConfig};
