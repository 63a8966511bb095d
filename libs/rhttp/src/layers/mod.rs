//! Tower layers of the resilience chain
//!
//! Composed outer to inner as:
//!
//! - [`ObservabilityLayer`] - One span and bounded metrics per operation
//! - [`RetryLayer`] - Attempt loop with backoff, `Retry-After` and time budget
//! - [`BreakerLayer`] - Per-host circuit breaker
//!
//! Each layer is usable on its own over any
//! `Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>`.

mod breaker;
mod observability;
mod retry;

pub use breaker::{BreakerLayer, BreakerService};
pub(crate) use observability::breaker_transition_hook;
pub use observability::{
    ATTEMPTS_TOTAL, BREAKER_TRANSITIONS_TOTAL, ObservabilityLayer, ObservabilityService,
    REQUEST_ATTEMPTS, REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, method_label,
};
pub use retry::{RETRY_ATTEMPT_HEADER, RetryLayer, RetryService};
