use crate::attempt::RetryDecision;
use crate::breaker::{BreakerCounts, CircuitState};
use crate::error::{ConfigError, HttpError};
use crate::request::{RequestBody, destination_host};
use crate::response::ResponseBody;
use http::{Request, Response, StatusCode};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate over the request method: may this method be retried?
pub type MethodPredicate = Arc<dyn Fn(&http::Method) -> bool + Send + Sync>;

/// Predicate over a response status: is this status retryable?
pub type StatusPredicate = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;

/// Full override of the retry decision.
///
/// Receives the request head and the attempt result and returns the
/// decision. Safety floors (caller context, circuit-open sentinel,
/// non-replayable body, attempt and elapsed-time budgets) still apply on
/// top of the returned decision.
pub type RetryClassifier = Arc<
    dyn Fn(&http::request::Parts, Result<&Response<ResponseBody>, &HttpError>) -> RetryDecision
        + Send
        + Sync,
>;

/// Predicate over an attempt result: does it count as a host failure?
pub type FailurePredicate =
    Arc<dyn Fn(Result<&Response<ResponseBody>, &HttpError>) -> bool + Send + Sync>;

/// Breaker trip function, evaluated in the Closed state after each failure.
pub type TripPredicate = Arc<dyn Fn(&BreakerCounts) -> bool + Send + Sync>;

/// Derives the breaker key from a request.
pub type KeyFn = Arc<dyn Fn(&Request<RequestBody>) -> String + Send + Sync>;

/// Called on every breaker transition with `(key, from, to)`.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Extra span attributes derived from a request.
pub type AttributeHook =
    Arc<dyn Fn(&Request<RequestBody>) -> Vec<(&'static str, String)> + Send + Sync>;

/// Check if HTTP method is idempotent (safe to retry) per RFC 9110.
///
/// Idempotent methods: GET, HEAD, PUT, DELETE, OPTIONS, TRACE.
/// Non-idempotent methods: POST, PATCH.
#[must_use]
pub fn is_idempotent_method(method: &http::Method) -> bool {
    matches!(
        *method,
        http::Method::GET
            | http::Method::HEAD
            | http::Method::PUT
            | http::Method::DELETE
            | http::Method::OPTIONS
            | http::Method::TRACE
    )
}

/// Default retryable status predicate: any 5xx.
#[must_use]
pub fn is_server_error(status: StatusCode) -> bool {
    status.is_server_error()
}

/// Retryable status predicate that also retries 429 Too Many Requests.
#[must_use]
pub fn is_server_error_or_throttled(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Default breaker failure classification: transport error, attempt
/// timeout, or a 5xx response.
///
/// Caller-context errors never reach this predicate.
#[must_use]
pub fn is_host_failure(result: Result<&Response<ResponseBody>, &HttpError>) -> bool {
    match result {
        Ok(response) => response.status().is_server_error(),
        Err(HttpError::Transport(_) | HttpError::Timeout(_)) => true,
        Err(_) => false,
    }
}

/// Delay before a retry.
///
/// `retry` is 1 for the first retry (i.e. the wait before attempt 2).
pub trait BackoffPolicy: fmt::Debug + Send + Sync {
    fn delay(&self, retry: u32) -> Duration;

    /// Reject unusable parameters at construction time.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidBackoff`] when the policy cannot produce delays.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Exponential backoff configuration for retries
///
/// Computes delay as: `min(initial * multiplier^(retry-1) + jitter, max)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 100ms)
    pub initial: Duration,

    /// Maximum backoff duration (default: 10s)
    pub max: Duration,

    /// Backoff multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,

    /// Enable jitter to prevent thundering herd (default: true)
    ///
    /// When enabled, adds random delay of 0-25% to each backoff.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Create backoff with custom initial and max durations
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Create fast backoff for testing (1ms initial, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    /// Safely handles edge cases (NaN, infinity, negative values) to avoid panics.
    fn delay(&self, retry: u32) -> Duration {
        // Beyond one day a retry wait is meaningless
        const MAX_BACKOFF_SECS: f64 = 86400.0;

        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);

        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 0.0 {
            self.multiplier
        } else {
            1.0
        };

        let initial_secs = self.initial.as_secs_f64();
        let max_secs = self.max.as_secs_f64().min(MAX_BACKOFF_SECS);

        let base = initial_secs * multiplier.powi(exponent);
        let clamped = if base.is_finite() {
            base.min(max_secs).max(0.0)
        } else {
            max_secs
        };
        let duration = Duration::from_secs_f64(clamped);

        let duration = if self.jitter {
            let jitter_factor = rand::rng().random_range(0.0..=0.25);
            duration + duration.mul_f64(jitter_factor)
        } else {
            duration
        };

        duration.min(Duration::from_secs_f64(max_secs))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial > self.max {
            return Err(ConfigError::InvalidBackoff(format!(
                "initial {:?} exceeds max {:?}",
                self.initial, self.max
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(format!(
                "multiplier must be finite and >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// `Retry-After` handling.
///
/// When enabled, a retried 429 (and, if `on_503` is set, a retried 503)
/// waits at least as long as the server asked for.
#[derive(Debug, Clone, Copy)]
pub struct RetryAfterConfig {
    /// Honor `Retry-After` at all (default: true)
    pub enabled: bool,
    /// Also honor it on 503 responses (default: false)
    pub on_503: bool,
}

impl Default for RetryAfterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_503: false,
        }
    }
}

impl RetryAfterConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            on_503: false,
        }
    }

    /// Whether the header should be consulted for this status.
    #[must_use]
    pub fn applies_to(&self, status: StatusCode) -> bool {
        self.enabled
            && (status == StatusCode::TOO_MANY_REQUESTS
                || (self.on_503 && status == StatusCode::SERVICE_UNAVAILABLE))
    }
}

/// Default drain limit for response bodies before retry (64 KiB)
pub const DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT: usize = 64 * 1024;

/// Retry policy.
///
/// An attempt is retried only if every gate passes: the method is
/// retryable, the body is replayable, the caller's context is live, the
/// elapsed budget is not spent, and fewer than `max_attempts` attempts
/// were made.
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one (default: 3, must be >= 1)
    pub max_attempts: u32,

    /// Budget for the whole operation including waits (`ZERO` = unlimited).
    ///
    /// A retry whose wait would use up the remaining budget is not taken,
    /// and the last outcome is returned as is. No attempt starts once the
    /// budget has run out.
    pub max_elapsed: Duration,

    /// Backoff strategy
    pub backoff: Arc<dyn BackoffPolicy>,

    pub retry_after: RetryAfterConfig,

    /// Methods eligible for retry (default: [`is_idempotent_method`])
    pub retryable_method: MethodPredicate,

    /// Statuses that trigger a retry (default: [`is_server_error`])
    pub retryable_status: StatusPredicate,

    /// Optional full override of the classification
    pub classifier: Option<RetryClassifier>,

    /// Timeout applied to each inward call; surfaces as [`HttpError::Timeout`]
    pub attempt_timeout: Option<Duration>,

    /// Maximum bytes drained from a discarded response (0 = drop immediately)
    pub drain_limit: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_elapsed: Duration::ZERO,
            backoff: Arc::new(ExponentialBackoff::default()),
            retry_after: RetryAfterConfig::default(),
            retryable_method: Arc::new(is_idempotent_method),
            retryable_status: Arc::new(is_server_error),
            classifier: None,
            attempt_timeout: None,
            drain_limit: DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: RetryAfterConfig) -> Self {
        self.retry_after = retry_after;
        self
    }

    #[must_use]
    pub fn with_retryable_method(
        mut self,
        predicate: impl Fn(&http::Method) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable_method = Arc::new(predicate);
        self
    }

    #[must_use]
    pub fn with_retryable_status(
        mut self,
        predicate: impl Fn(StatusCode) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable_status = Arc::new(predicate);
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_drain_limit(mut self, limit: usize) -> Self {
        self.drain_limit = limit;
        self
    }

    /// Elapsed budget, `None` when unlimited.
    #[must_use]
    pub fn elapsed_budget(&self) -> Option<Duration> {
        (!self.max_elapsed.is_zero()).then_some(self.max_elapsed)
    }

    /// # Errors
    /// Returns [`ConfigError`] for a zero attempt limit or an unusable backoff.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(self.max_attempts));
        }
        if self.attempt_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidBackoff(
                "attempt_timeout must be non-zero".to_owned(),
            ));
        }
        self.backoff.validate()
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("max_elapsed", &self.max_elapsed)
            .field("backoff", &self.backoff)
            .field("retry_after", &self.retry_after)
            .field("classifier", &self.classifier.is_some())
            .field("attempt_timeout", &self.attempt_timeout)
            .field("drain_limit", &self.drain_limit)
            .finish_non_exhaustive()
    }
}

/// Per-host circuit breaker settings.
#[derive(Clone)]
pub struct BreakerConfig {
    /// How long a tripped breaker rejects traffic before admitting trials (default: 60s)
    pub open_timeout: Duration,

    /// Concurrent trials admitted in the half-open state (default: 1)
    pub half_open_max_requests: u32,

    /// Rolling window after which Closed-state counts are cleared
    /// (default: `None`, counts are only cleared by a success)
    pub interval: Option<Duration>,

    /// Trip function (default: 5 consecutive failures)
    pub trip: TripPredicate,

    /// Failure classification (default: [`is_host_failure`])
    pub is_failure: FailurePredicate,

    /// Key derivation (default: request authority)
    pub key: KeyFn,

    pub on_state_change: Option<StateChangeHook>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
            interval: None,
            trip: Arc::new(|counts: &BreakerCounts| counts.consecutive_failures >= 5),
            is_failure: Arc::new(is_host_failure),
            key: Arc::new(|req: &Request<RequestBody>| destination_host(req.uri())),
            on_state_change: None,
        }
    }
}

impl BreakerConfig {
    /// Trip once `n` consecutive failures are observed.
    #[must_use]
    pub fn trip_after_consecutive_failures(mut self, n: u32) -> Self {
        self.trip = Arc::new(move |counts: &BreakerCounts| counts.consecutive_failures >= n);
        self
    }

    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_half_open_max_requests(mut self, max: u32) -> Self {
        self.half_open_max_requests = max;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_trip(
        mut self,
        trip: impl Fn(&BreakerCounts) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.trip = Arc::new(trip);
        self
    }

    #[must_use]
    pub fn with_failure_predicate(mut self, predicate: FailurePredicate) -> Self {
        self.is_failure = predicate;
        self
    }

    #[must_use]
    pub fn with_key(
        mut self,
        key: impl Fn(&Request<RequestBody>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key = Arc::new(key);
        self
    }

    #[must_use]
    pub fn with_state_change_hook(
        mut self,
        hook: impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    /// # Errors
    /// Returns [`ConfigError`] for a zero half-open limit or a zero open timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.half_open_max_requests == 0 {
            return Err(ConfigError::InvalidHalfOpenLimit(
                self.half_open_max_requests,
            ));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::ZeroOpenTimeout);
        }
        Ok(())
    }
}

impl fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("open_timeout", &self.open_timeout)
            .field("half_open_max_requests", &self.half_open_max_requests)
            .field("interval", &self.interval)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish_non_exhaustive()
    }
}

/// Instrumentation toggles.
#[derive(Clone)]
pub struct ObservabilityConfig {
    /// Emit counters/histograms through the `metrics` facade (default: true)
    pub metrics: bool,

    /// Emit one span event per attempt (default: true)
    pub attempt_events: bool,

    /// Inject W3C trace context into outgoing headers (default: true;
    /// effective only with the `otel` feature)
    pub propagate_context: bool,

    /// Extra span attributes derived from the request
    pub attribute_hook: Option<AttributeHook>,

    /// Also use hook attributes as metric labels (default: false).
    ///
    /// Only enable this for hooks that return a small, fixed set of values.
    pub hook_attributes_as_labels: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            attempt_events: true,
            propagate_context: true,
            attribute_hook: None,
            hook_attributes_as_labels: false,
        }
    }
}

impl ObservabilityConfig {
    #[must_use]
    pub fn without_metrics(mut self) -> Self {
        self.metrics = false;
        self
    }

    #[must_use]
    pub fn without_attempt_events(mut self) -> Self {
        self.attempt_events = false;
        self
    }

    #[must_use]
    pub fn without_context_propagation(mut self) -> Self {
        self.propagate_context = false;
        self
    }

    #[must_use]
    pub fn with_attribute_hook(
        mut self,
        hook: impl Fn(&Request<RequestBody>) -> Vec<(&'static str, String)> + Send + Sync + 'static,
    ) -> Self {
        self.attribute_hook = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_hook_attributes_as_labels(mut self) -> Self {
        self.hook_attributes_as_labels = true;
        self
    }
}

impl fmt::Debug for ObservabilityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservabilityConfig")
            .field("metrics", &self.metrics)
            .field("attempt_events", &self.attempt_events)
            .field("propagate_context", &self.propagate_context)
            .field("attribute_hook", &self.attribute_hook.is_some())
            .field("hook_attributes_as_labels", &self.hook_attributes_as_labels)
            .finish()
    }
}

/// Feature toggles for the chain; `None` leaves the layer out entirely.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub retry: Option<RetryConfig>,
    pub breaker: Option<BreakerConfig>,
    pub observability: Option<ObservabilityConfig>,
}

impl TransportConfig {
    /// Every layer enabled with default settings.
    #[must_use]
    pub fn all_defaults() -> Self {
        Self {
            retry: Some(RetryConfig::default()),
            breaker: Some(BreakerConfig::default()),
            observability: Some(ObservabilityConfig::default()),
        }
    }
}

/// Transport security mode for the default base transport
///
/// Controls whether plain-HTTP URLs are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportSecurity {
    /// Only `https://` URLs (default)
    #[default]
    TlsOnly,
    /// Accept `http://` as well; meant for tests against local mock servers
    AllowInsecureHttp,
}
