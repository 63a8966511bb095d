use crate::attempt::{AttemptRecord, AttemptSink, Outcome, RetryReason};
use crate::breaker::CircuitState;
use crate::config::{ObservabilityConfig, StateChangeHook};
use crate::context::CallContext;
use crate::error::HttpError;
use crate::request::{RequestBody, destination_host};
use crate::response::{ResponseBody, StatusClass};
use http::{Method, Request, Response};
use metrics::Label;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{Instrument, Span};

pub const REQUESTS_TOTAL: &str = "rhttp_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "rhttp_request_duration_seconds";
pub const REQUEST_ATTEMPTS: &str = "rhttp_request_attempts";
pub const ATTEMPTS_TOTAL: &str = "rhttp_attempts_total";
pub const BREAKER_TRANSITIONS_TOTAL: &str = "rhttp_breaker_transitions_total";

/// Bounded `method` label: standard methods by name, anything else `_OTHER`.
#[must_use]
pub fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::HEAD => "HEAD",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::CONNECT => "CONNECT",
        Method::OPTIONS => "OPTIONS",
        Method::TRACE => "TRACE",
        Method::PATCH => "PATCH",
        _ => "_OTHER",
    }
}

/// Tower layer wrapping a whole operation in one `outgoing_http` span and
/// emitting per-operation and per-attempt metrics
///
/// Span fields:
/// - `http.method`: normalised method
/// - `server.address`: destination authority (never the path or query)
/// - `otel.kind`: "client"
/// - `http.status_code`, `rhttp.attempts`, `rhttp.outcome`, `error`: recorded on completion
///
/// Each attempt reported by an inner retry layer becomes one `info` event
/// inside the span. Metric updates go through the `metrics` facade.
#[derive(Clone, Debug)]
pub struct ObservabilityLayer {
    config: Arc<ObservabilityConfig>,
}

impl ObservabilityLayer {
    #[must_use]
    pub fn new(config: ObservabilityConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new(ObservabilityConfig::default())
    }
}

impl<S> Layer<S> for ObservabilityLayer {
    type Service = ObservabilityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ObservabilityService {
            inner,
            config: Arc::clone(&self.config),
        }
    }
}

/// Service instrumenting one operation. Never fails a request on its own:
/// a panicking hook or metrics recorder is logged and ignored.
#[derive(Clone, Debug)]
pub struct ObservabilityService<S> {
    inner: S,
    config: Arc<ObservabilityConfig>,
}

impl<S> Service<Request<RequestBody>> for ObservabilityService<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<RequestBody>) -> Self::Future {
        let method = method_label(req.method());
        let host = destination_host(req.uri());

        let span = tracing::info_span!(
            "outgoing_http",
            http.method = method,
            server.address = %host,
            otel.kind = "client",
            http.status_code = tracing::field::Empty,
            rhttp.attempts = tracing::field::Empty,
            rhttp.outcome = tracing::field::Empty,
            rhttp.attributes = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        let extra = self
            .config
            .attribute_hook
            .as_ref()
            .and_then(|hook| guarded("attribute hook", || hook(&req)))
            .unwrap_or_default();
        crate::otel::set_span_attributes(&span, &extra);

        if self.config.propagate_context {
            crate::otel::inject_span_context(&span, req.headers_mut());
        }

        let op = Arc::new(Operation {
            span: span.clone(),
            method,
            host,
            extra_labels: if self.config.hook_attributes_as_labels {
                extra.into_iter().map(|(k, v)| Label::new(k, v)).collect()
            } else {
                Vec::new()
            },
            metrics: self.config.metrics,
            attempt_events: self.config.attempt_events,
            attempts: AtomicU32::new(0),
        });

        let sink_op = Arc::clone(&op);
        req.extensions_mut().insert(AttemptSink::new(move |record| {
            sink_op.attempts.fetch_add(1, Ordering::Relaxed);
            guarded("attempt instrumentation", || sink_op.on_attempt(record));
        }));

        let ctx = req
            .extensions()
            .get::<CallContext>()
            .cloned()
            .unwrap_or_default();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let start = Instant::now();
            let result = ctx.run(inner.call(req)).instrument(span).await;
            let elapsed = start.elapsed();

            guarded("operation instrumentation", || {
                op.finish(result.as_ref(), start, elapsed);
            });
            result
        })
    }
}

/// State-change hook counting breaker transitions, chained before `user_hook`.
pub(crate) fn breaker_transition_hook(user_hook: Option<StateChangeHook>) -> StateChangeHook {
    Arc::new(move |key: &str, from: CircuitState, to: CircuitState| {
        guarded("breaker transition metric", || {
            metrics::counter!(
                BREAKER_TRANSITIONS_TOTAL,
                "host" => key.to_owned(),
                "from" => from.as_str(),
                "to" => to.as_str()
            )
            .increment(1);
        });
        if let Some(hook) = &user_hook {
            hook(key, from, to);
        }
    })
}

/// Run instrumentation code, swallowing panics.
fn guarded<T>(what: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(what, "Instrumentation panicked; ignoring");
            None
        }
    }
}

/// Per-operation instrumentation state shared with the attempt sink.
struct Operation {
    span: Span,
    method: &'static str,
    host: String,
    extra_labels: Vec<Label>,
    metrics: bool,
    attempt_events: bool,
    attempts: AtomicU32,
}

impl Operation {
    fn labels(&self, rest: [(&'static str, &'static str); 2]) -> Vec<Label> {
        let mut labels = Vec::with_capacity(4 + self.extra_labels.len());
        labels.push(Label::new("method", self.method));
        labels.push(Label::new("host", self.host.clone()));
        labels.extend(rest.into_iter().map(|(k, v)| Label::new(k, v)));
        labels.extend(self.extra_labels.iter().cloned());
        labels
    }

    fn on_attempt(&self, record: &AttemptRecord) {
        if self.attempt_events {
            tracing::info!(
                parent: &self.span,
                attempt = record.attempt,
                wait_ms = record.wait.as_millis(),
                elapsed_ms = record.elapsed.as_millis(),
                reason = record.reason.as_str(),
                status = record.status.map(|s| s.as_u16()),
                outcome = record.outcome.as_str(),
                retried = record.retried,
                "HTTP attempt"
            );
        }
        if self.metrics {
            metrics::counter!(
                ATTEMPTS_TOTAL,
                self.labels([
                    ("status_class", record.status_class().as_str()),
                    ("reason", record.reason.as_str()),
                ])
            )
            .increment(1);
        }
    }

    fn finish(
        &self,
        result: Result<&Response<ResponseBody>, &HttpError>,
        start: Instant,
        elapsed: Duration,
    ) {
        // Without a retry layer underneath nobody reports attempts
        if self.attempts.load(Ordering::Relaxed) == 0 {
            self.attempts.store(1, Ordering::Relaxed);
            self.on_attempt(&AttemptRecord {
                attempt: 1,
                started_at: start,
                wait: Duration::ZERO,
                elapsed,
                outcome: Outcome::of(result),
                status: result.ok().map(Response::status),
                reason: match result {
                    Ok(_) => RetryReason::Success,
                    Err(e) => RetryReason::for_error(e),
                },
                retried: false,
            });
        }

        let attempts = self.attempts.load(Ordering::Relaxed);
        let outcome = Outcome::of(result);
        let status = result.ok().map(Response::status);
        let status_class = StatusClass::from_status(status);

        self.span.record("rhttp.attempts", attempts);
        self.span.record("rhttp.outcome", outcome.as_str());
        match result {
            Ok(response) => {
                self.span
                    .record("http.status_code", response.status().as_u16());
                if response.status().is_client_error() || response.status().is_server_error() {
                    self.span.record("error", true);
                }
            }
            Err(e) => {
                self.span.record("error", tracing::field::display(e));
            }
        }

        if !self.metrics {
            return;
        }
        let labels = self.labels([
            ("status_class", status_class.as_str()),
            ("outcome", outcome.as_str()),
        ]);
        metrics::counter!(REQUESTS_TOTAL, labels.clone()).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, labels).record(elapsed.as_secs_f64());

        let mut attempt_labels = vec![
            Label::new("method", self.method),
            Label::new("host", self.host.clone()),
        ];
        attempt_labels.extend(self.extra_labels.iter().cloned());
        metrics::histogram!(REQUEST_ATTEMPTS, attempt_labels).record(f64::from(attempts));
    }
}
