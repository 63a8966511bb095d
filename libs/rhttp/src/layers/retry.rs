use crate::attempt::{AttemptRecord, AttemptSink, Outcome, RetryDecision, RetryReason};
use crate::config::RetryConfig;
use crate::context::CallContext;
use crate::error::HttpError;
use crate::request::{RequestBody, destination_host};
use crate::response::{ResponseBody, parse_retry_after, release_response};
use http::header::HeaderName;
use http::{HeaderValue, Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};

/// Header carrying the retry number (1 for the first retry).
/// Added to retried requests only.
pub const RETRY_ATTEMPT_HEADER: HeaderName = HeaderName::from_static("x-retry-attempt");

/// Tower layer that retries failed attempts with backoff.
#[derive(Clone, Debug)]
pub struct RetryLayer {
    config: Arc<RetryConfig>,
}

impl RetryLayer {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            config: Arc::clone(&self.config),
        }
    }
}

/// Service running the attempt loop of one operation.
///
/// Each attempt gets its own copy of the request; the caller's request is
/// never sent twice. HTTP error statuses come back as `Ok(Response)` once
/// retrying stops, and an exhausted operation returns the last attempt's
/// real error, never a wrapper.
///
/// Before every send the loop checks the caller's [`CallContext`]; backoff
/// waits race against its cancellation token.
#[derive(Clone, Debug)]
pub struct RetryService<S> {
    inner: S,
    config: Arc<RetryConfig>,
}

impl<S> Service<Request<RequestBody>> for RetryService<S>
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

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        // Swap so we consume the instance that was poll_ready'd,
        // leaving a fresh clone for the next poll_ready cycle.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let config = Arc::clone(&self.config);

        Box::pin(run_attempts(inner, config, req))
    }
}

async fn run_attempts<S>(
    inner: S,
    config: Arc<RetryConfig>,
    req: Request<RequestBody>,
) -> Result<Response<ResponseBody>, HttpError>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send,
    S::Future: Send,
{
    let (parts, body) = req.into_parts();
    let ctx = parts
        .extensions
        .get::<CallContext>()
        .cloned()
        .unwrap_or_default();
    let sink = parts.extensions.get::<AttemptSink>().cloned();
    let host = destination_host(&parts.uri);

    let replayable = body.is_replayable();
    let mut body = Some(body);

    let op_start = Instant::now();
    let budget_end = config.elapsed_budget().map(|budget| op_start + budget);

    let mut attempt: u32 = 0;
    let mut wait = Duration::ZERO;
    // Outcome of the previous attempt, held across the backoff wait
    let mut previous: Option<Result<Response<ResponseBody>, HttpError>> = None;
    loop {
        if let Some(err) = ctx.error() {
            return Err(err);
        }
        if let Some(last) = previous.take() {
            // Timer granularity can wake us past the budget; never send after it
            if budget_end.is_some_and(|end| Instant::now() >= end) {
                tracing::debug!(
                    attempt,
                    method = %parts.method,
                    host = %host,
                    "Elapsed budget spent during backoff; returning last outcome"
                );
                return last;
            }
            if let Ok(resp) = last {
                release_response(resp, config.drain_limit, &ctx).await;
            }
        }
        attempt += 1;

        let attempt_body = if replayable {
            body.as_ref().and_then(RequestBody::try_clone)
        } else {
            body.take()
        };
        let mut attempt_req = Request::from_parts(parts.clone(), attempt_body.unwrap_or_default());
        if attempt > 1 {
            attempt_req
                .headers_mut()
                .insert(RETRY_ATTEMPT_HEADER, HeaderValue::from(attempt - 1));
        }

        let started_at = Instant::now();
        let result = ctx
            .run(send_once(
                inner.clone(),
                attempt_req,
                config.attempt_timeout,
            ))
            .await;
        let elapsed = started_at.elapsed();

        let mut decision = classify(&config, &parts, result.as_ref());
        if decision.retry && !replayable {
            decision = RetryDecision::stop(RetryReason::BodyNotReplayable);
        }
        if decision.retry && attempt >= config.max_attempts {
            decision = RetryDecision::stop(RetryReason::MaxAttempts);
        }

        let mut next_wait = Duration::ZERO;
        if decision.retry {
            next_wait = config.backoff.delay(attempt);
            if let Ok(resp) = &result
                && config.retry_after.applies_to(resp.status())
                && let Some(retry_after) = parse_retry_after(resp.headers())
            {
                next_wait = next_wait.max(retry_after);
            }

            // A wait that eats the whole remaining budget leaves no room for another attempt
            if let Some(end) = budget_end
                && next_wait >= end.saturating_duration_since(Instant::now())
            {
                decision = RetryDecision::stop(RetryReason::MaxAttempts);
            } else if let Some(remaining) = ctx.remaining()
                && next_wait >= remaining
            {
                decision = RetryDecision::stop(RetryReason::CtxDone);
            }
        }

        let status = result.as_ref().ok().map(Response::status);
        if let Some(sink) = &sink {
            sink.record(&AttemptRecord {
                attempt,
                started_at,
                wait,
                elapsed,
                outcome: Outcome::of(result.as_ref()),
                status,
                reason: decision.reason,
                retried: decision.retry,
            });
        }

        if !decision.retry {
            tracing::debug!(
                attempt,
                reason = decision.reason.as_str(),
                status = status.map(|s| s.as_u16()),
                method = %parts.method,
                host = %host,
                "Retry loop finished"
            );
            return result;
        }

        tracing::debug!(
            attempt,
            max_attempts = config.max_attempts,
            reason = decision.reason.as_str(),
            status = status.map(|s| s.as_u16()),
            error = result.as_ref().err().map(tracing::field::display),
            method = %parts.method,
            host = %host,
            wait_ms = next_wait.as_millis(),
            "Retrying request"
        );

        ctx.sleep(next_wait).await?;
        wait = next_wait;
        previous = Some(result);
    }
}

async fn send_once<S>(
    mut svc: S,
    req: Request<RequestBody>,
    attempt_timeout: Option<Duration>,
) -> Result<Response<ResponseBody>, HttpError>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>,
{
    svc.ready().await?;
    let fut = svc.call(req);
    match attempt_timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| HttpError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Classify one attempt result.
///
/// Caller-context errors and the circuit-open sentinel always stop the
/// loop, whatever the configured classifier says.
fn classify(
    config: &RetryConfig,
    parts: &http::request::Parts,
    result: Result<&Response<ResponseBody>, &HttpError>,
) -> RetryDecision {
    match result {
        Err(e) if e.is_context_error() => return RetryDecision::stop(RetryReason::CtxDone),
        Err(HttpError::CircuitOpen { .. }) => return RetryDecision::stop(RetryReason::CbOpen),
        _ => {}
    }

    if let Some(classifier) = &config.classifier {
        return classifier(parts, result);
    }

    let decision = match result {
        Ok(resp) if (config.retryable_status)(resp.status()) => {
            RetryDecision::retry(RetryReason::for_status(resp.status()))
        }
        Ok(_) => RetryDecision::stop(RetryReason::Success),
        Err(HttpError::Transport(_)) => RetryDecision::retry(RetryReason::NetError),
        Err(HttpError::Timeout(_)) => RetryDecision::retry(RetryReason::Timeout),
        Err(e) => RetryDecision::stop(RetryReason::for_error(e)),
    };

    if decision.retry && !(config.retryable_method)(&parts.method) {
        return RetryDecision::stop(decision.reason);
    }
    decision
}
