use crate::context::CallContext;
use crate::error::{BoxError, HttpError};
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::BodyExt;
use std::time::{Duration, SystemTime};

/// Type-erased response body handed back by every layer.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Parse `Retry-After` header value into a `Duration`.
///
/// Supports two formats per RFC 7231:
/// - Seconds: "120" -> 120 seconds
/// - HTTP-date (RFC 1123): "Wed, 21 Oct 2015 07:28:00 GMT" -> duration until that time
///
/// Returns `None` if:
/// - Header is missing
/// - Value cannot be parsed as integer or HTTP-date
/// - Parsed duration is negative (time already passed or negative seconds)
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after_value(value)
}

fn parse_retry_after_value(value: &str) -> Option<Duration> {
    let trimmed = value.trim();

    // Seconds form is by far the most common
    if let Ok(seconds) = trimmed.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds.cast_unsigned()));
    }

    parse_http_date(trimmed)
}

/// Parse HTTP-date (RFC 1123) and return duration until that time.
/// Returns `None` if the date is in the past or cannot be parsed.
fn parse_http_date(value: &str) -> Option<Duration> {
    let parsed = httpdate::parse_http_date(value).ok()?;
    parsed.duration_since(SystemTime::now()).ok()
}

/// Release a response that will not be handed to the caller.
///
/// Drains up to `drain_limit` bytes so that HTTP/1.1 connections can go
/// back to the pool, then drops the body. With `drain_limit == 0` the
/// body is dropped immediately. Draining races against `ctx`; a canceled
/// context drops the body mid-drain.
///
/// Bodies whose `Content-Length` already exceeds the limit are dropped
/// without draining.
pub(crate) async fn release_response(
    response: Response<ResponseBody>,
    drain_limit: usize,
    ctx: &CallContext,
) {
    let should_drain = drain_limit > 0
        && response
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .is_none_or(|len| len <= drain_limit as u64);

    if !should_drain {
        tracing::trace!(drain_limit, "Dropping response body without drain");
        return;
    }

    let body = response.into_body();
    if let Err(e) = ctx.run(drain_body(body, drain_limit)).await {
        tracing::debug!(
            error = %e,
            "Failed to drain response body; connection may not be reused"
        );
    }
}

async fn drain_body(body: ResponseBody, limit: usize) -> Result<(), HttpError> {
    let mut body = std::pin::pin!(body);
    let mut drained = 0usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            drained += chunk.len();
            if drained >= limit {
                break;
            }
        }
    }

    Ok(())
}

/// Bounded status class label: `2xx`, `3xx`, `4xx`, `5xx` or `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Success,
    Redirection,
    ClientError,
    ServerError,
    /// No response, or an informational/non-standard status
    None,
}

impl StatusClass {
    #[must_use]
    pub fn from_status(status: Option<StatusCode>) -> Self {
        match status.map(|s| s.as_u16()) {
            Some(200..=299) => Self::Success,
            Some(300..=399) => Self::Redirection,
            Some(400..=499) => Self::ClientError,
            Some(500..=599) => Self::ServerError,
            _ => Self::None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "2xx",
            Self::Redirection => "3xx",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
            Self::None => "none",
        }
    }
}
