//! Attempt bookkeeping shared by the retry and observability layers.

use crate::error::HttpError;
use crate::response::{ResponseBody, StatusClass};
use http::{Response, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Why an attempt ended the way it did.
///
/// The string forms are a stable vocabulary used as a metric label and in
/// logs; they do not change between versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RetryReason {
    /// Transport-level failure
    NetError,
    /// Per-attempt timeout
    Timeout,
    /// Retryable 5xx status (or another retryable status outside 429/503)
    Http5xx,
    Http429,
    Http503,
    /// Retry wanted, but the request body cannot be sent again
    BodyNotReplayable,
    /// Caller canceled, or the caller's deadline was reached
    CtxDone,
    /// Attempt limit or elapsed-time budget exhausted
    MaxAttempts,
    /// The destination's circuit is open
    CbOpen,
    /// Completed with a non-retryable outcome
    Success,
}

impl RetryReason {
    pub const ALL: [RetryReason; 10] = [
        Self::NetError,
        Self::Timeout,
        Self::Http5xx,
        Self::Http429,
        Self::Http503,
        Self::BodyNotReplayable,
        Self::CtxDone,
        Self::MaxAttempts,
        Self::CbOpen,
        Self::Success,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetError => "net_error",
            Self::Timeout => "timeout",
            Self::Http5xx => "http_5xx",
            Self::Http429 => "http_429",
            Self::Http503 => "http_503",
            Self::BodyNotReplayable => "body_not_replayable",
            Self::CtxDone => "ctx_done",
            Self::MaxAttempts => "max_attempts",
            Self::CbOpen => "cb_open",
            Self::Success => "success",
        }
    }

    /// Reason attached to a retryable HTTP status.
    #[must_use]
    pub fn for_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::Http429,
            503 => Self::Http503,
            _ => Self::Http5xx,
        }
    }

    /// Reason attached to an error outcome.
    #[must_use]
    pub fn for_error(err: &HttpError) -> Self {
        match err {
            HttpError::Timeout(_) => Self::Timeout,
            HttpError::CircuitOpen { .. } => Self::CbOpen,
            HttpError::Canceled | HttpError::DeadlineExceeded => Self::CtxDone,
            _ => Self::NetError,
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation outcome label: `success`, `error`, `timeout`, `canceled`, `cb_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// A response was received (any status)
    Success,
    Error,
    Timeout,
    Canceled,
    CircuitOpen,
}

impl Outcome {
    #[must_use]
    pub fn of(result: Result<&Response<ResponseBody>, &HttpError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(HttpError::Timeout(_) | HttpError::DeadlineExceeded) => Self::Timeout,
            Err(HttpError::Canceled) => Self::Canceled,
            Err(HttpError::CircuitOpen { .. }) => Self::CircuitOpen,
            Err(_) => Self::Error,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::CircuitOpen => "cb_open",
        }
    }
}

/// Retry decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub reason: RetryReason,
}

impl RetryDecision {
    #[must_use]
    pub fn retry(reason: RetryReason) -> Self {
        Self {
            retry: true,
            reason,
        }
    }

    #[must_use]
    pub fn stop(reason: RetryReason) -> Self {
        Self {
            retry: false,
            reason,
        }
    }
}

/// One physical send within an operation.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-based, strictly increasing within an operation
    pub attempt: u32,
    pub started_at: Instant,
    /// Wait that preceded this attempt (zero for the first one)
    pub wait: Duration,
    /// Duration of the inward call
    pub elapsed: Duration,
    pub outcome: Outcome,
    pub status: Option<StatusCode>,
    pub reason: RetryReason,
    /// Whether another attempt follows
    pub retried: bool,
}

impl AttemptRecord {
    #[must_use]
    pub fn status_class(&self) -> StatusClass {
        StatusClass::from_status(self.status)
    }
}

/// Receiver for attempt records, carried in the request extensions.
///
/// The observability layer installs one per operation; the retry layer
/// reports every attempt to it as soon as the attempt is decided.
#[derive(Clone)]
pub(crate) struct AttemptSink(Arc<dyn Fn(&AttemptRecord) + Send + Sync>);

impl AttemptSink {
    pub(crate) fn new(f: impl Fn(&AttemptRecord) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn record(&self, record: &AttemptRecord) {
        (self.0)(record);
    }
}
