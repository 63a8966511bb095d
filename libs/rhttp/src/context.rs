//! Caller-side cancellation and deadline for one logical request.
//!
//! A [`CallContext`] travels in the request extensions. Every suspension
//! point of the chain (inward calls, body draining, backoff waits) races
//! against it, so a cancellation is observed as soon as the token fires
//! rather than at the next polling tick.

use crate::error::HttpError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline owned by the caller.
///
/// Cloning is cheap and clones observe the same token.
///
/// # Example
///
/// ```ignore
/// use rhttp::{CallContext, RequestExt};
///
/// let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
/// let req = http::Request::get("https://api.example.com/items")
///     .body(RequestBody::empty())?
///     .with_context(ctx.clone());
///
/// // elsewhere: ctx.cancel();
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context that is never canceled and has no deadline until configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing token (e.g. a child of a server shutdown token).
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Set an absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cancel every operation carrying this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` when there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The error this context currently imposes, if any.
    ///
    /// Cancellation takes precedence over an expired deadline.
    #[must_use]
    pub fn error(&self) -> Option<HttpError> {
        if self.cancel.is_cancelled() {
            return Some(HttpError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(HttpError::DeadlineExceeded),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.error().is_some()
    }

    /// Drive `fut` to completion unless the context ends first.
    ///
    /// When the token fires or the deadline passes, `fut` is dropped (which
    /// releases whatever it owns) and the context error is returned.
    pub(crate) async fn run<T, F>(&self, fut: F) -> Result<T, HttpError>
    where
        F: Future<Output = Result<T, HttpError>>,
    {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => Err(HttpError::Canceled),
                    () = tokio::time::sleep_until(deadline) => Err(HttpError::DeadlineExceeded),
                    res = fut => res,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => Err(HttpError::Canceled),
                    res = fut => res,
                }
            }
        }
    }

    /// Sleep for `wait`, returning early with [`HttpError::Canceled`] as soon
    /// as the token fires (or [`HttpError::DeadlineExceeded`] at the deadline).
    pub(crate) async fn sleep(&self, wait: Duration) -> Result<(), HttpError> {
        self.run(async {
            tokio::time::sleep(wait).await;
            Ok(())
        })
        .await
    }
}

/// Attach and read a [`CallContext`] on an `http::Request`.
pub trait RequestExt {
    /// Store `ctx` in the request extensions, replacing any previous one.
    #[must_use]
    fn with_context(self, ctx: CallContext) -> Self;

    /// The attached context, or a fresh never-canceled context.
    fn call_context(&self) -> CallContext;
}

impl<B> RequestExt for http::Request<B> {
    fn with_context(mut self, ctx: CallContext) -> Self {
        self.extensions_mut().insert(ctx);
        self
    }

    fn call_context(&self) -> CallContext {
        self.extensions()
            .get::<CallContext>()
            .cloned()
            .unwrap_or_default()
    }
}
