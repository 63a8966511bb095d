use std::time::Duration;
use thiserror::Error;

/// Boxed error type carried by transport failures and body errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request-time error returned by every layer of the chain.
///
/// Variants are grouped by where they originate:
/// - caller context: [`HttpError::Canceled`], [`HttpError::DeadlineExceeded`]
/// - base transport: [`HttpError::Transport`], [`HttpError::Timeout`]
/// - circuit breaker: [`HttpError::CircuitOpen`]
///
/// HTTP error statuses (5xx, 429, ...) are never turned into errors: the
/// response is returned as `Ok` and the caller decides what to do with it.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Transport error (network, connection, TLS handshake, ...)
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// Single request attempt timed out
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit for this destination is open; no request was sent.
    ///
    /// This value is stable across versions: match on it (or use
    /// [`HttpError::is_circuit_open`]) instead of on the message.
    #[error("Circuit open for '{key}'")]
    CircuitOpen {
        /// Breaker key (by default the request authority)
        key: String,
    },

    /// The caller canceled the operation
    #[error("Request canceled by caller")]
    Canceled,

    /// The caller's deadline passed before the operation completed
    #[error("Caller deadline exceeded")]
    DeadlineExceeded,
}

impl HttpError {
    /// Returns `true` for the circuit-open sentinel.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns `true` for errors raised by the caller's own context
    /// (cancellation or deadline). These are never retried.
    #[must_use]
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// Returns `true` for a per-attempt timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

/// Construction-time error: the chain could not be built from the given settings.
///
/// Invalid settings never surface at request time.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// `max_attempts` must allow at least the initial attempt
    #[error("retry max_attempts must be >= 1, got {0}")]
    InvalidMaxAttempts(u32),

    /// Backoff parameters are unusable
    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),

    /// Half-open trial limit must admit at least one trial
    #[error("breaker half_open_max_requests must be >= 1, got {0}")]
    InvalidHalfOpenLimit(u32),

    /// Open-state timeout must be non-zero, otherwise the breaker never gates
    #[error("breaker open_timeout must be non-zero")]
    ZeroOpenTimeout,

    /// The layer order is fixed; any other order is rejected
    #[error("unsupported layer order {requested}; the only supported order is {supported}")]
    UnsupportedLayerOrder {
        /// The order that was asked for (outer to inner)
        requested: String,
        /// The fixed order for the enabled layers (outer to inner)
        supported: String,
    },

    /// TLS setup of the default base transport failed
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),
}
