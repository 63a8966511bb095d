use crate::breaker::BreakerRegistry;
use crate::config::{BreakerConfig, ObservabilityConfig, RetryConfig, TransportConfig};
use crate::context::RequestExt;
use crate::error::{ConfigError, HttpError};
use crate::layers::{BreakerLayer, ObservabilityLayer, RetryLayer, breaker_transition_hook};
use crate::request::RequestBody;
use crate::response::ResponseBody;
use crate::transport::{HyperTransport, HyperTransportConfig};
use http::{Request, Response};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};

/// Type-erased service between composition steps in [`TransportBuilder::build`].
pub type BoxedTransport =
    BoxCloneSyncService<Request<RequestBody>, Response<ResponseBody>, HttpError>;

/// A layer of the chain, as reported by [`ResilientTransport::layers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Observability,
    Retry,
    Breaker,
}

impl LayerKind {
    /// The only supported order, outer to inner.
    pub const ORDER: [LayerKind; 3] = [Self::Observability, Self::Retry, Self::Breaker];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observability => "observability",
            Self::Retry => "retry",
            Self::Breaker => "breaker",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn describe_order(order: &[LayerKind]) -> String {
    let names: Vec<&str> = order.iter().map(|l| l.as_str()).collect();
    format!("[{}]", names.join(" -> "))
}

/// Builder composing a [`ResilientTransport`] over a base transport.
///
/// A layer that is not configured is left out of the stack entirely.
///
/// # Example
///
/// ```ignore
/// use rhttp::{BreakerConfig, ResilientTransport, RetryConfig};
///
/// let transport = ResilientTransport::builder(HyperTransport::new()?)
///     .retry(RetryConfig::default())
///     .breaker(BreakerConfig::default().trip_after_consecutive_failures(3))
///     .observability(ObservabilityConfig::default())
///     .build()?;
///
/// let response = transport.send(request).await?;
/// ```
pub struct TransportBuilder<S> {
    base: S,
    config: TransportConfig,
    requested_order: Option<Vec<LayerKind>>,
}

impl<S> TransportBuilder<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    #[must_use]
    pub fn new(base: S) -> Self {
        Self {
            base,
            config: TransportConfig::default(),
            requested_order: None,
        }
    }

    /// Replace every layer setting at once.
    #[must_use]
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.config.breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn observability(mut self, observability: ObservabilityConfig) -> Self {
        self.config.observability = Some(observability);
        self
    }

    /// Ask for an explicit layer order, outer to inner.
    ///
    /// Only the fixed order (restricted to the enabled layers) is accepted;
    /// anything else makes [`TransportBuilder::build`] fail.
    #[must_use]
    pub fn layer_order(mut self, order: impl IntoIterator<Item = LayerKind>) -> Self {
        self.requested_order = Some(order.into_iter().collect());
        self
    }

    /// Validate the settings and compose the chain.
    ///
    /// Composition goes innermost first: base, then breaker, retry and
    /// observability.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for invalid layer settings or an unsupported
    /// layer order.
    pub fn build(self) -> Result<ResilientTransport, ConfigError> {
        let TransportConfig {
            retry,
            breaker,
            observability,
        } = self.config;

        if let Some(retry) = &retry {
            retry.validate()?;
        }
        if let Some(breaker) = &breaker {
            breaker.validate()?;
        }

        let layers: Vec<LayerKind> = LayerKind::ORDER
            .into_iter()
            .filter(|layer| match layer {
                LayerKind::Observability => observability.is_some(),
                LayerKind::Retry => retry.is_some(),
                LayerKind::Breaker => breaker.is_some(),
            })
            .collect();

        if let Some(requested) = self.requested_order
            && requested != layers
        {
            return Err(ConfigError::UnsupportedLayerOrder {
                requested: describe_order(&requested),
                supported: describe_order(&layers),
            });
        }

        let mut service = BoxCloneSyncService::new(self.base);

        let mut breakers = None;
        if let Some(mut breaker) = breaker {
            if observability.as_ref().is_some_and(|o| o.metrics) {
                breaker.on_state_change = Some(breaker_transition_hook(breaker.on_state_change));
            }
            let layer = BreakerLayer::new(breaker);
            breakers = Some(Arc::clone(layer.registry()));
            service = BoxCloneSyncService::new(layer.layer(service));
        }

        if let Some(retry) = retry {
            service = BoxCloneSyncService::new(RetryLayer::new(retry).layer(service));
        }

        if let Some(observability) = observability {
            service =
                BoxCloneSyncService::new(ObservabilityLayer::new(observability).layer(service));
        }

        tracing::debug!(layers = %describe_order(&layers), "Composed resilient transport");

        Ok(ResilientTransport {
            service,
            layers: layers.into(),
            breakers,
        })
    }
}

/// Base transport wrapped in the configured resilience layers.
///
/// Cheap to clone; clones share breaker state. Itself a `tower::Service`,
/// so it can serve as the base of another chain.
#[derive(Clone)]
pub struct ResilientTransport {
    service: BoxedTransport,
    layers: Arc<[LayerKind]>,
    breakers: Option<Arc<BreakerRegistry>>,
}

impl ResilientTransport {
    #[must_use]
    pub fn builder<S>(base: S) -> TransportBuilder<S>
    where
        S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        TransportBuilder::new(base)
    }

    /// Compose `config` over `base`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for invalid layer settings.
    pub fn new<S>(base: S, config: TransportConfig) -> Result<Self, ConfigError>
    where
        S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        TransportBuilder::new(base).config(config).build()
    }

    /// Compose `config` over a default HTTPS-only [`HyperTransport`].
    ///
    /// # Errors
    /// Returns [`ConfigError`] for invalid layer settings or TLS setup failure.
    pub fn with_default_base(config: TransportConfig) -> Result<Self, ConfigError> {
        Self::new(
            HyperTransport::with_config(HyperTransportConfig::default())?,
            config,
        )
    }

    /// Enabled layers, outer to inner.
    #[must_use]
    pub fn layers(&self) -> &[LayerKind] {
        &self.layers
    }

    /// Breaker registry, when the breaker layer is enabled.
    #[must_use]
    pub fn breakers(&self) -> Option<&Arc<BreakerRegistry>> {
        self.breakers.as_ref()
    }

    /// Send one logical request through the chain.
    ///
    /// Returns `Ok` for every HTTP status; the caller owns the response body.
    ///
    /// # Errors
    /// Returns the last attempt's [`HttpError`], the circuit-open sentinel,
    /// or the caller's cancellation/deadline error.
    pub async fn send(
        &self,
        req: Request<RequestBody>,
    ) -> Result<Response<ResponseBody>, HttpError> {
        let ctx = req.call_context();
        ctx.run(self.service.clone().oneshot(req)).await
    }
}

impl fmt::Debug for ResilientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientTransport")
            .field("layers", &self.layers)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

impl Service<Request<RequestBody>> for ResilientTransport {
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let ctx = req.call_context();
        let fut = self.service.call(req);
        Box::pin(async move { ctx.run(fut).await })
    }
}
