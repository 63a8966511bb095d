use crate::breaker::BreakerRegistry;
use crate::config::BreakerConfig;
use crate::error::HttpError;
use crate::request::RequestBody;
use crate::response::ResponseBody;
use http::{Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tower layer gating requests through a per-host circuit breaker.
///
/// Every service produced by one layer shares the same registry.
#[derive(Clone, Debug)]
pub struct BreakerLayer {
    registry: Arc<BreakerRegistry>,
}

impl BreakerLayer {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_registry(Arc::new(BreakerRegistry::new(config)))
    }

    #[must_use]
    pub fn with_registry(registry: Arc<BreakerRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }
}

impl<S> Layer<S> for BreakerLayer {
    type Service = BreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BreakerService {
            inner,
            registry: Arc::clone(&self.registry),
        }
    }
}

/// Service that fails fast with [`HttpError::CircuitOpen`] while the
/// destination's breaker is open, and feeds every other result back into
/// the breaker.
///
/// Caller-context errors are not held against the host.
#[derive(Clone, Debug)]
pub struct BreakerService<S> {
    inner: S,
    registry: Arc<BreakerRegistry>,
}

impl<S> Service<Request<RequestBody>> for BreakerService<S>
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let registry = Arc::clone(&self.registry);
        let key = (registry.config().key)(&req);

        Box::pin(async move {
            let permit = registry.try_acquire(&key)?;
            let result = inner.call(req).await;

            match result.as_ref() {
                Err(e) if e.is_context_error() => permit.abandon(),
                outcome => {
                    let failed = (registry.config().is_failure)(outcome);
                    permit.record(!failed);
                }
            }
            result
        })
    }
}
