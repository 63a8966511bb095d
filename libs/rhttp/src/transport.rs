//! Default base transport: hyper-util's pooled client over rustls.

use crate::config::TransportSecurity;
use crate::error::{BoxError, ConfigError, HttpError};
use crate::request::RequestBody;
use crate::response::ResponseBody;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Connection settings of [`HyperTransport`].
#[derive(Debug, Clone)]
pub struct HyperTransportConfig {
    /// Transport security mode (default: `TlsOnly`)
    pub security: TransportSecurity,

    /// Idle timeout for pooled connections (default: 90s, `None` = keep forever)
    pub pool_idle_timeout: Option<Duration>,

    /// Maximum idle connections kept per host (default: 32)
    pub pool_max_idle_per_host: usize,
}

impl Default for HyperTransportConfig {
    fn default() -> Self {
        Self {
            security: TransportSecurity::TlsOnly,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Base transport performing the actual network I/O.
///
/// Connection pooling, TLS (webpki roots, aws-lc-rs unless another rustls
/// provider is installed) and HTTP/1.1 + HTTP/2 negotiation are hyper's.
/// Status codes are never turned into errors.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, RequestBody>,
    security: TransportSecurity,
}

impl HyperTransport {
    /// HTTPS-only transport with default pool settings.
    ///
    /// # Errors
    /// Returns [`ConfigError::Tls`] if the TLS connector cannot be set up.
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_config(HyperTransportConfig::default())
    }

    /// # Errors
    /// Returns [`ConfigError::Tls`] if the TLS connector cannot be set up.
    pub fn with_config(config: HyperTransportConfig) -> Result<Self, ConfigError> {
        if config.security == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let https = build_https_connector(config.security)?;

        let mut builder = Client::builder(TokioExecutor::new());
        // pool_timer is required for pool_idle_timeout to take effect
        builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host);
        if let Some(idle_timeout) = config.pool_idle_timeout {
            builder.pool_idle_timeout(idle_timeout);
        }

        Ok(Self {
            client: builder.build(https),
            security: config.security,
        })
    }

    #[must_use]
    pub fn security(&self) -> TransportSecurity {
        self.security
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl Service<Request<RequestBody>> for HyperTransport {
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let fut = self.client.request(req);
        Box::pin(async move {
            let response = fut.await?;
            Ok(response.map(|body| body.map_err(|e| -> BoxError { Box::new(e) }).boxed()))
        })
    }
}

/// Get the crypto provider for TLS connections.
///
/// Uses the globally installed provider when there is one, otherwise a
/// fresh aws-lc-rs provider (without installing it globally).
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn build_https_connector(
    security: TransportSecurity,
) -> Result<HttpsConnector<HttpConnector>, ConfigError> {
    let builder = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(crypto_provider())
        .map_err(|e| ConfigError::Tls(Box::new(e)))?;
    let connector = match security {
        TransportSecurity::AllowInsecureHttp => {
            builder.https_or_http().enable_all_versions().build()
        }
        TransportSecurity::TlsOnly => builder.https_only().enable_all_versions().build(),
    };
    Ok(connector)
}
