#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::cast_precision_loss,
    dead_code
)]

//! Shared fakes for the integration tests

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body::{Body, Frame};
use parking_lot::Mutex;
use rhttp::{HttpError, RequestBody, ResponseBody, destination_host};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// One scripted answer of [`FakeBase`].
#[derive(Clone)]
pub enum Reply {
    Status(u16),
    StatusWithHeader(u16, &'static str, &'static str),
    Fail,
    /// Answer with `status` after `delay`
    Slow(u16, Duration),
}

/// Response body counting how many instances were dropped.
pub struct TrackedBody {
    data: Option<Bytes>,
    dropped: Arc<AtomicU32>,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = rhttp::BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        Poll::Ready(self.data.take().map(|d| Ok(Frame::data(d))))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none()
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Inner {
    scripts: HashMap<String, Vec<Reply>>,
    calls: HashMap<String, u32>,
    headers: Vec<HeaderMap>,
}

/// Base transport answering per host from a script; the last reply repeats.
#[derive(Clone, Default)]
pub struct FakeBase {
    inner: Arc<Mutex<Inner>>,
    bodies_created: Arc<AtomicU32>,
    bodies_dropped: Arc<AtomicU32>,
}

impl FakeBase {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn script(self, host: &str, replies: &[Reply]) -> Self {
        self.inner
            .lock()
            .scripts
            .insert(host.to_owned(), replies.to_vec());
        self
    }

    #[must_use]
    pub fn statuses(self, host: &str, statuses: &[u16]) -> Self {
        let replies: Vec<Reply> = statuses.iter().copied().map(Reply::Status).collect();
        self.script(host, &replies)
    }

    pub fn calls(&self, host: &str) -> u32 {
        self.inner.lock().calls.get(host).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.inner.lock().calls.values().sum()
    }

    pub fn seen_headers(&self) -> Vec<HeaderMap> {
        self.inner.lock().headers.clone()
    }

    pub fn bodies_created(&self) -> u32 {
        self.bodies_created.load(Ordering::SeqCst)
    }

    pub fn bodies_dropped(&self) -> u32 {
        self.bodies_dropped.load(Ordering::SeqCst)
    }

    fn respond(&self, status: u16) -> Response<ResponseBody> {
        self.bodies_created.fetch_add(1, Ordering::SeqCst);
        let body = TrackedBody {
            data: Some(Bytes::from_static(b"payload")),
            dropped: Arc::clone(&self.bodies_dropped),
        };
        Response::builder()
            .status(StatusCode::from_u16(status).unwrap())
            .body(http_body_util::BodyExt::boxed(body))
            .unwrap()
    }
}

impl Service<Request<RequestBody>> for FakeBase {
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let host = destination_host(req.uri());
        let reply = {
            let mut inner = self.inner.lock();
            inner.headers.push(req.headers().clone());
            let n = {
                let calls = inner.calls.entry(host.clone()).or_insert(0);
                *calls += 1;
                *calls as usize
            };
            inner
                .scripts
                .get(&host)
                .and_then(|replies| replies.get(n - 1).or_else(|| replies.last()))
                .cloned()
                .unwrap_or(Reply::Status(200))
        };

        let this = self.clone();
        Box::pin(async move {
            match reply {
                Reply::Status(status) => Ok(this.respond(status)),
                Reply::StatusWithHeader(status, name, value) => {
                    let mut resp = this.respond(status);
                    resp.headers_mut().insert(name, value.parse().unwrap());
                    Ok(resp)
                }
                Reply::Fail => Err(HttpError::Transport("connection refused".into())),
                Reply::Slow(status, delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(this.respond(status))
                }
            }
        })
    }
}

pub fn get(uri: &str) -> Request<RequestBody> {
    Request::get(uri).body(RequestBody::empty()).unwrap()
}

pub fn post(uri: &str, body: impl Into<RequestBody>) -> Request<RequestBody> {
    Request::post(uri).body(body.into()).unwrap()
}

/// `metrics` recorder keeping `(name, sorted labels, value)` for every update.
#[derive(Clone, Default)]
pub struct MetricsCapture {
    updates: Arc<Mutex<Vec<(String, Vec<(String, String)>, f64)>>>,
}

impl MetricsCapture {
    pub fn updates(&self, name: &str) -> Vec<(Vec<(String, String)>, f64)> {
        self.updates
            .lock()
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, labels, value)| (labels.clone(), *value))
            .collect()
    }

    pub fn label_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .updates
            .lock()
            .iter()
            .flat_map(|(_, labels, _)| labels.iter().map(|(k, _)| k.clone()))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn handle(&self, key: &metrics::Key) -> Arc<CaptureHandle> {
        let mut labels: Vec<(String, String)> = key
            .labels()
            .map(|l| (l.key().to_owned(), l.value().to_owned()))
            .collect();
        labels.sort();
        Arc::new(CaptureHandle {
            name: key.name().to_owned(),
            labels,
            updates: Arc::clone(&self.updates),
        })
    }
}

struct CaptureHandle {
    name: String,
    labels: Vec<(String, String)>,
    updates: Arc<Mutex<Vec<(String, Vec<(String, String)>, f64)>>>,
}

impl CaptureHandle {
    fn push(&self, value: f64) {
        self.updates
            .lock()
            .push((self.name.clone(), self.labels.clone(), value));
    }
}

impl metrics::CounterFn for CaptureHandle {
    fn increment(&self, value: u64) {
        self.push(value as f64);
    }

    fn absolute(&self, value: u64) {
        self.push(value as f64);
    }
}

impl metrics::GaugeFn for CaptureHandle {
    fn increment(&self, value: f64) {
        self.push(value);
    }

    fn decrement(&self, value: f64) {
        self.push(-value);
    }

    fn set(&self, value: f64) {
        self.push(value);
    }
}

impl metrics::HistogramFn for CaptureHandle {
    fn record(&self, value: f64) {
        self.push(value);
    }
}

impl metrics::Recorder for MetricsCapture {
    fn describe_counter(
        &self,
        _: metrics::KeyName,
        _: Option<metrics::Unit>,
        _: metrics::SharedString,
    ) {
    }
    fn describe_gauge(
        &self,
        _: metrics::KeyName,
        _: Option<metrics::Unit>,
        _: metrics::SharedString,
    ) {
    }
    fn describe_histogram(
        &self,
        _: metrics::KeyName,
        _: Option<metrics::Unit>,
        _: metrics::SharedString,
    ) {
    }

    fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
        metrics::Counter::from_arc(self.handle(key))
    }

    fn register_gauge(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
        metrics::Gauge::from_arc(self.handle(key))
    }

    fn register_histogram(
        &self,
        key: &metrics::Key,
        _: &metrics::Metadata<'_>,
    ) -> metrics::Histogram {
        metrics::Histogram::from_arc(self.handle(key))
    }
}

/// Counts `outgoing_http` spans.
#[derive(Clone, Default)]
pub struct SpanCounter {
    spans: Arc<AtomicU32>,
}

impl SpanCounter {
    pub fn spans(&self) -> u32 {
        self.spans.load(Ordering::SeqCst)
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for SpanCounter {
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        _: &tracing::span::Id,
        _: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if attrs.metadata().name() == "outgoing_http" {
            self.spans.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Current-thread runtime with paused time.
pub fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}
