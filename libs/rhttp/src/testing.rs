//! Fake inner services shared by the layer unit tests.

use crate::error::{BoxError, HttpError};
use crate::request::RequestBody;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use tower::Service;

type Script = Arc<
    dyn Fn(u32, &Request<RequestBody>) -> Result<Response<ResponseBody>, HttpError> + Send + Sync,
>;

/// Inner service answering each call from a script; `n` is the 1-based call number.
#[derive(Clone)]
pub(crate) struct ScriptedService {
    calls: Arc<AtomicU32>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
    script: Script,
}

impl ScriptedService {
    pub(crate) fn new(
        script: impl Fn(u32, &Request<RequestBody>) -> Result<Response<ResponseBody>, HttpError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            headers: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(script),
        }
    }

    /// Answer with `statuses` in order, repeating the last one.
    pub(crate) fn statuses(statuses: &[u16]) -> Self {
        let statuses = statuses.to_vec();
        Self::new(move |n, _| {
            let idx = (n as usize - 1).min(statuses.len() - 1);
            Ok(response(statuses[idx]))
        })
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seen_headers(&self) -> Vec<HeaderMap> {
        self.headers.lock().clone()
    }
}

impl Service<Request<RequestBody>> for ScriptedService {
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.headers.lock().push(req.headers().clone());
        let result = (self.script)(n, &req);
        Box::pin(async move { result })
    }
}

pub(crate) fn body(data: &'static [u8]) -> ResponseBody {
    Full::new(Bytes::from_static(data))
        .map_err(|e| -> BoxError { Box::new(e) })
        .boxed()
}

pub(crate) fn response(status: u16) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .body(body(b"scripted"))
        .unwrap()
}

pub(crate) fn transport_error() -> HttpError {
    HttpError::Transport("connection reset by peer".into())
}

pub(crate) fn get(uri: &str) -> Request<RequestBody> {
    Request::get(uri).body(RequestBody::empty()).unwrap()
}

/// One captured metric update: name, sorted labels, value.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MetricUpdate {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// `metrics` recorder keeping every update in memory.
#[derive(Clone, Default)]
pub(crate) struct CaptureRecorder {
    updates: Arc<Mutex<Vec<MetricUpdate>>>,
}

impl CaptureRecorder {
    pub(crate) fn updates(&self, name: &str) -> Vec<MetricUpdate> {
        self.updates
            .lock()
            .iter()
            .filter(|u| u.name == name)
            .cloned()
            .collect()
    }

    pub(crate) fn label_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .updates
            .lock()
            .iter()
            .flat_map(|u| u.labels.iter().map(|(k, _)| k.clone()))
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
            updates: self.updates.clone(),
        })
    }
}

struct CaptureHandle {
    name: String,
    labels: Vec<(String, String)>,
    updates: Arc<Mutex<Vec<MetricUpdate>>>,
}

impl CaptureHandle {
    fn push(&self, value: f64) {
        self.updates.lock().push(MetricUpdate {
            name: self.name.clone(),
            labels: self.labels.clone(),
            value,
        });
    }
}

#[allow(clippy::cast_precision_loss)]
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

impl metrics::Recorder for CaptureRecorder {
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

/// Counts `outgoing_http` spans and per-attempt events.
#[derive(Clone, Default)]
pub(crate) struct SpanCounter {
    spans: Arc<AtomicU32>,
    attempt_events: Arc<AtomicU32>,
}

impl SpanCounter {
    pub(crate) fn spans(&self) -> u32 {
        self.spans.load(Ordering::SeqCst)
    }

    pub(crate) fn attempt_events(&self) -> u32 {
        self.attempt_events.load(Ordering::SeqCst)
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

    fn on_event(&self, event: &tracing::Event<'_>, _: tracing_subscriber::layer::Context<'_, S>) {
        if event.metadata().fields().field("attempt").is_some()
            && event.metadata().fields().field("retried").is_some()
        {
            self.attempt_events.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Current-thread runtime with paused time, for tests that need a
/// thread-local metrics recorder.
pub(crate) fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}
