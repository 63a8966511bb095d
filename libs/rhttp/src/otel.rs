//! OpenTelemetry glue for the operation span
//!
//! - With `otel` feature: W3C trace context of the span is injected into the
//!   outgoing headers and extra attributes become OpenTelemetry span attributes
//! - Without `otel` feature: nothing is injected; extra attributes are
//!   recorded on the `rhttp.attributes` span field as `key=value` pairs

use http::HeaderMap;
use tracing::Span;

/// W3C Trace Context header name
pub const TRACEPARENT: &str = "traceparent";

#[cfg(feature = "otel")]
mod imp {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use opentelemetry::global;
    use opentelemetry::propagation::Injector;
    use tracing::Span;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    /// Adapter for injecting W3C Trace Context into HTTP headers
    struct HeadersInjector<'a>(&'a mut HeaderMap);

    impl Injector for HeadersInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            if let Ok(name) = HeaderName::from_bytes(key.as_bytes())
                && let Ok(val) = HeaderValue::from_str(&value)
            {
                self.0.insert(name, val);
            }
        }
    }

    pub fn inject_span_context(span: &Span, headers: &mut HeaderMap) {
        let cx = span.context();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut HeadersInjector(headers));
        });
    }

    pub fn set_span_attributes(span: &Span, attributes: &[(&'static str, String)]) {
        for (key, value) in attributes {
            span.set_attribute(*key, value.clone());
        }
    }
}

#[cfg(not(feature = "otel"))]
mod imp {
    use http::HeaderMap;
    use tracing::Span;

    /// No-op: OpenTelemetry is disabled
    pub fn inject_span_context(_span: &Span, _headers: &mut HeaderMap) {}

    pub fn set_span_attributes(span: &Span, attributes: &[(&'static str, String)]) {
        if attributes.is_empty() {
            return;
        }
        let joined = attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        span.record("rhttp.attributes", joined.as_str());
    }
}

/// Inject the trace context of `span` into `headers`.
pub fn inject_span_context(span: &Span, headers: &mut HeaderMap) {
    imp::inject_span_context(span, headers);
}

/// Attach extra attributes to `span`.
pub fn set_span_attributes(span: &Span, attributes: &[(&'static str, String)]) {
    imp::set_span_attributes(span, attributes);
}
