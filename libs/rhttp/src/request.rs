use crate::error::BoxError;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Factory that recreates a request body identically for a later attempt.
pub type BodyFactory = Arc<dyn Fn() -> RequestBody + Send + Sync>;

enum BodyKind {
    /// No body
    Empty,
    /// Buffered bytes; `None` once the bytes were yielded
    Full(Option<Bytes>),
    /// Streaming body, readable once
    Streaming(BoxBody<Bytes, BoxError>),
}

/// Request body used by every layer of the chain.
///
/// Replayability decides whether the retry layer may send a request more
/// than once:
///
/// - [`RequestBody::empty`] and buffered bytes are always replayable
///   (cloning the bytes is the regeneration mechanism);
/// - [`RequestBody::streaming`] is one-shot;
/// - a streaming body with a factory attached via
///   [`RequestBody::with_regenerator`] is replayable.
///
/// # Example
///
/// ```ignore
/// // One-shot: at most one attempt, regardless of retry settings
/// let body = RequestBody::streaming(file_stream);
///
/// // Replayable: every retry reopens the stream
/// let body = RequestBody::streaming(open_stream())
///     .with_regenerator(Arc::new(|| RequestBody::streaming(open_stream())));
/// ```
pub struct RequestBody {
    kind: BodyKind,
    regenerate: Option<BodyFactory>,
}

impl RequestBody {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            regenerate: None,
        }
    }

    /// Streaming body that can be read once.
    #[must_use]
    pub fn streaming<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            kind: BodyKind::Streaming(body.map_err(Into::into).boxed()),
            regenerate: None,
        }
    }

    /// Attach a factory that recreates this body for later attempts.
    ///
    /// Behind the retry layer every attempt, the first included, is sent
    /// with a body produced by the factory.
    #[must_use]
    pub fn with_regenerator(mut self, factory: BodyFactory) -> Self {
        self.regenerate = Some(factory);
        self
    }

    /// Whether a second, identical copy of this body can be produced.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        match self.kind {
            BodyKind::Empty | BodyKind::Full(_) => true,
            BodyKind::Streaming(_) => self.regenerate.is_some(),
        }
    }

    /// Produce an independent copy for one attempt.
    ///
    /// Returns `None` for a one-shot streaming body.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match &self.kind {
            BodyKind::Empty => Some(Self::empty()),
            BodyKind::Full(bytes) => Some(Self {
                kind: BodyKind::Full(bytes.clone()),
                regenerate: None,
            }),
            BodyKind::Streaming(_) => self.regenerate.as_ref().map(|factory| {
                let mut body = factory();
                body.regenerate = Some(Arc::clone(factory));
                body
            }),
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self {
            kind: BodyKind::Full(Some(bytes)),
            regenerate: None,
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::from(Bytes::from(s))
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        Self::from(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BodyKind::Empty => "empty",
            BodyKind::Full(_) => "full",
            BodyKind::Streaming(_) => "streaming",
        };
        f.debug_struct("RequestBody")
            .field("kind", &kind)
            .field("replayable", &self.is_replayable())
            .finish()
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().kind {
            BodyKind::Empty => Poll::Ready(None),
            BodyKind::Full(bytes) => Poll::Ready(
                bytes
                    .take()
                    .filter(|b| !b.is_empty())
                    .map(|b| Ok(Frame::data(b))),
            ),
            BodyKind::Streaming(body) => Pin::new(body).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            BodyKind::Empty => true,
            BodyKind::Full(bytes) => bytes.as_ref().is_none_or(Bytes::is_empty),
            BodyKind::Streaming(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            BodyKind::Empty => SizeHint::with_exact(0),
            BodyKind::Full(bytes) => {
                SizeHint::with_exact(bytes.as_ref().map_or(0, |b| b.len() as u64))
            }
            BodyKind::Streaming(body) => body.size_hint(),
        }
    }
}

/// Destination host of a request, used as the default breaker key and as
/// the `host` metric label.
///
/// Uses the full authority (`host:port`) so that two services on the same
/// host but different ports get independent breakers.
#[must_use]
pub fn destination_host(uri: &http::Uri) -> String {
    uri.authority()
        .map(ToString::to_string)
        .or_else(|| uri.host().map(ToOwned::to_owned))
        .unwrap_or_else(|| "unknown".to_owned())
}
