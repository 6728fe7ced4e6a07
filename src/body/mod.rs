//! Request bodies, and the idle-timeout stream wrapper.
//!
//! [`Body`] distinguishes buffered bodies, which are sent in one go, from
//! streamed bodies, whose chunks drive the idle timeout while uploading.
//! [`TimeoutStream`] is the wrapper which does the driving.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::TryStreamExt as _;
use http_body::Body as _;
use http_body::Frame;
use http_body_util::BodyExt as _;
use http_body_util::{Empty, Full, StreamBody};

use crate::BoxError;

mod timeout;
pub use self::timeout::TimeoutStream;


/// A wrapper for different internal body types which implements [http_body::Body](http_body::Body)
///
/// Bodies can be created from [`Bytes`](bytes::Bytes), [`String`](std::string::String),
/// `Vec<u8>` or [`&'static str`](str) using [`From`](std::convert::From) implementations.
/// Those bodies are buffered. Streamed bodies come from [`Body::wrap_stream`],
/// [`Body::from_reader`] or [`Body::new`].
///
/// An empty body can be created with [Body::empty](Body::empty).
#[derive(Debug)]
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    inner: InnerBody,
}

impl Body {
    /// Create a new streamed `Body` that wraps another [`http_body::Body`].
    pub fn new<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        try_downcast(body).unwrap_or_else(|body| Self {
            inner: InnerBody::Streaming(Box::pin(body.map_err(Into::into))),
        })
    }

    /// Create a new empty body.
    pub fn empty() -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }

    /// Create a streamed body from a [`Stream`] of chunks.
    pub fn wrap_stream<S, D, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<D, E>> + Send + 'static,
        D: Into<Bytes> + 'static,
        E: Into<BoxError> + 'static,
    {
        let frames = stream
            .map_ok(|data| Frame::<Bytes>::data(data.into()))
            .map_err(|error| -> BoxError { error.into() });
        Self {
            inner: InnerBody::Streaming(Box::pin(StreamBody::new(frames))),
        }
    }

    /// Create a streamed body by reading from an [`AsyncRead`](tokio::io::AsyncRead).
    ///
    /// The reader is dropped once the body is finished or dropped.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: tokio::io::AsyncRead + Send + 'static,
    {
        Self::wrap_stream(tokio_util::io::ReaderStream::new(reader))
    }

    /// Is this body streamed, rather than buffered in memory?
    pub fn is_stream(&self) -> bool {
        matches!(
            self.inner,
            InnerBody::Streaming(_) | InnerBody::Incoming(_)
        )
    }
}

impl Default for Body {
    fn default() -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }
}

impl From<Bytes> for Body {
    fn from(body: Bytes) -> Self {
        Self {
            inner: InnerBody::Full(body.into()),
        }
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Self {
            inner: InnerBody::Full(body.into()),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(body: Vec<u8>) -> Self {
        Self {
            inner: InnerBody::Full(body.into()),
        }
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Self {
            inner: InnerBody::Full(body.into()),
        }
    }
}

impl From<Full<Bytes>> for Body {
    fn from(body: Full<Bytes>) -> Self {
        Self {
            inner: InnerBody::Full(body),
        }
    }
}

impl From<Empty<Bytes>> for Body {
    fn from(_body: Empty<Bytes>) -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }
}

impl From<hyper::body::Incoming> for Body {
    fn from(body: hyper::body::Incoming) -> Self {
        Self {
            inner: InnerBody::Incoming(body),
        }
    }
}

fn try_downcast<T, K>(k: K) -> Result<T, K>
where
    T: 'static,
    K: Send + 'static,
{
    let mut k = Some(k);
    if let Some(k) = <dyn std::any::Any>::downcast_mut::<Option<T>>(&mut k) {
        Ok(k.take().expect("downcast option is always populated"))
    } else {
        Err(k.expect("downcast option is always populated"))
    }
}

type StreamingBody = Pin<Box<dyn http_body::Body<Data = Bytes, Error = BoxError> + Send + 'static>>;

#[pin_project::pin_project(project = InnerBodyProj)]
enum InnerBody {
    Empty,
    Full(#[pin] Full<Bytes>),
    Streaming(#[pin] StreamingBody),
    Incoming(#[pin] hyper::body::Incoming),
}

macro_rules! poll_frame {
    ($body:ident, $cx:ident) => {
        $body
            .poll_frame($cx)
            .map(|opt| opt.map(|res| res.map_err(Into::into)))
    };
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.project() {
            InnerBodyProj::Empty => std::task::Poll::Ready(None),
            InnerBodyProj::Full(body) => poll_frame!(body, cx),
            InnerBodyProj::Streaming(body) => poll_frame!(body, cx),
            InnerBodyProj::Incoming(body) => poll_frame!(body, cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(ref body) => body.is_end_stream(),
            InnerBody::Streaming(ref body) => body.is_end_stream(),
            InnerBody::Incoming(ref body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self.inner {
            InnerBody::Empty => http_body::SizeHint::with_exact(0),
            InnerBody::Full(ref body) => body.size_hint(),
            InnerBody::Streaming(ref body) => body.size_hint(),
            InnerBody::Incoming(ref body) => body.size_hint(),
        }
    }
}

impl fmt::Debug for InnerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InnerBody::Empty => f.debug_struct("Empty").finish(),
            InnerBody::Full(_) => f.debug_struct("Full").finish(),
            InnerBody::Streaming(_) => f.debug_struct("Streaming").finish(),
            InnerBody::Incoming(_) => f.debug_struct("Incoming").finish(),
        }
    }
}
