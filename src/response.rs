//! Responses whose bodies stay under the exchange's timeouts.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::Body as _;
use http_body_util::BodyExt as _;
use pin_project::pin_project;
use serde::de::DeserializeOwned;

use crate::abort::TimeoutAbort;
use crate::body::TimeoutStream;
use crate::{BoxError, DebugLiteral, Error};

/// The timing to apply to a response body once it is first accessed.
///
/// Dropping an unused wrap aborts the coordinator, so a response which is
/// discarded without touching its body does not leave timers behind.
struct DeferredWrap {
    abort: Option<TimeoutAbort>,
    idle: Option<Duration>,
}

impl DeferredWrap {
    fn wrap<B>(mut self, body: B) -> ResponseBody<B> {
        match self.abort.take() {
            Some(abort) => ResponseBody::Timed(TimeoutStream::terminating(body, abort, self.idle)),
            None => ResponseBody::Plain(body),
        }
    }
}

impl Drop for DeferredWrap {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            tracing::trace!("response dropped before its body was read");
            abort.abort();
        }
    }
}

/// Once-computed body slot: deferred until the first access, then memoized.
enum BodyCell<B> {
    Deferred(B, DeferredWrap),
    Ready(ResponseBody<B>),
    Taken,
}

impl<B> BodyCell<B> {
    fn plain(body: B) -> Self {
        BodyCell::Ready(ResponseBody::Plain(body))
    }

    fn deferred(body: B, abort: TimeoutAbort, idle: Option<Duration>) -> Self {
        BodyCell::Deferred(
            body,
            DeferredWrap {
                abort: Some(abort),
                idle,
            },
        )
    }

    fn get_or_wrap(&mut self) -> &mut ResponseBody<B> {
        if matches!(self, BodyCell::Deferred(..)) {
            if let BodyCell::Deferred(body, wrap) = std::mem::replace(self, BodyCell::Taken) {
                *self = BodyCell::Ready(wrap.wrap(body));
            }
        }

        match self {
            BodyCell::Ready(body) => body,
            BodyCell::Deferred(..) | BodyCell::Taken => {
                unreachable!("body cell is populated after wrapping")
            }
        }
    }

    fn into_body(self) -> ResponseBody<B> {
        match self {
            BodyCell::Deferred(body, wrap) => wrap.wrap(body),
            BodyCell::Ready(body) => body,
            BodyCell::Taken => unreachable!("body cell is populated after wrapping"),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BodyCell::Deferred(..) => "Deferred",
            BodyCell::Ready(ResponseBody::Plain(_)) => "Plain",
            BodyCell::Ready(ResponseBody::Timed(_)) => "Timed",
            BodyCell::Taken => "Taken",
        }
    }
}

/// A response body, possibly monitored by the exchange's idle timeout.
#[pin_project(project = ResponseBodyProj)]
pub enum ResponseBody<B> {
    /// No timeouts apply to this body.
    Plain(#[pin] B),

    /// Reads reset the idle timeout, and fail once the exchange is aborted.
    Timed(#[pin] TimeoutStream<B>),
}

impl<B> fmt::Debug for ResponseBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Plain(_) => f.debug_tuple("Plain").finish(),
            ResponseBody::Timed(stream) => f
                .debug_struct("Timed")
                .field("abort", stream.abort())
                .field("idle", &stream.idle_timeout())
                .finish(),
        }
    }
}

impl<B> http_body::Body for ResponseBody<B>
where
    B: http_body::Body,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            ResponseBodyProj::Plain(body) => body
                .poll_frame(cx)
                .map(|frame| frame.map(|res| res.map_err(Error::transport))),
            ResponseBodyProj::Timed(body) => body.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ResponseBody::Plain(body) => body.is_end_stream(),
            ResponseBody::Timed(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            ResponseBody::Plain(body) => body.size_hint(),
            ResponseBody::Timed(body) => body.size_hint(),
        }
    }
}

/// A response produced by [`TimeoutService`](crate::service::TimeoutService).
///
/// Metadata is available directly. The body is wrapped with the idle timeout
/// the first time it is accessed, through [`body`](TimeoutResponse::body),
/// [`into_body`](TimeoutResponse::into_body) or one of the buffering helpers.
pub struct TimeoutResponse<B> {
    parts: http::response::Parts,
    uri: http::Uri,
    body: BodyCell<B>,
    used: bool,
}

impl<B> fmt::Debug for TimeoutResponse<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutResponse")
            .field("status", &self.parts.status)
            .field("version", &self.parts.version)
            .field("uri", &self.uri)
            .field("headers", &self.parts.headers)
            .field("body", &DebugLiteral(self.body.label()))
            .field("body_used", &self.used)
            .finish()
    }
}

impl<B> TimeoutResponse<B> {
    /// A response without timing behavior.
    pub(crate) fn new(uri: http::Uri, response: http::Response<B>) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            parts,
            uri,
            body: BodyCell::plain(body),
            used: false,
        }
    }

    /// A response whose body will be monitored by `abort` once accessed.
    pub(crate) fn deferred(
        uri: http::Uri,
        response: http::Response<B>,
        abort: TimeoutAbort,
        idle: Option<Duration>,
    ) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            parts,
            uri,
            body: BodyCell::deferred(body, abort, idle),
            used: false,
        }
    }

    /// The response status code.
    pub fn status(&self) -> http::StatusCode {
        self.parts.status
    }

    /// Is the status code in the 2xx range?
    pub fn is_success(&self) -> bool {
        self.parts.status.is_success()
    }

    /// The HTTP version of the response.
    pub fn version(&self) -> http::Version {
        self.parts.version
    }

    /// The response headers.
    pub fn headers(&self) -> &http::HeaderMap {
        &self.parts.headers
    }

    /// The response extensions.
    pub fn extensions(&self) -> &http::Extensions {
        &self.parts.extensions
    }

    /// The URI of the request which produced this response.
    pub fn uri(&self) -> &http::Uri {
        &self.uri
    }

    /// The response body, wrapped with the idle timeout on first access.
    pub fn body(&mut self) -> &mut ResponseBody<B> {
        self.used = true;
        self.body.get_or_wrap()
    }

    /// Has the body been handed out through [`body`](TimeoutResponse::body)?
    ///
    /// The consuming accessors take the response, so once this is `true`
    /// the caller may already have read from the stream.
    pub fn body_used(&self) -> bool {
        self.used
    }

    /// Take the response body.
    pub fn into_body(self) -> ResponseBody<B> {
        self.body.into_body()
    }

    /// Convert back into an [`http::Response`], wrapping the body if needed.
    pub fn into_response(self) -> http::Response<ResponseBody<B>> {
        http::Response::from_parts(self.parts, self.body.into_body())
    }

    /// Drop the body without reading it, releasing the underlying stream
    /// and the exchange's timers.
    pub fn cancel_body(self) {
        drop(self.into_body());
    }
}

impl<B> TimeoutResponse<B>
where
    B: http_body::Body,
    B::Error: Into<BoxError>,
{
    /// Read the whole body into memory.
    pub async fn bytes(self) -> Result<Bytes, Error> {
        let collected = self.into_body().collect().await?;
        Ok(collected.to_bytes())
    }

    /// Read the whole body, decoding it as UTF-8.
    ///
    /// Invalid sequences are replaced with `U+FFFD`.
    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read the whole body, deserializing it as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, Error> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(Error::Decode)
    }
}
