//! Middleware which applies a request timeout and an idle timeout to an exchange.
//!
//! The request timeout bounds the whole exchange, including reading the
//! response body. The idle timeout bounds every gap without progress: waiting
//! for the response head, between chunks of a streamed upload, and between
//! chunks of the response body.

use std::fmt;
use std::time::Duration;

use http_body::Body as _;

pub use self::future::ResponseFuture;
use crate::abort::{Phase, TimeoutAbort};
use crate::body::{Body, TimeoutStream};
use crate::{BoxError, Error, TimeoutResponse};

/// Timeouts applied to each exchange.
///
/// Both timeouts are optional and independent. With neither set, exchanges
/// pass through unmodified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutOptions {
    /// Maximum lifespan of the exchange, from sending the request to the end
    /// of the response body.
    pub request_timeout: Option<Duration>,

    /// Maximum time without progress. Reset by every chunk sent or received.
    pub idle_timeout: Option<Duration>,
}

impl TimeoutOptions {
    /// Options with no timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request (lifespan) timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Does any timeout apply?
    pub fn is_enabled(&self) -> bool {
        self.request_timeout.is_some() || self.idle_timeout.is_some()
    }
}

/// Layer to apply [`TimeoutOptions`] to a transport service.
#[derive(Debug, Clone, Default)]
pub struct TimeoutLayer {
    options: TimeoutOptions,
}

impl TimeoutLayer {
    /// Create a new `TimeoutLayer` with the provided options.
    pub fn new(options: TimeoutOptions) -> Self {
        Self { options }
    }
}

impl<S> tower::layer::Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService::new(inner, self.options)
    }
}

/// Applies a request timeout and an idle timeout to each exchange made
/// through the inner transport service.
///
/// Each call gets its own [`TimeoutAbort`]. Its [`AbortSignal`](crate::AbortSignal)
/// is inserted into the request extensions for transports which want to observe
/// it, and the transport future is dropped as soon as it fires.
#[derive(Clone)]
pub struct TimeoutService<S> {
    inner: S,
    options: TimeoutOptions,
}

impl<S> TimeoutService<S> {
    /// Create a new `TimeoutService` wrapping `inner`.
    pub fn new(inner: S, options: TimeoutOptions) -> Self {
        Self { inner, options }
    }

    /// The options applied to each exchange.
    pub fn options(&self) -> &TimeoutOptions {
        &self.options
    }

    /// A reference to the inner service.
    pub fn service(&self) -> &S {
        &self.inner
    }
}

impl<S> fmt::Debug for TimeoutService<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutService")
            .field("inner", &self.inner)
            .field("options", &self.options)
            .finish()
    }
}

impl<S, B> tower::Service<http::Request<Body>> for TimeoutService<S>
where
    S: tower::Service<http::Request<Body>, Response = http::Response<B>>,
    S::Error: Into<BoxError>,
    B: http_body::Body,
{
    type Response = TimeoutResponse<B>;
    type Error = Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Error::transport)
    }

    fn call(&mut self, mut request: http::Request<Body>) -> Self::Future {
        let uri = request.uri().clone();

        if !self.options.is_enabled() {
            return ResponseFuture::plain(self.inner.call(request), uri);
        }

        let abort = TimeoutAbort::new(self.options.request_timeout);
        request.extensions_mut().insert(abort.signal().clone());

        let streamed = request.body().is_stream() && !request.body().is_end_stream();
        if let Some(idle) = self.options.idle_timeout {
            if streamed {
                let upload = abort.clone();
                request =
                    request.map(|body| Body::new(TimeoutStream::new(body, upload, Some(idle))));
            } else {
                abort.reset_for(Phase::Exchange, idle);
            }
        }

        tracing::trace!(
            request.uri = %uri,
            timeout.request = ?self.options.request_timeout,
            timeout.idle = ?self.options.idle_timeout,
            request.streamed = streamed,
            "sending request with timeouts"
        );

        ResponseFuture::timed(
            self.inner.call(request),
            uri,
            abort,
            self.options.idle_timeout,
            streamed,
        )
    }
}

mod future {

    use std::future::Future;
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};
    use std::time::Duration;

    use http_body::Body as _;
    use pin_project::{pin_project, pinned_drop};

    use crate::abort::{Aborted, Phase, TimeoutAbort};
    use crate::{BoxError, Error, TimeoutResponse};

    /// Timing state for an exchange in flight.
    struct Exchange {
        abort: TimeoutAbort,
        aborted: Aborted,
        idle: Option<Duration>,
        streamed: bool,
    }

    /// Future returned by [`TimeoutService`](super::TimeoutService).
    #[pin_project(PinnedDrop)]
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        uri: Option<http::Uri>,
        exchange: Option<Exchange>,
    }

    impl<F> std::fmt::Debug for ResponseFuture<F> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ResponseFuture")
                .field("uri", &self.uri)
                .field("abort", &self.exchange.as_ref().map(|e| &e.abort))
                .finish()
        }
    }

    impl<F> ResponseFuture<F> {
        pub(super) fn plain(inner: F, uri: http::Uri) -> Self {
            Self {
                inner,
                uri: Some(uri),
                exchange: None,
            }
        }

        pub(super) fn timed(
            inner: F,
            uri: http::Uri,
            abort: TimeoutAbort,
            idle: Option<Duration>,
            streamed: bool,
        ) -> Self {
            Self {
                inner,
                uri: Some(uri),
                exchange: Some(Exchange {
                    aborted: abort.signal().aborted(),
                    abort,
                    idle,
                    streamed,
                }),
            }
        }
    }

    impl<F, B, E> Future for ResponseFuture<F>
    where
        F: Future<Output = Result<http::Response<B>, E>>,
        E: Into<BoxError>,
        B: http_body::Body,
    {
        type Output = Result<TimeoutResponse<B>, Error>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            let this = self.project();

            // The signal wins over a transport result which is ready at the same time.
            if let Some(exchange) = this.exchange.as_mut() {
                if Pin::new(&mut exchange.aborted).poll(cx).is_ready() {
                    this.exchange.take();
                    tracing::trace!("exchange aborted before a response arrived");
                    return Poll::Ready(Err(Error::Aborted));
                }
            }

            let result = ready!(this.inner.poll(cx));
            let uri = this
                .uri
                .take()
                .expect("ResponseFuture polled after completion");

            let Some(exchange) = this.exchange.take() else {
                return Poll::Ready(
                    result
                        .map(|response| TimeoutResponse::new(uri, response))
                        .map_err(Error::transport),
                );
            };

            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    exchange.abort.abort();
                    return Poll::Ready(Err(Error::transport(error)));
                }
            };

            if exchange.idle.is_some() && !exchange.streamed {
                exchange.abort.clear_for(Phase::Exchange);
            }

            if response.body().is_end_stream() {
                tracing::trace!(response.status = %response.status(), "response has no body");
                exchange.abort.abort();
                return Poll::Ready(Ok(TimeoutResponse::new(uri, response)));
            }

            Poll::Ready(Ok(TimeoutResponse::deferred(
                uri,
                response,
                exchange.abort,
                exchange.idle,
            )))
        }
    }

    #[pinned_drop]
    impl<F> PinnedDrop for ResponseFuture<F> {
        fn drop(self: Pin<&mut Self>) {
            if let Some(exchange) = self.project().exchange.take() {
                tracing::trace!("exchange cancelled before completion");
                exchange.abort.abort();
            }
        }
    }
}
