//! A high-level HTTP client which applies timeouts to every request.

use std::fmt;
use std::time::Duration;

use tower::util::{BoxCloneSyncService, Oneshot};
use tower::ServiceExt as _;

use crate::service::{TimeoutOptions, TimeoutService};
use crate::{Body, BoxError, Error, TimeoutResponse};

/// A boxed transport service with [`Body`] requests and `B` response bodies.
pub type BoxedTransport<B = Body> =
    BoxCloneSyncService<http::Request<Body>, http::Response<B>, BoxError>;

/// A high-level async HTTP client with request and idle timeouts.
///
/// The client holds a transport service and the default [`TimeoutOptions`].
/// Cloning is cheap, and clones share the transport.
///
/// # Example
/// ```no_run
/// # use std::time::Duration;
/// # use hyperdriver_timeout::Client;
/// # use hyperdriver_timeout::transport::Http1Transport;
/// # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let stream = tokio::net::TcpStream::connect("example.com:80").await?;
/// let transport = Http1Transport::handshake(stream).await?;
///
/// let client = Client::builder(transport)
///     .request_timeout(Duration::from_secs(30))
///     .idle_timeout(Duration::from_secs(5))
///     .build();
///
/// let response = client.get("http://example.com/".parse()?).await?;
/// println!("{}", response.text().await?);
/// # Ok(())
/// # }
/// ```
pub struct Client<B = Body> {
    transport: BoxedTransport<B>,
    options: TimeoutOptions,
}

impl<B> Clone for Client<B> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            options: self.options,
        }
    }
}

impl<B> fmt::Debug for Client<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .finish()
    }
}

impl<B> Client<B> {
    /// Create a new client from a transport service and default options.
    pub fn new<S>(transport: S, options: TimeoutOptions) -> Self
    where
        S: tower::Service<http::Request<Body>, Response = http::Response<B>>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        Self {
            transport: BoxCloneSyncService::new(transport.map_err(Into::into)),
            options,
        }
    }

    /// The options applied to each request.
    pub fn options(&self) -> &TimeoutOptions {
        &self.options
    }

    /// Mutable access to the options applied to each request.
    pub fn options_mut(&mut self) -> &mut TimeoutOptions {
        &mut self.options
    }
}

impl Client {
    /// Start building a client around a transport service.
    pub fn builder<S>(transport: S) -> Builder<S> {
        Builder {
            transport,
            options: TimeoutOptions::default(),
        }
    }
}

impl<B> Client<B>
where
    B: http_body::Body,
    B::Error: Into<BoxError>,
{
    /// Send a request with the client's default options.
    pub fn request(
        &self,
        request: http::Request<Body>,
    ) -> Oneshot<TimeoutService<BoxedTransport<B>>, http::Request<Body>> {
        self.request_with(request, self.options)
    }

    /// Send a request, overriding the client's options for this request only.
    pub fn request_with(
        &self,
        request: http::Request<Body>,
        options: TimeoutOptions,
    ) -> Oneshot<TimeoutService<BoxedTransport<B>>, http::Request<Body>> {
        TimeoutService::new(self.transport.clone(), options).oneshot(request)
    }

    /// Make a GET request to the given URI.
    pub async fn get(&self, uri: http::Uri) -> Result<TimeoutResponse<B>, Error> {
        let request = http::Request::get(uri)
            .body(Body::empty())
            .map_err(Error::transport)?;
        self.request(request).await
    }

    /// Make a POST request to the given URI with the given body.
    pub async fn post(
        &self,
        uri: http::Uri,
        body: impl Into<Body>,
    ) -> Result<TimeoutResponse<B>, Error> {
        let request = http::Request::post(uri)
            .body(body.into())
            .map_err(Error::transport)?;
        self.request(request).await
    }
}

/// Builder for a [`Client`].
#[derive(Debug)]
pub struct Builder<S> {
    transport: S,
    options: TimeoutOptions,
}

impl<S> Builder<S> {
    /// Set the request (lifespan) timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = Some(timeout);
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = Some(timeout);
        self
    }

    /// Replace all timeout options.
    pub fn options(mut self, options: TimeoutOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the client.
    pub fn build<B>(self) -> Client<B>
    where
        S: tower::Service<http::Request<Body>, Response = http::Response<B>>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        Client::new(self.transport, self.options)
    }
}

#[cfg(test)]
mod tests {

    use std::convert::Infallible;
    use std::future::Ready;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Client: Send, Sync, Clone);

    type Echo = fn(http::Request<Body>) -> Ready<Result<http::Response<Body>, Infallible>>;

    fn echo(request: http::Request<Body>) -> Ready<Result<http::Response<Body>, Infallible>> {
        let path = request.uri().path().to_owned();
        std::future::ready(Ok(http::Response::new(Body::from(path))))
    }

    fn echo_transport() -> tower::util::ServiceFn<Echo> {
        tower::service_fn(echo as Echo)
    }

    #[tokio::test]
    async fn get_uses_default_options() {
        let client: Client = Client::builder(echo_transport())
            .request_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(
            client.options().request_timeout,
            Some(Duration::from_secs(5))
        );

        let response = client
            .get("http://example.com/hello".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(response.uri().path(), "/hello");
        assert_eq!(response.text().await.unwrap(), "/hello");
    }

    #[tokio::test]
    async fn request_with_overrides_options() {
        let client: Client = Client::new(echo_transport(), TimeoutOptions::new());
        let request = http::Request::get("http://example.com/")
            .body(Body::empty())
            .unwrap();

        let options = TimeoutOptions::new().with_request_timeout(Duration::ZERO);
        let error = client.request_with(request, options).await.unwrap_err();
        assert!(error.is_aborted());
    }

    #[test]
    fn debug_shows_options() {
        let client: Client = Client::new(
            echo_transport(),
            TimeoutOptions::new().with_idle_timeout(Duration::from_secs(1)),
        );
        let debug = format!("{client:?}");
        assert!(debug.contains("idle_timeout"));
    }
}
