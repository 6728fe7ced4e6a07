//! A transport service which sends requests on a single hyper HTTP/1 connection.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::client::conn::http1;
use tokio::sync::Mutex;

use crate::bridge::TokioIo;
use crate::{AbortSignal, Body, BoxError, BoxFuture, Error};

/// Sends requests over one HTTP/1 connection.
///
/// Requests are serialized on the connection. A request carrying an
/// [`AbortSignal`] in its extensions is abandoned as soon as the signal fires.
#[derive(Clone)]
pub struct Http1Transport {
    sender: Arc<Mutex<http1::SendRequest<Body>>>,
}

impl fmt::Debug for Http1Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Transport").finish()
    }
}

impl Http1Transport {
    /// Wrap an established sender. The connection must be driven separately.
    pub fn new(sender: http1::SendRequest<Body>) -> Self {
        Self {
            sender: Arc::new(Mutex::new(sender)),
        }
    }

    /// Perform an HTTP/1 handshake over `stream`, and spawn a task to drive
    /// the connection.
    pub async fn handshake<IO>(stream: IO) -> Result<Self, hyper::Error>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::debug!(%error, "connection closed with error");
            }
        });
        Ok(Self::new(sender))
    }

    async fn send(
        sender: Arc<Mutex<http1::SendRequest<Body>>>,
        request: http::Request<Body>,
    ) -> Result<http::Response<Body>, BoxError> {
        let response = {
            let mut sender = sender.lock().await;
            sender.ready().await?;
            sender.send_request(request)
        };
        Ok(response.await?.map(Body::from))
    }
}

impl tower::Service<http::Request<Body>> for Http1Transport {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let sender = self.sender.clone();
        let signal = request.extensions().get::<AbortSignal>().cloned();

        Box::pin(async move {
            let Some(signal) = signal else {
                return Self::send(sender, request).await;
            };

            if signal.is_aborted() {
                return Err(Error::Aborted.into());
            }

            tokio::select! {
                biased;
                _ = signal.aborted() => {
                    tracing::trace!("request abandoned by abort signal");
                    Err(Error::Aborted.into())
                }
                response = Self::send(sender, request) => response,
            }
        })
    }
}
