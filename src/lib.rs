//! Hyperdriver Timeout
//!
//! Request lifespan and idle timeouts for HTTP exchanges, with a single
//! cancellation signal carried through the request, the upload body and
//! the streamed response body.
//!
//! The pieces compose bottom up:
//!
//! 1. [`TimeoutAbort`] owns one [`AbortSignal`] and the two timers which may
//!    fire it: a one-shot lifespan timer and a resettable idle timer.
//! 2. [`TimeoutStream`] wraps a chunk stream or an [`http_body::Body`] so every
//!    chunk slides the idle deadline forward, and stream completion clears or
//!    terminates the coordinator.
//! 3. [`TimeoutService`](service::TimeoutService) is a `tower` middleware which
//!    wires both around a single exchange, and [`Client`] is a thin,
//!    clonable wrapper around it.
//!
//! # Example
//! ```no_run
//! # use std::time::Duration;
//! # use hyperdriver_timeout::{Body, Client, TimeoutOptions};
//! # async fn run<S>(transport: S) -> Result<(), hyperdriver_timeout::Error>
//! # where
//! #     S: tower::Service<http::Request<Body>, Response = http::Response<Body>>
//! #         + Clone + Send + Sync + 'static,
//! #     S::Error: Into<hyperdriver_timeout::BoxError>,
//! #     S::Future: Send + 'static,
//! # {
//! let options = TimeoutOptions::new()
//!     .with_request_timeout(Duration::from_secs(30))
//!     .with_idle_timeout(Duration::from_secs(5));
//!
//! let client = Client::new(transport, options);
//! let response = client.get("http://example.com/".parse().unwrap()).await?;
//! let text = response.text().await?;
//! # let _ = text;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod abort;
pub use abort::{AbortSignal, Phase, TimeoutAbort, TimerState};
pub mod body;
pub use body::{Body, TimeoutStream};
pub mod bridge;
pub mod client;
pub use client::Client;
mod error;
pub use error::{is_abort_error, Error};
pub mod response;
pub use response::{ResponseBody, TimeoutResponse};
pub mod service;
pub use service::{TimeoutLayer, TimeoutOptions};
pub mod transport;

/// A boxed error which can be sent between threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A boxed future which can be sent between threads.
pub type BoxFuture<'a, T> = futures_util::future::BoxFuture<'a, T>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
