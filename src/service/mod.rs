//! Tower middleware which applies timeouts to HTTP exchanges.

mod timeout;

pub use self::timeout::{ResponseFuture, TimeoutLayer, TimeoutOptions, TimeoutService};
pub use tower::{service_fn, Service, ServiceBuilder, ServiceExt};
