use thiserror::Error;

use crate::BoxError;

/// Errors raised while performing an exchange under timeouts.
///
/// A request timeout and an idle timeout are reported identically as
/// [`Error::Aborted`]; they are both the shared signal firing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The exchange was cancelled, either by one of its timeouts or by an explicit abort.
    #[error("operation aborted")]
    Aborted,

    /// Error occured in the underlying transport or while reading a body.
    #[error("transport: {0}")]
    Transport(#[source] BoxError),

    /// The response body could not be decoded.
    #[error("decode: {0}")]
    Decode(#[source] serde_json::Error),
}

impl Error {
    /// Wrap a transport error, unless it already is one of ours.
    pub(crate) fn transport<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        match error.into().downcast::<Error>() {
            Ok(error) => *error,
            Err(error) => Error::Transport(error),
        }
    }

    /// Was this error caused by the cancellation signal firing?
    pub fn is_aborted(&self) -> bool {
        match self {
            Error::Aborted => true,
            Error::Transport(error) => is_abort_error(error.as_ref()),
            Error::Decode(_) => false,
        }
    }
}

/// Check whether an error was caused by cancellation.
///
/// Walks the [`source`](std::error::Error::source) chain, so transport errors
/// which wrap an [`Error::Aborted`] are classified as aborts too.
pub fn is_abort_error(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(error) = current {
        if matches!(error.downcast_ref::<Error>(), Some(Error::Aborted)) {
            return true;
        }

        // io::Error skips its custom payload when reporting a source.
        current = match error.downcast_ref::<std::io::Error>() {
            Some(io) => io.get_ref().map(|inner| inner as &(dyn std::error::Error + 'static)),
            None => error.source(),
        };
    }
    false
}
