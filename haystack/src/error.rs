//! Error types shared across the SDK.

use std::sync::PoisonError;
use std::time::Duration;

/// A specialized [`Result`] for SDK operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures the SDK can surface to its caller.
///
/// Only explicit synchronous APIs (`Client::send_event`, `Transport` calls)
/// return these to application code; the capture pipeline recovers from
/// everything except configuration errors at init.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid setup input, raised from `init`. Fatal.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The delivery endpoint could not be reached or answered non-2xx.
    #[error("transport failed: {0}")]
    Transport(String),

    /// A payload could not be turned into envelope bytes.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The worker did not drain within the allowed time.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimedOut(Duration),

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Other(err.to_string())
    }
}
