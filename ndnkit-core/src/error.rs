//! Error kinds surfaced through callbacks and `Result`s.

use crate::name::Name;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Retry budget exhausted for a request.
    #[error("request for {name} timed out")]
    RequestTimeout { name: Name },
    #[error("failed to register prefix {prefix}: {reason}")]
    RegistrationFailure { prefix: Name, reason: String },
    /// Trailing component could not be decoded as a segment id.
    #[error("malformed segment marker in {name}")]
    MalformedSegmentMarker { name: Name },
    #[error("no data found for {name}")]
    DataNotFound { name: Name },
    /// A name that does not follow the pub/sub naming convention.
    #[error("malformed name {name}: {reason}")]
    MalformedName { name: Name, reason: String },
    /// Any of the above, raised while a segment stream was active.
    #[error("stream failed: {0}")]
    StreamFailure(Box<Error>),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("pump gave up after {iterations} iterations")]
    Stalled { iterations: u64 },
    #[error("face is closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Wrap as a stream failure unless it already is one.
    pub fn into_stream_failure(self) -> Error {
        match self {
            Error::StreamFailure(_) => self,
            other => Error::StreamFailure(Box::new(other)),
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::RequestTimeout { .. } => true,
            Error::StreamFailure(inner) => inner.is_timeout(),
            _ => false,
        }
    }
}
