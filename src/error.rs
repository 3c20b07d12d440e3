//! Error types for corpc.

use std::fmt;

/// Error type for corpc operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying transport.
    Io(std::io::Error),
    /// The service context is not accepting calls (shutting down, peer
    /// closed, or a bulk transfer was aborted).
    ServiceUnavailable,
    /// No wait slot became free within the bounded retry window.
    ResourceExhausted,
    /// A bulk transfer was aborted mid-flight by peer teardown. The
    /// destination buffer holds zero valid bytes.
    TransferAborted,
    /// Message too large for a control message.
    MessageTooLarge { size: usize, max: usize },
    /// Destination buffer too small for the data to be reconstructed.
    BufferTooSmall { required: usize, available: usize },
    /// Peer or handler broke the protocol contract. The dispatch loop
    /// treats this as fatal: it logs the violation and shuts the
    /// context down.
    Protocol(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::ServiceUnavailable => write!(f, "service is not accepting calls"),
            Error::ResourceExhausted => write!(f, "no wait slot became free"),
            Error::TransferAborted => write!(f, "bulk transfer aborted by peer teardown"),
            Error::MessageTooLarge { size, max } => {
                write!(f, "message too large: {} bytes, max {} bytes", size, max)
            }
            Error::BufferTooSmall { required, available } => {
                write!(
                    f,
                    "buffer too small: required {} bytes, available {} bytes",
                    required, available
                )
            }
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for corpc operations.
pub type Result<T> = std::result::Result<T, Error>;
