//! Client error types.

use resplex_protocol::ProtocolError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Server error prefixes that signal a transient condition.
const TRANSIENT_SERVER_ERRORS: &[&str] = &["LOADING", "BUSY", "TRYAGAIN", "MASTERDOWN"];

/// Client errors.
///
/// Cloneable so one connection-level failure can fail every outstanding
/// operation.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Malformed inbound frame; the connection was torn down.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Well-formed error reply.
    #[error("server error: {message}")]
    Server { message: String },

    /// The command never reached the transport.
    #[error("write failed: {0}")]
    WriteFailure(String),

    /// The transport broke after the command was sent.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation disposed")]
    Disposed,

    #[error("operation canceled")]
    Canceled,

    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("no connection available")]
    NoConnectionAvailable,

    #[error("retry queue is full")]
    RetryQueueFull,

    #[error("command {0} is disabled")]
    CommandDisabled(String),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Programmer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("operation result was already consumed")]
    AlreadyConsumed,

    #[error("operation was not sent yet")]
    NotYetSent,

    #[error("command declared {declared} arguments but {written} were written")]
    ArgumentCountMismatch { declared: usize, written: usize },

    #[error("routing table is not sorted by slot")]
    UnsortedRoutingTable,

    #[error("blocking call made inside the async runtime")]
    BlockingInAsyncContext,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::WriteFailure(_) => true,
            ClientError::ConnectionLost(_) => true,
            ClientError::NoConnectionAvailable => true,
            ClientError::Server { message } => TRANSIENT_SERVER_ERRORS
                .iter()
                .any(|prefix| message.starts_with(prefix)),
            _ => false,
        }
    }

    pub(crate) fn server(message: &[u8]) -> Self {
        ClientError::Server {
            message: String::from_utf8_lossy(message).into_owned(),
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ArgumentCountMismatch { declared, written } => {
                ClientError::Usage(UsageError::ArgumentCountMismatch { declared, written })
            }
            other => ClientError::Protocol(other),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl From<crate::config::ConfigError> for ClientError {
    fn from(err: crate::config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionLost("reset".into()).is_retryable());
        assert!(ClientError::WriteFailure("closed".into()).is_retryable());
        assert!(ClientError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_retryable());
        assert!(ClientError::server(b"LOADING dataset in memory").is_retryable());

        assert!(!ClientError::server(b"ERR unknown command").is_retryable());
        assert!(!ClientError::Disposed.is_retryable());
        assert!(!ClientError::Canceled.is_retryable());
        assert!(!ClientError::Usage(UsageError::NotYetSent).is_retryable());
        assert!(!ClientError::Protocol(ProtocolError::InvalidPrefix(b'x')).is_retryable());
    }

    #[test]
    fn test_argument_mismatch_is_usage_error() {
        let err = ClientError::from(ProtocolError::ArgumentCountMismatch {
            declared: 2,
            written: 1,
        });
        assert!(matches!(
            err,
            ClientError::Usage(UsageError::ArgumentCountMismatch {
                declared: 2,
                written: 1
            })
        ));
    }

    #[test]
    fn test_errors_are_shared_by_clone() {
        let err = ClientError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        let copies: Vec<_> = (0..3).map(|_| err.clone()).collect();
        for copy in copies {
            assert!(copy.to_string().contains("boom"));
        }
    }
}
