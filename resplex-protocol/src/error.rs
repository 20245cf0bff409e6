//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding or encoding frames.
///
/// A decode error leaves the stream unsynchronized: the connection that
/// produced it must be torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid frame prefix {0:#04x}")]
    InvalidPrefix(u8),

    #[error("invalid length {0:?}")]
    InvalidLength(String),

    #[error("missing CRLF terminator at offset {0}")]
    MissingTerminator(usize),

    #[error("invalid integer {0:?}")]
    InvalidInteger(String),

    #[error("invalid double {0:?}")]
    InvalidDouble(String),

    #[error("invalid boolean {0:?}")]
    InvalidBoolean(String),

    #[error("invalid verbatim string header")]
    InvalidVerbatim,

    #[error("stream marker {0:?} outside a streamed value")]
    UnexpectedStreamMarker(char),

    #[error("streamed string interrupted by {0:?}")]
    InvalidStreamChunk(char),

    #[error("map ended between a key and its value")]
    PrematureEnd,

    #[error("nesting deeper than {max} levels")]
    NestingTooDeep { max: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("command declared {declared} arguments but {written} were written")]
    ArgumentCountMismatch { declared: usize, written: usize },
}
