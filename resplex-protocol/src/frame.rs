//! RESP frame model.
//!
//! Every frame starts with a one-byte prefix followed by a CRLF-terminated
//! header line:
//!
//! ```text
//! +OK\r\n                          simple string
//! -ERR message\r\n                 error
//! :42\r\n                          integer
//! $5\r\nhello\r\n                  bulk string ($-1 is null)
//! *2\r\n:1\r\n:2\r\n               array (*-1 is null)
//! %1\r\n+key\r\n:1\r\n             map, counted in pairs
//! $?\r\n;5\r\nhello\r\n;0\r\n      streamed string
//! *?\r\n:1\r\n.\r\n                streamed aggregate
//! ```

use bytes::Bytes;
use std::fmt;

/// Wire tag of a frame, one per prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    SimpleString,
    Error,
    Integer,
    Double,
    Boolean,
    BulkString,
    BlobError,
    VerbatimString,
    BigNumber,
    Null,
    Array,
    Map,
    Set,
    Push,
    StreamChunk,
    StreamTerminator,
}

impl FrameKind {
    /// Maps a prefix byte to its kind.
    pub fn from_prefix(prefix: u8) -> Option<Self> {
        Some(match prefix {
            b'+' => FrameKind::SimpleString,
            b'-' => FrameKind::Error,
            b':' => FrameKind::Integer,
            b',' => FrameKind::Double,
            b'#' => FrameKind::Boolean,
            b'$' => FrameKind::BulkString,
            b'!' => FrameKind::BlobError,
            b'=' => FrameKind::VerbatimString,
            b'(' => FrameKind::BigNumber,
            b'_' => FrameKind::Null,
            b'*' => FrameKind::Array,
            b'%' => FrameKind::Map,
            b'~' => FrameKind::Set,
            b'>' => FrameKind::Push,
            b';' => FrameKind::StreamChunk,
            b'.' => FrameKind::StreamTerminator,
            _ => return None,
        })
    }

    pub fn prefix(&self) -> u8 {
        match self {
            FrameKind::SimpleString => b'+',
            FrameKind::Error => b'-',
            FrameKind::Integer => b':',
            FrameKind::Double => b',',
            FrameKind::Boolean => b'#',
            FrameKind::BulkString => b'$',
            FrameKind::BlobError => b'!',
            FrameKind::VerbatimString => b'=',
            FrameKind::BigNumber => b'(',
            FrameKind::Null => b'_',
            FrameKind::Array => b'*',
            FrameKind::Map => b'%',
            FrameKind::Set => b'~',
            FrameKind::Push => b'>',
            FrameKind::StreamChunk => b';',
            FrameKind::StreamTerminator => b'.',
        }
    }

    /// Kinds whose header carries a byte length.
    pub fn is_length_prefixed(&self) -> bool {
        matches!(
            self,
            FrameKind::BulkString
                | FrameKind::BlobError
                | FrameKind::VerbatimString
                | FrameKind::StreamChunk
        )
    }

    /// Kinds whose header carries a child count.
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            FrameKind::Array | FrameKind::Map | FrameKind::Set | FrameKind::Push
        )
    }

    /// Children per declared count unit (maps count pairs).
    pub fn children_per_entry(&self) -> usize {
        match self {
            FrameKind::Map => 2,
            _ => 1,
        }
    }
}

/// A complete protocol value.
///
/// Payloads are [`Bytes`]; frames decoded from a connection share the
/// inbound segments instead of copying when a payload sits in one segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SimpleString(Bytes),
    /// `-` line or `!` blob error.
    Error(Bytes),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    BulkString(Bytes),
    VerbatimString {
        format: [u8; 3],
        text: Bytes,
    },
    /// Arbitrary precision integer kept as its decimal text.
    BigNumber(Bytes),
    Null,
    Array(Vec<Frame>),
    Map(Vec<(Frame, Frame)>),
    Set(Vec<Frame>),
    /// Out-of-band data; never a reply to a command.
    Push(Vec<Frame>),
}

impl Frame {
    pub fn simple(text: &'static str) -> Self {
        Frame::SimpleString(Bytes::from_static(text.as_bytes()))
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(data.into())
    }

    pub fn error(message: impl Into<Bytes>) -> Self {
        Frame::Error(message.into())
    }

    /// The wire kind this frame encodes as.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::SimpleString(_) => FrameKind::SimpleString,
            Frame::Error(_) => FrameKind::Error,
            Frame::Integer(_) => FrameKind::Integer,
            Frame::Double(_) => FrameKind::Double,
            Frame::Boolean(_) => FrameKind::Boolean,
            Frame::BulkString(_) => FrameKind::BulkString,
            Frame::VerbatimString { .. } => FrameKind::VerbatimString,
            Frame::BigNumber(_) => FrameKind::BigNumber,
            Frame::Null => FrameKind::Null,
            Frame::Array(_) => FrameKind::Array,
            Frame::Map(_) => FrameKind::Map,
            Frame::Set(_) => FrameKind::Set,
            Frame::Push(_) => FrameKind::Push,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    pub fn is_push(&self) -> bool {
        matches!(self, Frame::Push(_))
    }

    /// Payload of string-like frames.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Frame::SimpleString(b)
            | Frame::Error(b)
            | Frame::BulkString(b)
            | Frame::BigNumber(b) => Some(b),
            Frame::VerbatimString { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Children of aggregate frames (maps are flattened key, value, ...).
    pub fn children(&self) -> Option<Vec<&Frame>> {
        match self {
            Frame::Array(items) | Frame::Set(items) | Frame::Push(items) => {
                Some(items.iter().collect())
            }
            Frame::Map(pairs) => Some(pairs.iter().flat_map(|(k, v)| [k, v]).collect()),
            _ => None,
        }
    }

    /// Appends the wire encoding of this frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Frame::SimpleString(b) => line(out, b'+', b),
            Frame::Error(b) => line(out, b'-', b),
            Frame::Integer(n) => line(out, b':', itoa::Buffer::new().format(*n).as_bytes()),
            Frame::Double(d) => line(out, b',', format_double(*d).as_bytes()),
            Frame::Boolean(v) => line(out, b'#', if *v { b"t" } else { b"f" }),
            Frame::BulkString(b) => blob(out, b'$', &[], b),
            Frame::VerbatimString { format, text } => {
                let mut prefix = [0u8; 4];
                prefix[..3].copy_from_slice(format);
                prefix[3] = b':';
                blob(out, b'=', &prefix, text)
            }
            Frame::BigNumber(b) => line(out, b'(', b),
            Frame::Null => out.extend_from_slice(b"_\r\n"),
            Frame::Array(items) => aggregate(out, b'*', items.len(), items.iter()),
            Frame::Set(items) => aggregate(out, b'~', items.len(), items.iter()),
            Frame::Push(items) => aggregate(out, b'>', items.len(), items.iter()),
            Frame::Map(pairs) => aggregate(
                out,
                b'%',
                pairs.len(),
                pairs.iter().flat_map(|(k, v)| [k, v]),
            ),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        Bytes::from(out)
    }
}

fn line(out: &mut Vec<u8>, prefix: u8, body: &[u8]) {
    out.push(prefix);
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
}

fn blob(out: &mut Vec<u8>, prefix: u8, head: &[u8], body: &[u8]) {
    out.push(prefix);
    out.extend_from_slice(itoa::Buffer::new().format(head.len() + body.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(head);
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
}

fn aggregate<'a>(
    out: &mut Vec<u8>,
    prefix: u8,
    count: usize,
    children: impl Iterator<Item = &'a Frame>,
) {
    out.push(prefix);
    out.extend_from_slice(itoa::Buffer::new().format(count).as_bytes());
    out.extend_from_slice(b"\r\n");
    for child in children {
        child.encode_into(out);
    }
}

pub(crate) fn format_double(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        // Debug switches to exponent form for very large and small values.
        format!("{:?}", value)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::SimpleString(b) | Frame::BulkString(b) | Frame::BigNumber(b) => {
                write!(f, "{}", String::from_utf8_lossy(b))
            }
            Frame::Error(b) => write!(f, "(error) {}", String::from_utf8_lossy(b)),
            Frame::Integer(n) => write!(f, "(integer) {}", n),
            Frame::Double(d) => write!(f, "(double) {}", format_double(*d)),
            Frame::Boolean(v) => write!(f, "(boolean) {}", v),
            Frame::VerbatimString { text, .. } => write!(f, "{}", String::from_utf8_lossy(text)),
            Frame::Null => write!(f, "(nil)"),
            Frame::Array(items) | Frame::Set(items) | Frame::Push(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Frame::Map(pairs) => {
                write!(f, "{{")?;
                for (idx, (k, v)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}
