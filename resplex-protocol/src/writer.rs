//! Command encoder.
//!
//! Commands go out as a top-level array of bulk strings, the first element
//! being the command name:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n
//! ```
//!
//! The writer estimates an upper bound of the encoded size before touching
//! the sink so a command normally lands in one reservation.

use crate::arena::BufferArena;
use crate::error::ProtocolError;
use crate::frame::format_double;
use bytes::{Bytes, BytesMut};

/// Encoding of an empty bulk string.
pub const EMPTY_BULK: &[u8] = b"$0\r\n\r\n";

/// Encoding of a null bulk string.
pub const NULL_BULK: &[u8] = b"$-1\r\n";

const POWERS_OF_TEN: [u64; 20] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
];

/// Upper bound of a formatted `f64` (`-1.7976931348623157e308` and friends).
const MAX_DOUBLE_WIDTH: usize = 24;

/// Decimal digits needed for `n`.
pub fn digit_count(n: u64) -> usize {
    POWERS_OF_TEN.partition_point(|&power| power <= n).max(1)
}

/// Width of `n` formatted in decimal, sign included.
pub fn integer_width(n: i64) -> usize {
    digit_count(n.unsigned_abs()) + usize::from(n < 0)
}

/// Encoded size of a bulk string carrying `len` bytes.
pub fn bulk_len(len: usize) -> usize {
    1 + digit_count(len as u64) + 2 + len + 2
}

/// Destination of encoded bytes.
pub trait FrameSink {
    /// Prepares room for at least `additional` bytes.
    fn reserve_hint(&mut self, additional: usize);

    fn put(&mut self, data: &[u8]);
}

impl FrameSink for BytesMut {
    fn reserve_hint(&mut self, additional: usize) {
        let free = self.capacity() - self.len();
        if free < additional {
            // Grow at least by doubling.
            let grow = additional.max(self.capacity());
            self.reserve(grow);
        }
    }

    fn put(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }
}

impl FrameSink for BufferArena {
    fn reserve_hint(&mut self, additional: usize) {
        let size = additional.min(self.pool().segment_size());
        self.acquire(size);
    }

    fn put(&mut self, data: &[u8]) {
        self.write_slice(data);
    }
}

/// One command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bytes(Bytes),
    Integer(i64),
    Double(f64),
    Null,
}

impl Arg {
    /// Upper bound of the encoded size of this argument.
    pub fn estimated_len(&self) -> usize {
        match self {
            Arg::Bytes(data) => bulk_len(data.len()),
            Arg::Integer(n) => {
                let width = integer_width(*n);
                1 + digit_count(width as u64) + 2 + width + 2
            }
            Arg::Double(_) => bulk_len(MAX_DOUBLE_WIDTH),
            Arg::Null => NULL_BULK.len(),
        }
    }

    /// Applies `prefix` to a byte argument.
    pub fn with_prefix(self, prefix: &[u8]) -> Arg {
        match self {
            Arg::Bytes(data) if !prefix.is_empty() => {
                let mut prefixed = BytesMut::with_capacity(prefix.len() + data.len());
                prefixed.extend_from_slice(prefix);
                prefixed.extend_from_slice(&data);
                Arg::Bytes(prefixed.freeze())
            }
            other => other,
        }
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Arg::Bytes(value)
    }
}

impl From<&'static str> for Arg {
    fn from(value: &'static str) -> Self {
        Arg::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Bytes(Bytes::from(value))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for Arg {
    fn from(value: &[u8]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Integer(value)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Double(value)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Arg::Null, Into::into)
    }
}

/// Upper bound of the encoded size of a whole command.
pub fn estimate_command(name: &[u8], args: &[Arg]) -> usize {
    1 + digit_count(args.len() as u64 + 1)
        + 2
        + bulk_len(name.len())
        + args.iter().map(Arg::estimated_len).sum::<usize>()
}

/// Writes commands into a [`FrameSink`], checking argument counts.
pub struct FrameWriter<'a, S: FrameSink + ?Sized> {
    sink: &'a mut S,
    declared: usize,
    written: usize,
    commands: usize,
}

impl<'a, S: FrameSink + ?Sized> FrameWriter<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self {
            sink,
            declared: 0,
            written: 0,
            commands: 0,
        }
    }

    /// Number of commands started so far.
    pub fn commands(&self) -> usize {
        self.commands
    }

    /// Opens a command with `arg_count` arguments after the name.
    ///
    /// Fails if the previous command is missing arguments.
    pub fn write_command(&mut self, name: &[u8], arg_count: usize) -> Result<(), ProtocolError> {
        self.finish()?;
        let mut itoa = itoa::Buffer::new();
        self.sink.put(b"*");
        self.sink.put(itoa.format(arg_count + 1).as_bytes());
        self.sink.put(b"\r\n");
        self.put_bulk(name);
        self.declared = arg_count;
        self.written = 0;
        self.commands += 1;
        Ok(())
    }

    fn claim(&mut self) -> Result<(), ProtocolError> {
        if self.written == self.declared {
            return Err(ProtocolError::ArgumentCountMismatch {
                declared: self.declared,
                written: self.written + 1,
            });
        }
        self.written += 1;
        Ok(())
    }

    fn put_bulk(&mut self, value: &[u8]) {
        if value.is_empty() {
            self.sink.put(EMPTY_BULK);
            return;
        }
        let mut itoa = itoa::Buffer::new();
        self.sink.put(b"$");
        self.sink.put(itoa.format(value.len()).as_bytes());
        self.sink.put(b"\r\n");
        self.sink.put(value);
        self.sink.put(b"\r\n");
    }

    /// Appends one bulk argument.
    pub fn write_value(&mut self, value: &[u8]) -> Result<(), ProtocolError> {
        self.claim()?;
        self.put_bulk(value);
        Ok(())
    }

    pub fn write_str(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.write_value(value.as_bytes())
    }

    /// Appends an integer argument as its decimal text.
    pub fn write_integer(&mut self, value: i64) -> Result<(), ProtocolError> {
        let mut itoa = itoa::Buffer::new();
        self.write_value(itoa.format(value).as_bytes())
    }

    pub fn write_double(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.write_value(format_double(value).as_bytes())
    }

    pub fn write_null(&mut self) -> Result<(), ProtocolError> {
        self.claim()?;
        self.sink.put(NULL_BULK);
        Ok(())
    }

    pub fn write_arg(&mut self, arg: &Arg) -> Result<(), ProtocolError> {
        match arg {
            Arg::Bytes(data) => self.write_value(data),
            Arg::Integer(n) => self.write_integer(*n),
            Arg::Double(d) => self.write_double(*d),
            Arg::Null => self.write_null(),
        }
    }

    /// Writes a complete command, reserving its estimated size first.
    pub fn write_all(&mut self, name: &[u8], args: &[Arg]) -> Result<(), ProtocolError> {
        self.sink.reserve_hint(estimate_command(name, args));
        self.write_command(name, args.len())?;
        for arg in args {
            self.write_arg(arg)?;
        }
        self.finish()
    }

    /// Checks that the open command received every declared argument.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.written != self.declared {
            return Err(ProtocolError::ArgumentCountMismatch {
                declared: self.declared,
                written: self.written,
            });
        }
        Ok(())
    }
}

/// Encodes one command into a fresh buffer.
pub fn encode_command(name: &[u8], args: &[Arg]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(estimate_command(name, args));
    FrameWriter::new(&mut buf).write_all(name, args)?;
    Ok(buf.freeze())
}
