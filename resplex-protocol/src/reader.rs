//! Incremental RESP decoder.
//!
//! The reader works on a borrowed [`ChainRef`] and never consumes bytes of a
//! frame it has not fully validated. Decoding runs in two passes: a scan pass
//! that walks the grammar without allocating and reports whether a complete
//! frame is present, then a build pass that materializes the [`Frame`].
//! Payloads are sliced out of the chain as [`Bytes`], sharing the inbound
//! segment when the payload sits inside one.

use crate::arena::{BufferArena, ChainRef};
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameKind};
use bytes::{Bytes, BytesMut};

/// Default maximum aggregate nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Default maximum bulk payload length (512 MiB).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Longest header line parsed as a number.
const MAX_HEADER_LEN: usize = 32;

/// Outcome of [`FrameReader::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The input holds only a prefix of the next frame.
    NeedMoreData,
    /// A complete frame occupies the first `n` bytes.
    Done(usize),
}

/// Decodes frames from committed arena bytes.
#[derive(Debug, Clone)]
pub struct FrameReader {
    max_depth: usize,
    max_bulk_len: usize,
    fast_path_hits: u64,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            fast_path_hits: 0,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub fn with_max_bulk_len(mut self, max_bulk_len: usize) -> Self {
        self.max_bulk_len = max_bulk_len;
        self
    }

    /// Number of frames recognized by the fast path.
    pub fn fast_path_hits(&self) -> u64 {
        self.fast_path_hits
    }

    /// Validates the next frame without building it.
    pub fn scan(&mut self, input: ChainRef<'_>) -> Result<ReadStatus, ProtocolError> {
        if let Some((_, consumed)) = fast_path(input.first_chunk()) {
            self.fast_path_hits += 1;
            return Ok(ReadStatus::Done(consumed));
        }
        match self.parser(input, false).value(0, 0)? {
            Some(parsed) => Ok(ReadStatus::Done(parsed.end)),
            None => Ok(ReadStatus::NeedMoreData),
        }
    }

    /// Decodes the next frame.
    ///
    /// Returns `Ok(None)` when more data is needed. The caller advances its
    /// buffer by the returned byte count.
    pub fn read(&mut self, input: ChainRef<'_>) -> Result<Option<(Frame, usize)>, ProtocolError> {
        if let Some(hit) = fast_path(input.first_chunk()) {
            self.fast_path_hits += 1;
            return Ok(Some(hit));
        }
        self.read_general(input)
    }

    /// Decodes the next frame from a flat slice.
    ///
    /// The bytes are copied into a temporary arena first.
    pub fn read_slice(&mut self, data: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
        let mut arena = BufferArena::default();
        arena.write_slice(data);
        self.read(arena.readable())
    }

    fn read_general(&self, input: ChainRef<'_>) -> Result<Option<(Frame, usize)>, ProtocolError> {
        if self.parser(input, false).value(0, 0)?.is_none() {
            return Ok(None);
        }
        match self.parser(input, true).value(0, 0)? {
            Some(Parsed {
                frame: Some(frame),
                end,
            }) => Ok(Some((frame, end))),
            _ => Ok(None),
        }
    }

    fn parser<'a>(&self, src: ChainRef<'a>, build: bool) -> Parser<'a> {
        Parser {
            src,
            max_depth: self.max_depth,
            max_bulk_len: self.max_bulk_len,
            build,
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

// Fast path

const fn word(bytes: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*bytes)
}

const OK_WORD: u32 = word(b"+OK\r");
const PON_WORD: u32 = word(b"+PON");
const NG_CRLF_WORD: u32 = word(b"NG\r\n");
const TRUE_WORD: u32 = word(b"#t\r\n");
const FALSE_WORD: u32 = word(b"#f\r\n");
const NULL_BULK_WORD: u32 = word(b"$-1\r");
const NULL_ARRAY_WORD: u32 = word(b"*-1\r");
const CRLF_HALF: u16 = u16::from_le_bytes(*b"\r\n");

fn read_word(chunk: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]])
}

fn read_half(chunk: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([chunk[at], chunk[at + 1]])
}

/// Recognizes common short replies in the first contiguous chunk.
fn fast_path(chunk: &[u8]) -> Option<(Frame, usize)> {
    if chunk.len() < 3 {
        return None;
    }
    match chunk[0] {
        b'+' if chunk.len() >= 5 && read_word(chunk, 0) == OK_WORD && chunk[4] == b'\n' => {
            Some((Frame::simple("OK"), 5))
        }
        b'+' if chunk.len() >= 7
            && read_word(chunk, 0) == PON_WORD
            && read_word(chunk, 3) == NG_CRLF_WORD =>
        {
            Some((Frame::simple("PONG"), 7))
        }
        b':' if chunk.len() >= 4 && chunk[1].is_ascii_digit() && read_half(chunk, 2) == CRLF_HALF => {
            Some((Frame::Integer((chunk[1] - b'0') as i64), 4))
        }
        b':' if chunk.len() >= 5
            && chunk[1].is_ascii_digit()
            && chunk[2].is_ascii_digit()
            && read_half(chunk, 3) == CRLF_HALF =>
        {
            let value = (chunk[1] - b'0') as i64 * 10 + (chunk[2] - b'0') as i64;
            Some((Frame::Integer(value), 5))
        }
        b'#' if chunk.len() >= 4 => match read_word(chunk, 0) {
            TRUE_WORD => Some((Frame::Boolean(true), 4)),
            FALSE_WORD => Some((Frame::Boolean(false), 4)),
            _ => None,
        },
        b'_' if read_half(chunk, 1) == CRLF_HALF => Some((Frame::Null, 3)),
        b'$' | b'*' if chunk.len() >= 5 && chunk[4] == b'\n' => match read_word(chunk, 0) {
            NULL_BULK_WORD | NULL_ARRAY_WORD => Some((Frame::Null, 5)),
            _ => None,
        },
        _ => None,
    }
}

// General path

struct Parsed {
    /// Present only in build mode.
    frame: Option<Frame>,
    end: usize,
}

type ParseResult = Result<Option<Parsed>, ProtocolError>;

/// Declared length of a length-prefixed or aggregate frame.
enum Declared {
    Null,
    Streamed,
    Known(usize),
}

struct Parser<'a> {
    src: ChainRef<'a>,
    max_depth: usize,
    max_bulk_len: usize,
    build: bool,
}

impl Parser<'_> {
    fn value(&self, pos: usize, depth: usize) -> ParseResult {
        let Some(prefix) = self.src.byte_at(pos) else {
            return Ok(None);
        };
        let kind = FrameKind::from_prefix(prefix).ok_or(ProtocolError::InvalidPrefix(prefix))?;

        match kind {
            FrameKind::StreamChunk | FrameKind::StreamTerminator => {
                Err(ProtocolError::UnexpectedStreamMarker(prefix as char))
            }
            FrameKind::BulkString
            | FrameKind::BlobError
            | FrameKind::VerbatimString => self.blob(kind, pos),
            FrameKind::Array | FrameKind::Map | FrameKind::Set | FrameKind::Push => {
                self.aggregate(kind, pos, depth)
            }
            _ => self.simple(kind, pos),
        }
    }

    /// Locates the CRLF ending the line that starts at `start`.
    ///
    /// Returns the offset of `\r` and the offset after `\n`.
    fn line(&self, start: usize) -> Result<Option<(usize, usize)>, ProtocolError> {
        let Some(cr) = self.src.find_byte(start, b'\r') else {
            let pending = self.src.len().saturating_sub(start);
            if pending > self.max_bulk_len {
                return Err(ProtocolError::FrameTooLarge {
                    size: pending as u64,
                    max: self.max_bulk_len as u64,
                });
            }
            return Ok(None);
        };
        match self.src.byte_at(cr + 1) {
            None => Ok(None),
            Some(b'\n') => Ok(Some((cr, cr + 2))),
            Some(_) => Err(ProtocolError::MissingTerminator(cr)),
        }
    }

    fn header(&self, start: usize, end: usize) -> Option<([u8; MAX_HEADER_LEN], usize)> {
        let len = end - start;
        if len > MAX_HEADER_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_HEADER_LEN];
        self.src.copy_to_slice(start, &mut buf[..len]);
        Some((buf, len))
    }

    fn text(&self, start: usize, end: usize) -> String {
        let mut buf = vec![0u8; (end - start).min(64)];
        self.src.copy_to_slice(start, &mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn declared(&self, start: usize, end: usize) -> Result<Declared, ProtocolError> {
        let invalid = || ProtocolError::InvalidLength(self.text(start, end));
        let (buf, len) = self.header(start, end).ok_or_else(invalid)?;
        match &buf[..len] {
            b"?" => Ok(Declared::Streamed),
            b"-1" => Ok(Declared::Null),
            digits => match parse_integer(digits) {
                Some(n) if n >= 0 => Ok(Declared::Known(n as usize)),
                _ => Err(invalid()),
            },
        }
    }

    fn simple(&self, kind: FrameKind, pos: usize) -> ParseResult {
        let start = pos + 1;
        let Some((cr, next)) = self.line(start)? else {
            return Ok(None);
        };

        let frame = match kind {
            FrameKind::Integer => {
                let value = self
                    .header(start, cr)
                    .and_then(|(buf, len)| parse_integer(&buf[..len]))
                    .ok_or_else(|| ProtocolError::InvalidInteger(self.text(start, cr)))?;
                Frame::Integer(value)
            }
            FrameKind::Double => {
                let mut buf = vec![0u8; cr - start];
                self.src.copy_to_slice(start, &mut buf);
                let value = parse_double(&buf)
                    .ok_or_else(|| ProtocolError::InvalidDouble(self.text(start, cr)))?;
                Frame::Double(value)
            }
            FrameKind::Boolean => match self.header(start, cr) {
                Some((buf, 1)) if buf[0] == b't' => Frame::Boolean(true),
                Some((buf, 1)) if buf[0] == b'f' => Frame::Boolean(false),
                _ => return Err(ProtocolError::InvalidBoolean(self.text(start, cr))),
            },
            FrameKind::Null => {
                if cr != start {
                    return Err(ProtocolError::InvalidLength(self.text(start, cr)));
                }
                Frame::Null
            }
            FrameKind::BigNumber => {
                let mut buf = vec![0u8; cr - start];
                self.src.copy_to_slice(start, &mut buf);
                if !is_big_number(&buf) {
                    return Err(ProtocolError::InvalidInteger(self.text(start, cr)));
                }
                Frame::BigNumber(Bytes::from(buf))
            }
            FrameKind::SimpleString => {
                if !self.build {
                    return Ok(Some(Parsed { frame: None, end: next }));
                }
                Frame::SimpleString(self.src.slice_bytes(start, cr - start))
            }
            _ => {
                if !self.build {
                    return Ok(Some(Parsed { frame: None, end: next }));
                }
                Frame::Error(self.src.slice_bytes(start, cr - start))
            }
        };

        Ok(Some(self.finish(frame, next)))
    }

    fn finish(&self, frame: Frame, end: usize) -> Parsed {
        Parsed {
            frame: self.build.then_some(frame),
            end,
        }
    }

    fn check_bulk_len(&self, len: usize) -> Result<(), ProtocolError> {
        if len > self.max_bulk_len {
            return Err(ProtocolError::FrameTooLarge {
                size: len as u64,
                max: self.max_bulk_len as u64,
            });
        }
        Ok(())
    }

    /// Payload of `len` bytes at `start` followed by CRLF.
    fn payload(&self, start: usize, len: usize) -> Result<Option<usize>, ProtocolError> {
        let end = start + len;
        if self.src.len() < end + 2 {
            return Ok(None);
        }
        if self.src.byte_at(end) != Some(b'\r') || self.src.byte_at(end + 1) != Some(b'\n') {
            return Err(ProtocolError::MissingTerminator(end));
        }
        Ok(Some(end + 2))
    }

    fn blob(&self, kind: FrameKind, pos: usize) -> ParseResult {
        let start = pos + 1;
        let Some((cr, next)) = self.line(start)? else {
            return Ok(None);
        };

        let len = match self.declared(start, cr)? {
            Declared::Known(len) => len,
            Declared::Null if kind == FrameKind::BulkString => {
                return Ok(Some(self.finish(Frame::Null, next)));
            }
            Declared::Streamed if kind == FrameKind::BulkString => {
                return self.streamed_string(next);
            }
            _ => return Err(ProtocolError::InvalidLength(self.text(start, cr))),
        };
        self.check_bulk_len(len)?;
        if kind == FrameKind::VerbatimString && len < 4 {
            return Err(ProtocolError::InvalidVerbatim);
        }

        let Some(end) = self.payload(next, len)? else {
            return Ok(None);
        };

        if kind == FrameKind::VerbatimString {
            let mut head = [0u8; 4];
            self.src.copy_to_slice(next, &mut head);
            if head[3] != b':' {
                return Err(ProtocolError::InvalidVerbatim);
            }
            if !self.build {
                return Ok(Some(Parsed { frame: None, end }));
            }
            let text = self.src.slice_bytes(next + 4, len - 4);
            let format = [head[0], head[1], head[2]];
            return Ok(Some(self.finish(Frame::VerbatimString { format, text }, end)));
        }

        if !self.build {
            return Ok(Some(Parsed { frame: None, end }));
        }
        let data = self.src.slice_bytes(next, len);
        let frame = match kind {
            FrameKind::BlobError => Frame::Error(data),
            _ => Frame::BulkString(data),
        };
        Ok(Some(self.finish(frame, end)))
    }

    /// `$?` followed by `;len` chunks and a `;0` terminator.
    fn streamed_string(&self, mut pos: usize) -> ParseResult {
        let mut total = 0usize;
        let mut data = self.build.then(BytesMut::new);

        loop {
            let Some(prefix) = self.src.byte_at(pos) else {
                return Ok(None);
            };
            if prefix != b';' {
                return Err(ProtocolError::InvalidStreamChunk(prefix as char));
            }
            let start = pos + 1;
            let Some((cr, next)) = self.line(start)? else {
                return Ok(None);
            };
            let len = match self.declared(start, cr)? {
                Declared::Known(len) => len,
                _ => return Err(ProtocolError::InvalidLength(self.text(start, cr))),
            };
            if len == 0 {
                let frame = Frame::BulkString(data.map(BytesMut::freeze).unwrap_or_default());
                return Ok(Some(self.finish(frame, next)));
            }

            total = total.saturating_add(len);
            self.check_bulk_len(total)?;
            let Some(end) = self.payload(next, len)? else {
                return Ok(None);
            };
            if let Some(buf) = data.as_mut() {
                let offset = buf.len();
                buf.resize(offset + len, 0);
                self.src.copy_to_slice(next, &mut buf[offset..]);
            }
            pos = end;
        }
    }

    fn aggregate(&self, kind: FrameKind, pos: usize, depth: usize) -> ParseResult {
        let start = pos + 1;
        let Some((cr, next)) = self.line(start)? else {
            return Ok(None);
        };
        if depth >= self.max_depth {
            return Err(ProtocolError::NestingTooDeep {
                max: self.max_depth,
            });
        }

        match self.declared(start, cr)? {
            Declared::Null if kind == FrameKind::Array => Ok(Some(self.finish(Frame::Null, next))),
            Declared::Null => Err(ProtocolError::InvalidLength(self.text(start, cr))),
            Declared::Streamed => self.streamed_aggregate(kind, next, depth),
            Declared::Known(count) => {
                let total = count
                    .checked_mul(kind.children_per_entry())
                    .ok_or_else(|| ProtocolError::InvalidLength(self.text(start, cr)))?;
                let mut children = Vec::with_capacity(if self.build { total.min(1024) } else { 0 });
                let mut cursor = next;
                for _ in 0..total {
                    let Some(child) = self.value(cursor, depth + 1)? else {
                        return Ok(None);
                    };
                    cursor = child.end;
                    children.extend(child.frame);
                }
                Ok(Some(self.collect(kind, children, cursor)))
            }
        }
    }

    /// `*?` followed by children and a `.` terminator line.
    fn streamed_aggregate(&self, kind: FrameKind, mut cursor: usize, depth: usize) -> ParseResult {
        let mut children = Vec::new();
        let mut count = 0usize;

        loop {
            let Some(prefix) = self.src.byte_at(cursor) else {
                return Ok(None);
            };
            if prefix == b'.' {
                let Some((cr, next)) = self.line(cursor + 1)? else {
                    return Ok(None);
                };
                if cr != cursor + 1 {
                    return Err(ProtocolError::InvalidLength(self.text(cursor + 1, cr)));
                }
                if count % kind.children_per_entry() != 0 {
                    return Err(ProtocolError::PrematureEnd);
                }
                return Ok(Some(self.collect(kind, children, next)));
            }

            let Some(child) = self.value(cursor, depth + 1)? else {
                return Ok(None);
            };
            cursor = child.end;
            count += 1;
            children.extend(child.frame);
        }
    }

    fn collect(&self, kind: FrameKind, children: Vec<Frame>, end: usize) -> Parsed {
        if !self.build {
            return Parsed { frame: None, end };
        }
        let frame = match kind {
            FrameKind::Map => {
                let mut pairs = Vec::with_capacity(children.len() / 2);
                let mut items = children.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    pairs.push((key, value));
                }
                Frame::Map(pairs)
            }
            FrameKind::Set => Frame::Set(children),
            FrameKind::Push => Frame::Push(children),
            _ => Frame::Array(children),
        };
        Parsed {
            frame: Some(frame),
            end,
        }
    }
}

/// Strict decimal integer: optional `-`, at least one digit, nothing else.
fn parse_integer(text: &[u8]) -> Option<i64> {
    let (negative, digits) = match text.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, text),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value: i64 = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return None;
        }
        let digit = (byte - b'0') as i64;
        value = value.checked_mul(10)?;
        value = if negative {
            value.checked_sub(digit)?
        } else {
            value.checked_add(digit)?
        };
    }
    Some(value)
}

fn parse_double(text: &[u8]) -> Option<f64> {
    match text {
        b"inf" | b"+inf" => Some(f64::INFINITY),
        b"-inf" => Some(f64::NEG_INFINITY),
        b"nan" => Some(f64::NAN),
        _ => {
            let text = std::str::from_utf8(text).ok()?;
            // `parse` also accepts spellings such as "infinity".
            if text.is_empty() || text.bytes().any(|b| b.is_ascii_alphabetic() && b != b'e' && b != b'E') {
                return None;
            }
            text.parse().ok()
        }
    }
}

fn is_big_number(text: &[u8]) -> bool {
    let digits = match text.split_first() {
        Some((b'-', rest)) | Some((b'+', rest)) => rest,
        _ => text,
    };
    !digits.is_empty() && digits.iter().all(u8::is_ascii_digit)
}
