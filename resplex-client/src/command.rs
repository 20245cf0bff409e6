//! Command model: names, flags, arguments, and reply parsing.

use crate::error::ClientError;
use bytes::Bytes;
use resplex_protocol::{Arg, Frame};
use std::borrow::Cow;
use std::fmt;

/// Command flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CommandFlags(u8);

impl CommandFlags {
    pub const NONE: u8 = 0;
    /// Never replay after a failure.
    pub const NO_RETRY: u8 = 0x01;
    /// May be served by a replica.
    pub const REPLICA_OK: u8 = 0x02;
    /// Administrative or internal command.
    pub const ADMIN: u8 = 0x04;

    pub fn new() -> Self {
        Self(Self::NONE)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn with_no_retry(mut self) -> Self {
        self.0 |= Self::NO_RETRY;
        self
    }

    pub fn with_replica_ok(mut self) -> Self {
        self.0 |= Self::REPLICA_OK;
        self
    }

    pub fn with_admin(mut self) -> Self {
        self.0 |= Self::ADMIN;
        self
    }

    pub fn is_no_retry(&self) -> bool {
        self.contains(Self::NO_RETRY)
    }

    pub fn is_replica_ok(&self) -> bool {
        self.contains(Self::REPLICA_OK)
    }

    pub fn is_admin(&self) -> bool {
        self.contains(Self::ADMIN)
    }
}

impl fmt::Debug for CommandFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_no_retry() {
            names.push("NO_RETRY");
        }
        if self.is_replica_ok() {
            names.push("REPLICA_OK");
        }
        if self.is_admin() {
            names.push("ADMIN");
        }
        write!(f, "CommandFlags({})", names.join(" | "))
    }
}

/// A command name with its routing and retry flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: Cow<'static, str>,
    flags: CommandFlags,
}

impl Command {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            flags: CommandFlags(CommandFlags::NONE),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            flags: CommandFlags::new(),
        }
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }
}

/// Arguments following the command name.
///
/// Arguments added with [`CommandArgs::key`] receive the configured key
/// prefix, and the first of them selects the hash slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandArgs {
    args: Vec<Arg>,
    keys: Vec<usize>,
}

impl CommandArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            args: Vec::with_capacity(capacity),
            keys: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Arg>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn key(mut self, key: impl Into<Arg>) -> Self {
        self.keys.push(self.args.len());
        self.args.push(key.into());
        self
    }

    pub fn push(&mut self, value: impl Into<Arg>) {
        self.args.push(value.into());
    }

    pub fn push_key(&mut self, key: impl Into<Arg>) {
        self.keys.push(self.args.len());
        self.args.push(key.into());
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn as_slice(&self) -> &[Arg] {
        &self.args
    }

    /// Bytes of the first key argument.
    pub fn first_key(&self) -> Option<&[u8]> {
        let idx = *self.keys.first()?;
        match &self.args[idx] {
            Arg::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// Prepends `prefix` to every key argument.
    pub fn apply_key_prefix(&mut self, prefix: &[u8]) {
        if prefix.is_empty() {
            return;
        }
        for &idx in &self.keys {
            let arg = std::mem::replace(&mut self.args[idx], Arg::Null);
            self.args[idx] = arg.with_prefix(prefix);
        }
    }
}

/// Turns a request value into command arguments.
pub trait RequestFormatter<R> {
    fn format(&self, request: R) -> CommandArgs;
}

impl<R, F> RequestFormatter<R> for F
where
    F: Fn(R) -> CommandArgs,
{
    fn format(&self, request: R) -> CommandArgs {
        self(request)
    }
}

/// Formatter for requests that already are [`CommandArgs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Args;

impl RequestFormatter<CommandArgs> for Args {
    fn format(&self, request: CommandArgs) -> CommandArgs {
        request
    }
}

/// Turns a non-error reply frame into a typed result.
pub trait ReplyParser<T>: Send + Sync {
    fn parse(&self, frame: Frame) -> Result<T, ClientError>;
}

impl<T, F> ReplyParser<T> for F
where
    F: Fn(Frame) -> Result<T, ClientError> + Send + Sync,
{
    fn parse(&self, frame: Frame) -> Result<T, ClientError> {
        self(frame)
    }
}

fn unexpected(expected: &str, frame: &Frame) -> ClientError {
    ClientError::UnexpectedReply(format!("expected {}, got {:?}", expected, frame.kind()))
}

/// Returns the frame unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawReply;

impl ReplyParser<Frame> for RawReply {
    fn parse(&self, frame: Frame) -> Result<Frame, ClientError> {
        Ok(frame)
    }
}

/// `+OK` as `true`, null as `false` (a conditional write that did not apply).
#[derive(Debug, Clone, Copy, Default)]
pub struct OkReply;

impl ReplyParser<bool> for OkReply {
    fn parse(&self, frame: Frame) -> Result<bool, ClientError> {
        match &frame {
            Frame::SimpleString(text) if &text[..] == b"OK" => Ok(true),
            Frame::Null => Ok(false),
            _ => Err(unexpected("OK", &frame)),
        }
    }
}

/// Simple or bulk string payload, `None` for null.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkReply;

impl ReplyParser<Option<Bytes>> for BulkReply {
    fn parse(&self, frame: Frame) -> Result<Option<Bytes>, ClientError> {
        match frame {
            Frame::Null => Ok(None),
            Frame::BulkString(data) | Frame::SimpleString(data) => Ok(Some(data)),
            Frame::VerbatimString { text, .. } => Ok(Some(text)),
            other => Err(unexpected("a string", &other)),
        }
    }
}

/// Integer reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerReply;

impl ReplyParser<i64> for IntegerReply {
    fn parse(&self, frame: Frame) -> Result<i64, ClientError> {
        match frame {
            Frame::Integer(n) => Ok(n),
            other => Err(unexpected("an integer", &other)),
        }
    }
}

/// UTF-8 text of a simple or bulk string.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringReply;

impl ReplyParser<String> for StringReply {
    fn parse(&self, frame: Frame) -> Result<String, ClientError> {
        let text = frame.as_str().ok_or_else(|| unexpected("UTF-8 text", &frame))?;
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = CommandFlags::new().with_no_retry().with_admin();
        assert!(flags.is_no_retry());
        assert!(flags.is_admin());
        assert!(!flags.is_replica_ok());
        assert_eq!(flags.bits(), 0x05);
        assert_eq!(format!("{:?}", flags), "CommandFlags(NO_RETRY | ADMIN)");
    }

    #[test]
    fn test_args_key_prefix() {
        let mut args = CommandArgs::new().key("user:1").arg("name").arg(5i64);
        args.apply_key_prefix(b"app:");
        assert_eq!(args.first_key(), Some(&b"app:user:1"[..]));
        assert_eq!(args.as_slice()[1], Arg::from("name"));
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_closure_formatter() {
        let formatter = |(key, value): (&'static str, &'static str)| {
            CommandArgs::new().key(key).arg(value)
        };
        let args = formatter.format(("k", "v"));
        assert_eq!(args, CommandArgs::new().key("k").arg("v"));
        assert_eq!(Args.format(args.clone()), args);
    }

    #[test]
    fn test_builtin_parsers() {
        assert!(OkReply.parse(Frame::simple("OK")).unwrap());
        assert!(!OkReply.parse(Frame::Null).unwrap());
        assert!(matches!(
            OkReply.parse(Frame::Integer(1)),
            Err(ClientError::UnexpectedReply(_))
        ));

        assert_eq!(BulkReply.parse(Frame::Null).unwrap(), None);
        assert_eq!(
            BulkReply.parse(Frame::bulk("v")).unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(IntegerReply.parse(Frame::Integer(9)).unwrap(), 9);
        assert_eq!(StringReply.parse(Frame::simple("PONG")).unwrap(), "PONG");
        assert_eq!(RawReply.parse(Frame::Null).unwrap(), Frame::Null);
    }
}
