//! Batched sends.

use crate::client::ClientInner;
use crate::command::{Command, ReplyParser, RequestFormatter};
use crate::error::ClientError;
use crate::operation::{Message, OperationHandle};
use bytes::BytesMut;
use std::sync::Arc;

/// Rough bytes per command used to size the serialization buffer.
const BYTES_PER_COMMAND: usize = 64;

/// Collects commands and sends them together.
///
/// Commands written to a batch are serialized immediately but stay in
/// `Created` until [`Batch::flush`]; waiting on their handles before that
/// fails with [`UsageError::NotYetSent`](crate::UsageError::NotYetSent).
/// On flush, every command bound for one connection goes out in a single
/// write.
///
/// Dropping a batch with unflushed commands fails them with
/// [`ClientError::Disposed`].
pub struct Batch {
    inner: Arc<ClientInner>,
    buffer: BytesMut,
    messages: Vec<Message>,
}

impl Batch {
    pub(crate) fn new(inner: Arc<ClientInner>, size_hint: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(size_hint.saturating_mul(BYTES_PER_COMMAND)),
            messages: Vec::with_capacity(size_hint),
        }
    }

    /// Adds a command without sending it.
    pub fn write<R, T>(
        &mut self,
        command: &Command,
        request: R,
        formatter: &impl RequestFormatter<R>,
        parser: impl ReplyParser<T> + 'static,
    ) -> Result<OperationHandle<T>, ClientError> {
        let (handle, message) = self
            .inner
            .prepare(&mut self.buffer, command, request, formatter, parser)?;
        self.messages.push(message);
        Ok(handle)
    }

    /// Reserves room for `additional` more commands.
    pub fn ensure_capacity(&mut self, additional: usize) {
        self.messages.reserve(additional);
        self.buffer.reserve(additional.saturating_mul(BYTES_PER_COMMAND));
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sends every pending command.
    ///
    /// The batch is empty afterwards and can be reused.
    pub async fn flush(&mut self) {
        if self.messages.is_empty() {
            return;
        }
        let messages = std::mem::take(&mut self.messages);
        tracing::trace!("Flushing batch of {} commands", messages.len());
        self.inner.dispatch(messages).await;
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if self.messages.is_empty() {
            return;
        }
        tracing::debug!(
            "Batch dropped with {} unflushed commands",
            self.messages.len()
        );
        for message in self.messages.drain(..) {
            message.fail(ClientError::Disposed);
        }
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("pending", &self.messages.len())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::client::Client;
    use crate::command::{Args, BulkReply, Command, CommandArgs, OkReply, StringReply};
    use crate::config::ClientConfig;
    use crate::error::{ClientError, UsageError};
    use crate::testing::{read_exact, DuplexConnector};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    const SET: Command = Command::new("SET");
    const GET: Command = Command::new("GET");
    const PING: Command = Command::new("PING");

    fn set(pair: (&'static str, &'static str)) -> CommandArgs {
        CommandArgs::new().key(pair.0).arg(pair.1)
    }

    fn get(key: &'static str) -> CommandArgs {
        CommandArgs::new().key(key)
    }

    async fn client() -> (Client, DuplexStream) {
        let (connector, mut servers) = DuplexConnector::new();
        let config = ClientConfig::new("a").with_reconnect(false);
        let client = Client::connect_with(config, connector).await.unwrap();
        let server = servers.recv().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_flush_writes_once_in_order() {
        let (client, mut server) = client().await;
        let mut batch = client.create_batch(2);
        let stored = batch.write(&SET, ("k", "v"), &set, OkReply).unwrap();
        let value = batch.write(&GET, "k", &get, BulkReply).unwrap();
        assert_eq!(batch.len(), 2);
        batch.flush().await;
        assert!(batch.is_empty());

        let expected = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
        assert_eq!(read_exact(&mut server, expected.len()).await, expected);
        let stats = client.connections()[0].stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.write_calls, 1);

        server.write_all(b"+OK\r\n$1\r\nv\r\n").await.unwrap();
        assert!(stored.await.unwrap());
        assert_eq!(value.await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_wait_before_flush_is_not_yet_sent() {
        let (client, _server) = client().await;
        let mut batch = client.create_batch(1);
        let handle = batch
            .write(&PING, CommandArgs::new(), &Args, StringReply)
            .unwrap();
        assert!(matches!(
            handle.wait(Duration::from_millis(10)),
            Err(ClientError::Usage(UsageError::NotYetSent))
        ));
    }

    #[tokio::test]
    async fn test_drop_disposes_unflushed() {
        let (client, _server) = client().await;
        let mut batch = client.create_batch(0);
        batch.ensure_capacity(4);
        let first = batch
            .write(&PING, CommandArgs::new(), &Args, StringReply)
            .unwrap();
        let second = batch
            .write(&PING, CommandArgs::new(), &Args, StringReply)
            .unwrap();
        drop(batch);

        assert!(matches!(first.await, Err(ClientError::Disposed)));
        assert!(matches!(second.await, Err(ClientError::Disposed)));
        assert_eq!(client.connections()[0].stats().flushes, 0);
    }

    #[tokio::test]
    async fn test_reuse_after_flush() {
        let (client, mut server) = client().await;
        let mut batch = client.create_batch(1);
        let first = batch
            .write(&PING, CommandArgs::new(), &Args, StringReply)
            .unwrap();
        batch.flush().await;
        let second = batch
            .write(&PING, CommandArgs::new(), &Args, StringReply)
            .unwrap();
        batch.flush().await;
        // Empty flushes are no-ops.
        batch.flush().await;

        read_exact(&mut server, 28).await;
        server.write_all(b"+ONE\r\n+TWO\r\n").await.unwrap();
        assert_eq!(first.await.unwrap(), "ONE");
        assert_eq!(second.await.unwrap(), "TWO");
        assert_eq!(client.connections()[0].stats().flushes, 2);
    }

    #[tokio::test]
    async fn test_disabled_command_is_not_added() {
        let (connector, _servers) = DuplexConnector::new();
        let config = ClientConfig::new("a")
            .with_reconnect(false)
            .with_disabled_command("KEYS");
        let client = Client::connect_with(config, connector).await.unwrap();
        let mut batch = client.create_batch(1);
        let result = batch.write(&Command::new("KEYS"), "*", &get, StringReply);
        assert!(matches!(result, Err(ClientError::CommandDisabled(_))));
        assert!(batch.is_empty());
    }
}
