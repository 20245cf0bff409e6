//! Connection management.
//!
//! A connection owns one transport. Writers serialize through the write lock
//! and append their operations to the pending FIFO before any byte of them
//! reaches the transport, so the N-th reply read always belongs to the N-th
//! operation written. The read loop is the only consumer of the FIFO.

use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::ClientError;
use crate::operation::{Message, OperationController};
use crate::retry::RetryQueue;
use crate::stream::{BoxedTransport, Connector, Metered, TransportStats};
use parking_lot::Mutex;
use resplex_protocol::{BufferArena, BufferChain, Frame, FrameReader, FrameSink, SegmentPool};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

type Transport = Metered<BoxedTransport>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Settings shared by every connection of a client.
#[derive(Clone)]
pub(crate) struct ConnectionOptions {
    pub pool: SegmentPool,
    pub read_hint: usize,
    pub reconnect: ReconnectConfig,
    pub pushes: broadcast::Sender<Frame>,
    pub retry: Option<Arc<RetryQueue>>,
}

impl ConnectionOptions {
    pub fn new(config: &ClientConfig, pool: SegmentPool, pushes: broadcast::Sender<Frame>) -> Self {
        Self {
            pool,
            read_hint: config.buffers.read_hint,
            reconnect: config.reconnect.clone(),
            pushes,
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: Arc<RetryQueue>) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Merged writes handed to the transport.
    pub flushes: u64,
    /// `poll_write` calls that accepted data.
    pub write_calls: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub frames_read: u64,
    pub pushes: u64,
    pub reconnects: u64,
}

struct WriterState {
    sink: WriteHalf<Transport>,
    /// Gathers the payloads of one merged write.
    staging: BufferArena,
}

/// A multiplexed connection to one endpoint.
pub struct Connection {
    id: u64,
    endpoint: Arc<str>,
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    writer: tokio::sync::Mutex<Option<WriterState>>,
    /// Operations written (or being written) and awaiting their reply.
    pending: Mutex<VecDeque<Message>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped under the write lock whenever a transport is attached.
    generation: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    transport: Arc<TransportStats>,
    flushes: AtomicU64,
    frames_read: AtomicU64,
    pushes: AtomicU64,
    reconnects: AtomicU64,
}

impl Connection {
    /// Creates a connection that is not yet attached to a transport.
    pub(crate) fn new(
        endpoint: impl Into<Arc<str>>,
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.into(),
            connector,
            options,
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            read_task: Mutex::new(None),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            transport: Arc::new(TransportStats::default()),
            flushes: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the connection can accept writes.
    pub fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Operations awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            write_calls: self.transport.write_calls(),
            bytes_written: self.transport.bytes_written(),
            bytes_read: self.transport.bytes_read(),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Dials the endpoint and starts the read loop.
    ///
    /// On failure a reconnect is scheduled when enabled.
    pub async fn open(self: &Arc<Self>) -> Result<(), ClientError> {
        match self.connector.connect(&self.endpoint).await {
            Ok(transport) => {
                self.attach(transport).await;
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Connection to {} failed: {}", self.endpoint, e);
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Installs `transport` and starts its read loop.
    pub async fn attach(self: &Arc<Self>, transport: BoxedTransport) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let (read_half, write_half) =
            tokio::io::split(Metered::new(transport, self.transport.clone()));

        let mut writer = self.writer.lock().await;
        *writer = Some(WriterState {
            sink: write_half,
            staging: BufferArena::new(self.options.pool.clone()),
        });
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(self.clone().read_loop(read_half, generation));
        if let Some(previous) = self.read_task.lock().replace(task) {
            previous.abort();
        }
        tracing::debug!("Connection {} attached to {}", self.id, self.endpoint);
    }

    /// Writes `messages` as one merged write, in order.
    ///
    /// Operations canceled before this point are skipped. Failures are
    /// reported through each operation, never returned.
    ///
    /// The write runs on its own task: dropping the returned future does not
    /// stop a frame halfway, so the wire and the pending FIFO stay aligned.
    pub(crate) async fn write_messages(self: &Arc<Self>, messages: Vec<Message>) {
        let conn = self.clone();
        let write = tokio::spawn(async move { conn.write_locked(messages).await });
        if let Err(e) = write.await {
            // The messages were dropped with the task, which cancels them.
            tracing::warn!("Write task on {} did not finish: {}", self.endpoint, e);
        }
    }

    async fn write_locked(self: &Arc<Self>, messages: Vec<Message>) {
        let mut guard = self.writer.lock().await;

        let messages: Vec<Message> = messages
            .into_iter()
            .filter(|message| !message.controller.is_canceled())
            .collect();
        if messages.is_empty() {
            return;
        }

        if guard.is_none() || !self.is_healthy() {
            drop(guard);
            let cause = if self.closed.load(Ordering::SeqCst) {
                ClientError::Disposed
            } else {
                ClientError::WriteFailure(format!("not connected to {}", self.endpoint))
            };
            for message in messages {
                self.divert_or_fail(message, cause.clone());
            }
            return;
        }
        let Some(state) = guard.as_mut() else {
            return;
        };

        let mut written: Vec<OperationController> = Vec::with_capacity(messages.len());
        {
            let mut pending = self.pending.lock();
            for message in messages {
                state.staging.put(&message.payload);
                message.controller.on_queued();
                written.push(message.controller.share());
                pending.push_back(message);
            }
        }

        let chain = state.staging.detach();
        let result = write_chain(&mut state.sink, &chain).await;
        drop(chain);

        match result {
            Ok(()) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                for controller in written {
                    controller.on_sent();
                }
            }
            Err(e) => {
                guard.take();
                drop(guard);
                self.on_broken(ClientError::WriteFailure(e.to_string()));
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<Transport>, generation: u64) {
        let mut inbound = BufferArena::new(self.options.pool.clone());
        let mut frames = FrameReader::new();

        let cause = 'read: loop {
            let buf = inbound.acquire(self.options.read_hint);
            let n = match reader.read(buf).await {
                Ok(0) => break ClientError::ConnectionLost("connection closed by peer".into()),
                Ok(n) => n,
                Err(e) => break ClientError::ConnectionLost(e.to_string()),
            };
            inbound.commit(n);

            loop {
                match frames.read(inbound.readable()) {
                    Ok(Some((frame, consumed))) => {
                        inbound.advance(consumed);
                        if let Err(e) = self.dispatch(frame) {
                            break 'read e;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => break 'read ClientError::Protocol(e),
                }
            }
        };

        let mut writer = self.writer.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        writer.take();
        drop(writer);
        self.on_broken(cause);
    }

    fn dispatch(&self, frame: Frame) -> Result<(), ClientError> {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        if frame.is_push() {
            self.pushes.fetch_add(1, Ordering::Relaxed);
            // No subscribers is fine.
            let _ = self.options.pushes.send(frame);
            return Ok(());
        }

        let head = self.pending.lock().pop_front();
        match head {
            Some(message) => {
                message.controller.try_set_result(frame);
                Ok(())
            }
            None => Err(ClientError::UnexpectedReply(
                "reply without a pending operation".to_string(),
            )),
        }
    }

    /// Tears down after a transport failure. Only the first caller per
    /// transport does the work.
    fn on_broken(self: &Arc<Self>, cause: ClientError) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }

        let drained: Vec<Message> = self.pending.lock().drain(..).collect();
        tracing::warn!(
            "Connection {} to {} lost: {} ({} operations outstanding)",
            self.id,
            self.endpoint,
            cause,
            drained.len()
        );

        let reason = match &cause {
            ClientError::ConnectionLost(reason) | ClientError::WriteFailure(reason) => reason.clone(),
            other => other.to_string(),
        };
        let fatal = matches!(
            cause,
            ClientError::Protocol(_) | ClientError::UnexpectedReply(_)
        );
        for message in drained {
            let err = if !message.controller.was_sent() {
                ClientError::WriteFailure(reason.clone())
            } else if fatal {
                cause.clone()
            } else {
                ClientError::ConnectionLost(reason.clone())
            };
            self.divert_or_fail(message, err);
        }

        self.schedule_reconnect();
    }

    /// Hands a failed operation to the retry queue when eligible.
    fn divert_or_fail(&self, message: Message, err: ClientError) {
        let divertable = matches!(
            err,
            ClientError::ConnectionLost(_) | ClientError::WriteFailure(_)
        );
        if let (true, Some(retry)) = (divertable, &self.options.retry) {
            if retry.is_eligible(&message) {
                if let Err((message, rejection)) = retry.try_enqueue(message) {
                    message.fail(rejection);
                }
                return;
            }
        }
        message.fail(err);
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.options.reconnect.enabled || self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let policy = self.options.reconnect.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                tokio::time::sleep(policy.delay(attempt)).await;
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                if conn.closed.load(Ordering::SeqCst) {
                    conn.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }

                match conn.connector.connect(&conn.endpoint).await {
                    Ok(transport) => {
                        conn.reconnecting.store(false, Ordering::SeqCst);
                        conn.attach(transport).await;
                        conn.reconnects.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            "Reconnected to {} after {} attempt(s)",
                            conn.endpoint,
                            attempt + 1
                        );
                        if let Some(retry) = &conn.options.retry {
                            retry.notify_reconnected();
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::debug!("Reconnect to {} failed: {}", conn.endpoint, e);
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        });
    }

    /// Closes the connection and fails outstanding operations with
    /// [`ClientError::Disposed`].
    pub async fn close(&self) {
        tracing::debug!("Closing connection {} to {}", self.id, self.endpoint);
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);

        let state = self.writer.lock().await.take();
        if let Some(mut state) = state {
            let _ = state.sink.shutdown().await;
        }
        self.shutdown_now();
    }

    /// Synchronous part of [`close`](Self::close).
    pub(crate) fn shutdown_now(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        let drained: Vec<Message> = self.pending.lock().drain(..).collect();
        for message in drained {
            message.fail(ClientError::Disposed);
        }
    }
}

async fn write_chain(sink: &mut WriteHalf<Transport>, chain: &BufferChain) -> io::Result<()> {
    for chunk in chain.chunks() {
        sink.write_all(chunk).await?;
    }
    sink.flush().await
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("healthy", &self.is_healthy())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandFlags, RawReply};
    use crate::error::UsageError;
    use crate::operation::{self, Phase};
    use bytes::Bytes;
    use resplex_protocol::{encode_command, Arg};
    use crate::testing::{connection, dead_connection, message, read_exact, DuplexConnector};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let (conn, mut server) = connection("a").await;
        let (handle, msg) = message(PING);
        conn.write_messages(vec![msg]).await;

        assert_eq!(read_exact(&mut server, PING.len()).await, PING);
        server.write_all(b"+PONG\r\n").await.unwrap();
        assert_eq!(handle.await.unwrap(), Frame::simple("PONG"));
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_replies_in_one_read_resolve_fifo() {
        let (conn, mut server) = connection("a").await;
        let (a, ma) = message(b"*2\r\n$4\r\nINCR\r\n$1\r\na\r\n");
        let (b, mb) = message(b"*2\r\n$4\r\nINCR\r\n$1\r\nb\r\n");
        let (c, mc) = message(b"*2\r\n$4\r\nINCR\r\n$1\r\nc\r\n");
        conn.write_messages(vec![ma]).await;
        conn.write_messages(vec![mb]).await;
        conn.write_messages(vec![mc]).await;
        assert_eq!(conn.outstanding(), 3);

        server.write_all(b":1\r\n:2\r\n:3\r\n").await.unwrap();
        // Observe out of order; matching is by send order.
        assert_eq!(c.await.unwrap(), Frame::Integer(3));
        assert_eq!(a.await.unwrap(), Frame::Integer(1));
        assert_eq!(b.await.unwrap(), Frame::Integer(2));
    }

    #[tokio::test]
    async fn test_merged_write_is_one_transport_write() {
        let (conn, mut server) = connection("a").await;
        let (first, m1) = message(b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n");
        let (second, m2) = message(b"*2\r\n$3\r\nGET\r\n$1\r\ny\r\n");
        conn.write_messages(vec![m1, m2]).await;

        let stats = conn.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.write_calls, 1);
        assert_eq!(
            read_exact(&mut server, 40).await,
            b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n*2\r\n$3\r\nGET\r\n$1\r\ny\r\n"
        );
        assert_eq!(first.phase(), Phase::Sent);
        assert_eq!(second.phase(), Phase::Sent);
    }

    #[tokio::test]
    async fn test_abandoned_write_keeps_frames_whole() {
        let (conn, mut server) = connection("a").await;
        let value = Bytes::from(vec![b'x'; 100 * 1024]);
        let payload = encode_command(b"SET", &[Arg::from("k"), Arg::from(value)]).unwrap();
        let (set, controller) = operation::create(RawReply);
        let msg = Message::new(payload.clone(), CommandFlags::new(), controller);

        // The server is not reading, so the write outlives the caller's timeout.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), conn.write_messages(vec![msg])).await;
        assert!(abandoned.is_err());
        assert_eq!(conn.outstanding(), 1);

        let (ping, msg) = message(PING);
        let (_, received) = tokio::join!(
            conn.write_messages(vec![msg]),
            read_exact(&mut server, payload.len() + PING.len())
        );
        assert_eq!(&received[..payload.len()], &payload[..]);
        assert_eq!(&received[payload.len()..], PING);

        server.write_all(b"+OK\r\n+PONG\r\n").await.unwrap();
        assert_eq!(set.await.unwrap(), Frame::simple("OK"));
        assert_eq!(ping.await.unwrap(), Frame::simple("PONG"));
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_multi_segment_write_is_contiguous() {
        let (conn, mut server) = connection("a").await;
        // Larger than one 4 KiB test segment.
        let value = Bytes::from(vec![b'y'; 10 * 1024]);
        let payload = encode_command(b"SET", &[Arg::from("big"), Arg::from(value)]).unwrap();
        let (handle, controller) = operation::create(RawReply);
        let msg = Message::new(payload.clone(), CommandFlags::new(), controller);

        let (_, received) = tokio::join!(
            conn.write_messages(vec![msg]),
            read_exact(&mut server, payload.len())
        );
        assert_eq!(received, payload.to_vec());
        assert_eq!(conn.stats().flushes, 1);
        assert_eq!(conn.stats().bytes_written, payload.len() as u64);

        server.write_all(b"+OK\r\n").await.unwrap();
        assert_eq!(handle.await.unwrap(), Frame::simple("OK"));
    }

    #[tokio::test]
    async fn test_push_frames_bypass_fifo() {
        let (conn, mut server) = connection("a").await;
        let mut pushes = conn.options.pushes.subscribe();
        let (handle, msg) = message(PING);
        conn.write_messages(vec![msg]).await;

        server
            .write_all(b">2\r\n$7\r\nmessage\r\n$2\r\nhi\r\n+PONG\r\n")
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), Frame::simple("PONG"));
        let push = pushes.recv().await.unwrap();
        assert!(push.is_push());
        assert_eq!(push.children().map(|c| c.len()), Some(2));
        assert_eq!(conn.stats().pushes, 1);
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection() {
        let (conn, mut server) = connection("a").await;
        let (failing, m1) = message(b"*1\r\n$3\r\nBAD\r\n");
        let (ok, m2) = message(PING);
        conn.write_messages(vec![m1]).await;
        conn.write_messages(vec![m2]).await;

        server.write_all(b"-ERR unknown command\r\n+PONG\r\n").await.unwrap();
        assert!(matches!(failing.await, Err(ClientError::Server { .. })));
        assert_eq!(ok.await.unwrap(), Frame::simple("PONG"));
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_protocol_error_fails_outstanding() {
        let (conn, mut server) = connection("a").await;
        let (a, ma) = message(PING);
        let (b, mb) = message(PING);
        conn.write_messages(vec![ma, mb]).await;

        server.write_all(b"+PONG\r\n^oops\r\n").await.unwrap();
        assert_eq!(a.await.unwrap(), Frame::simple("PONG"));
        assert!(matches!(b.await, Err(ClientError::Protocol(_))));
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_lost() {
        let (conn, server) = connection("a").await;
        let (handle, msg) = message(PING);
        conn.write_messages(vec![msg]).await;
        drop(server);

        assert!(matches!(handle.await, Err(ClientError::ConnectionLost(_))));
        assert!(!conn.is_healthy());
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_write_without_transport_is_write_failure() {
        let conn = dead_connection("down");
        let (handle, msg) = message(PING);
        conn.write_messages(vec![msg]).await;
        assert!(matches!(handle.await, Err(ClientError::WriteFailure(_))));
    }

    #[tokio::test]
    async fn test_canceled_operation_is_not_written() {
        let (conn, mut server) = connection("a").await;
        let (canceled, m1) = message(b"*1\r\n$4\r\nQUIT\r\n");
        assert!(canceled.cancel());
        let (live, m2) = message(PING);
        conn.write_messages(vec![m1, m2]).await;

        assert_eq!(read_exact(&mut server, PING.len()).await, PING);
        server.write_all(b"+PONG\r\n").await.unwrap();
        assert_eq!(live.await.unwrap(), Frame::simple("PONG"));
        assert!(matches!(canceled.await, Err(ClientError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancel_after_send_keeps_order() {
        let (conn, mut server) = connection("a").await;
        let (abandoned, m1) = message(PING);
        let (next, m2) = message(b"*1\r\n$4\r\nTIME\r\n");
        conn.write_messages(vec![m1, m2]).await;
        abandoned.cancel();

        server.write_all(b"+PONG\r\n:7\r\n").await.unwrap();
        assert_eq!(next.await.unwrap(), Frame::Integer(7));
        assert!(matches!(abandoned.await, Err(ClientError::Canceled)));
    }

    #[tokio::test]
    async fn test_close_disposes_pending() {
        let (conn, _server) = connection("a").await;
        let (handle, msg) = message(PING);
        conn.write_messages(vec![msg]).await;
        conn.close().await;

        assert!(matches!(handle.await, Err(ClientError::Disposed)));
        let (late, msg) = message(PING);
        conn.write_messages(vec![msg]).await;
        assert!(matches!(late.await, Err(ClientError::Disposed)));
    }

    #[tokio::test]
    async fn test_not_yet_written_operation_reports_usage_error() {
        let (handle, _msg) = message(PING);
        assert!(matches!(
            handle.await,
            Err(ClientError::Usage(UsageError::NotYetSent))
        ));
    }

    #[tokio::test]
    async fn test_reconnects_after_loss() {
        let (connector, mut servers) = DuplexConnector::new();
        let (pushes, _) = broadcast::channel(8);
        let mut options = crate::testing::options(pushes);
        options.reconnect = ReconnectConfig {
            enabled: true,
            base_delay_ms: 5,
            max_delay_ms: 20,
        };
        let conn = Connection::new("a", connector, options);
        conn.open().await.unwrap();
        let first = servers.recv().await.unwrap();
        drop(first);

        let mut second = tokio::time::timeout(Duration::from_secs(5), servers.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !conn.is_healthy() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(conn.stats().reconnects, 1);

        let (handle, msg) = message(PING);
        conn.write_messages(vec![msg]).await;
        assert_eq!(read_exact(&mut second, PING.len()).await, PING);
        second.write_all(b"+PONG\r\n").await.unwrap();
        assert_eq!(handle.await.unwrap(), Frame::simple("PONG"));
        conn.close().await;
    }
}
