//! In-memory transports and helpers for unit tests.

use crate::command::{CommandFlags, RawReply};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionOptions};
use crate::error::ClientError;
use crate::operation::{self, Message, OperationHandle};
use crate::stream::{BoxedTransport, ConnectFuture, Connector};
use bytes::Bytes;
use resplex_protocol::{Frame, SegmentPool};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Hands the server half of every dialed duplex pipe to the test.
pub(crate) struct DuplexConnector {
    servers: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        (Arc::new(Self { servers }), accepted)
    }
}

impl Connector for DuplexConnector {
    fn connect<'a>(&'a self, _endpoint: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
            self.servers
                .send(server)
                .map_err(|_| ClientError::ConnectionLost("test server is gone".to_string()))?;
            Ok(Box::new(client) as BoxedTransport)
        })
    }
}

/// Connection options with small segments and no reconnects.
pub(crate) fn options(pushes: broadcast::Sender<Frame>) -> ConnectionOptions {
    let config = ClientConfig::default().with_reconnect(false);
    ConnectionOptions::new(&config, SegmentPool::new(4096), pushes)
}

/// An open connection and the server side of its transport.
pub(crate) async fn connection(endpoint: &str) -> (Arc<Connection>, DuplexStream) {
    let (pushes, _) = broadcast::channel(16);
    connection_with(endpoint, options(pushes)).await
}

pub(crate) async fn connection_with(
    endpoint: &str,
    options: ConnectionOptions,
) -> (Arc<Connection>, DuplexStream) {
    let (connector, mut servers) = DuplexConnector::new();
    let conn = Connection::new(endpoint, connector, options);
    conn.open().await.expect("duplex connect");
    let server = servers.recv().await.expect("server half");
    (conn, server)
}

/// A connection that never had a transport.
pub(crate) fn dead_connection(endpoint: &str) -> Arc<Connection> {
    let (connector, _servers) = DuplexConnector::new();
    let (pushes, _) = broadcast::channel(16);
    Connection::new(endpoint, connector, options(pushes))
}

pub(crate) fn message(payload: &'static [u8]) -> (OperationHandle<Frame>, Message) {
    flagged(payload, CommandFlags::new())
}

pub(crate) fn flagged(
    payload: &'static [u8],
    flags: CommandFlags,
) -> (OperationHandle<Frame>, Message) {
    let (handle, controller) = operation::create(RawReply);
    (handle, Message::new(Bytes::from_static(payload), flags, controller))
}

pub(crate) async fn read_exact(server: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    server.read_exact(&mut buf).await.expect("server read");
    buf
}
