//! End-to-end pipelining against an in-memory server.

use resplex_client::{
    Args, BoxedTransport, BulkReply, Client, ClientConfig, ClientError, Command, CommandArgs,
    CommandFlags, ConnectFuture, Connector, OkReply, StringReply,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const PING: Command = Command::new("PING");
const GET: Command = Command::new("GET");
const SET: Command = Command::new("SET");

struct Pipes {
    servers: mpsc::UnboundedSender<DuplexStream>,
}

impl Connector for Pipes {
    fn connect<'a>(&'a self, endpoint: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.servers
                .send(server)
                .map_err(|_| ClientError::ConnectionLost(endpoint.to_string()))?;
            Ok(Box::new(client) as BoxedTransport)
        })
    }
}

async fn connect(config: ClientConfig) -> (Client, DuplexStream) {
    let (servers, mut accepted) = mpsc::unbounded_channel();
    let client = Client::connect_with(config, Arc::new(Pipes { servers }))
        .await
        .unwrap();
    let server = accepted.recv().await.unwrap();
    (client, server)
}

fn config() -> ClientConfig {
    ClientConfig::new("resp.test:6379").with_reconnect(false)
}

async fn expect(server: &mut DuplexStream, bytes: &[u8]) {
    let mut buf = vec![0u8; bytes.len()];
    tokio::time::timeout(Duration::from_secs(5), server.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, bytes);
}

fn key(key: &'static str) -> CommandArgs {
    CommandArgs::new().key(key)
}

fn key_value((k, v): (&'static str, &'static str)) -> CommandArgs {
    CommandArgs::new().key(k).arg(v)
}

#[tokio::test]
async fn test_ping_pong() {
    let (client, mut server) = connect(config()).await;
    let handle = client
        .send(&PING, CommandArgs::new(), &Args, StringReply)
        .await
        .unwrap();
    expect(&mut server, b"*1\r\n$4\r\nPING\r\n").await;
    server.write_all(b"+PONG\r\n").await.unwrap();
    assert_eq!(handle.await.unwrap(), "PONG");
}

#[tokio::test]
async fn test_get_missing_key_is_null() {
    let (client, mut server) = connect(config()).await;
    let handle = client
        .send(&GET, "missing-key", &key, BulkReply)
        .await
        .unwrap();
    expect(&mut server, b"*2\r\n$3\r\nGET\r\n$11\r\nmissing-key\r\n").await;
    server.write_all(b"$-1\r\n").await.unwrap();
    assert_eq!(handle.await.unwrap(), None);
}

#[tokio::test]
async fn test_batch_set_get() {
    let (client, mut server) = connect(config()).await;
    let mut batch = client.create_batch(2);
    let stored = batch.write(&SET, ("k", "v"), &key_value, OkReply).unwrap();
    let value = batch.write(&GET, "k", &key, StringReply).unwrap();
    batch.flush().await;

    expect(
        &mut server,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n",
    )
    .await;
    // Both payloads went out in one transport write.
    assert_eq!(client.connections()[0].stats().write_calls, 1);

    server.write_all(b"+OK\r\n$1\r\nv\r\n").await.unwrap();
    assert!(stored.await.unwrap());
    assert_eq!(value.await.unwrap(), "v");
}

#[tokio::test]
async fn test_replies_resolve_in_send_order() {
    let (client, mut server) = connect(config()).await;
    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(
            client
                .send(&PING, CommandArgs::new(), &Args, StringReply)
                .await
                .unwrap(),
        );
    }
    expect(&mut server, &b"*1\r\n$4\r\nPING\r\n".repeat(3)).await;
    server.write_all(b"+A\r\n+B\r\n+C\r\n").await.unwrap();

    // Observe out of order; matching is still FIFO.
    let c = handles.pop().unwrap();
    let b = handles.pop().unwrap();
    let a = handles.pop().unwrap();
    assert_eq!(c.await.unwrap(), "C");
    assert_eq!(a.await.unwrap(), "A");
    assert_eq!(b.await.unwrap(), "B");
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn test_lost_connection_does_not_retry_sent_or_no_retry() {
    let (client, mut server) = connect(config()).await;
    let no_retry = Command::new("INCR").with_flags(CommandFlags::new().with_no_retry());
    let incr = client.send(&no_retry, "n", &key, OkReply).await.unwrap();
    let ping = client
        .send(&PING, CommandArgs::new(), &Args, StringReply)
        .await
        .unwrap();
    expect(
        &mut server,
        b"*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n*1\r\n$4\r\nPING\r\n",
    )
    .await;
    drop(server);

    assert!(matches!(incr.await, Err(ClientError::ConnectionLost(_))));
    // Already sent, so the default policy does not retry it.
    assert!(matches!(ping.await, Err(ClientError::ConnectionLost(_))));
    assert_eq!(client.retry_stats().queued, 0);
    assert!(!client.is_healthy());
}

#[tokio::test]
async fn test_server_error_reply() {
    let (client, mut server) = connect(config()).await;
    let handle = client.send(&GET, "k", &key, BulkReply).await.unwrap();
    expect(&mut server, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
    server
        .write_all(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n")
        .await
        .unwrap();
    match handle.await {
        Err(ClientError::Server { message }) => assert!(message.starts_with("WRONGTYPE")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(client.is_healthy());
}
