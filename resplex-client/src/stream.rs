//! Transports and the connectors that open them.

use crate::error::ClientError;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Anything a connection can speak RESP over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<BoxedTransport, ClientError>> + Send + 'a>>;

/// Opens transports to endpoints.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a str) -> ConnectFuture<'a>;
}

/// A client stream over TCP or a Unix domain socket.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientStream {
    pub fn is_unix(&self) -> bool {
        !matches!(self, ClientStream::Tcp(_))
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            ClientStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            ClientStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            ClientStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            ClientStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Byte and call counters of a [`Metered`] transport.
#[derive(Debug, Default)]
pub struct TransportStats {
    write_calls: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl TransportStats {
    /// Number of `poll_write` calls that accepted data.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

pin_project! {
    /// Wraps a transport and counts its traffic.
    pub struct Metered<S> {
        #[pin]
        inner: S,
        stats: Arc<TransportStats>,
    }
}

impl<S> Metered<S> {
    pub fn new(inner: S, stats: Arc<TransportStats>) -> Self {
        Self { inner, stats }
    }
}

impl<S: AsyncRead> AsyncRead for Metered<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let poll = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            this.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        }
        poll
    }
}

impl<S: AsyncWrite> AsyncWrite for Metered<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let poll = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                this.stats.write_calls.fetch_add(1, Ordering::Relaxed);
                this.stats.bytes_written.fetch_add(*n as u64, Ordering::Relaxed);
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Connects over TCP, or over a Unix socket for `unix:` endpoints.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, endpoint: &str) -> Result<ClientStream, ClientError> {
        #[cfg(unix)]
        if let Some(path) = endpoint.strip_prefix("unix:") {
            let stream = UnixStream::connect(path).await?;
            return Ok(ClientStream::Unix(stream));
        }

        let stream = TcpStream::connect(endpoint).await?;
        // Configure TCP options for better latency
        stream.set_nodelay(true).ok();
        Ok(ClientStream::Tcp(stream))
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, endpoint: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            tracing::debug!("Connecting to {}...", endpoint);
            let stream = tokio::time::timeout(self.connect_timeout, self.open(endpoint))
                .await
                .map_err(|_| {
                    tracing::debug!("Connection to {} timed out", endpoint);
                    ClientError::Timeout
                })??;
            tracing::debug!("Connected to {}", endpoint);
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 14];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"*1\r\n$4\r\nPING\r\n");
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });

        let connector = TcpConnector::new(Duration::from_secs(1));
        let mut transport = connector.connect(&addr).await.unwrap();
        transport.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut reply = [0u8; 7];
        transport.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"+PONG\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_metered_counts_traffic() {
        let (client, mut server) = tokio::io::duplex(1024);
        let stats = Arc::new(TransportStats::default());
        let mut metered = Metered::new(client, stats.clone());

        metered.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        server.write_all(b"+PONG\r\n").await.unwrap();
        let mut reply = [0u8; 7];
        metered.read_exact(&mut reply).await.unwrap();

        assert_eq!(stats.write_calls(), 1);
        assert_eq!(stats.bytes_written(), 14);
        assert_eq!(stats.bytes_read(), 7);
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = TcpConnector::new(Duration::from_secs(1));
        assert!(connector.connect(&addr).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resp.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let connector = TcpConnector::new(Duration::from_secs(1));
        let endpoint = format!("unix:{}", path.display());
        assert!(connector.connect(&endpoint).await.is_ok());
        accept.await.unwrap().unwrap();
    }
}
