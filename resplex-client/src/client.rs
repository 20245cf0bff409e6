//! High-level client API.

use crate::batch::Batch;
use crate::command::{Command, ReplyParser, RequestFormatter};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionOptions};
use crate::error::{ClientError, UsageError};
use crate::operation::{self, Message, OperationHandle};
use crate::retry::{RetryQueue, RetryStats, RetryTarget};
use crate::router::{hash_slot, Router, ShardRange};
use crate::stream::{Connector, TcpConnector};
use bytes::BytesMut;
use resplex_protocol::{Frame, FrameWriter, PoolStats, SegmentPool};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

/// State shared by a client, its batches and its retry worker.
pub(crate) struct ClientInner {
    config: ClientConfig,
    router: Router,
    retry: Arc<RetryQueue>,
    pushes: broadcast::Sender<Frame>,
    pool: SegmentPool,
    runtime: Handle,
}

impl ClientInner {
    /// Encodes one command into `buf` and creates its operation.
    ///
    /// `buf` is left empty; the payload is split off it.
    pub(crate) fn prepare<R, T>(
        &self,
        buf: &mut BytesMut,
        command: &Command,
        request: R,
        formatter: &impl RequestFormatter<R>,
        parser: impl ReplyParser<T> + 'static,
    ) -> Result<(OperationHandle<T>, Message), ClientError> {
        let name = self.config.commands.resolve(command.name())?;
        let mut args = formatter.format(request);
        if let Some(prefix) = &self.config.key_prefix {
            args.apply_key_prefix(prefix.as_bytes());
        }

        if let Err(e) = FrameWriter::new(buf).write_all(name.as_bytes(), args.as_slice()) {
            buf.clear();
            return Err(e.into());
        }
        let payload = buf.split().freeze();

        let (handle, controller) = operation::create(parser);
        let mut message = Message::new(payload, command.flags(), controller);
        message.slot = args.first_key().map(hash_slot);
        Ok((handle, message))
    }

    /// Routes `messages` and writes them, one merged write per connection.
    pub(crate) async fn dispatch(&self, messages: Vec<Message>) {
        let mut groups: Vec<(Arc<Connection>, Vec<Message>)> = Vec::new();
        for message in messages {
            match self.router.route_message(&message) {
                Ok(conn) => match groups.iter_mut().find(|(c, _)| Arc::ptr_eq(c, &conn)) {
                    Some((_, group)) => group.push(message),
                    None => groups.push((conn, vec![message])),
                },
                Err(err) => self.divert_or_fail(message, err),
            }
        }
        for (conn, group) in groups {
            conn.write_messages(group).await;
        }
    }

    fn divert_or_fail(&self, message: Message, err: ClientError) {
        if !self.retry.is_eligible(&message) {
            message.fail(err);
            return;
        }
        if let Err((message, rejection)) = self.retry.try_enqueue(message) {
            message.fail(rejection);
        }
    }
}

impl RetryTarget for ClientInner {
    fn select(&self, message: &Message) -> Result<Arc<Connection>, ClientError> {
        self.router.route_message(message)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for conn in self.router.connections() {
            conn.shutdown_now();
        }
        self.retry.shutdown();
    }
}

/// Client for RESP servers.
///
/// Operations are pipelined over one connection per endpoint. Use
/// [`Client::send`] for single commands and [`Client::create_batch`] to
/// flush several commands in one write.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects to every configured endpoint over TCP or Unix sockets.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let connector = Arc::new(TcpConnector::new(config.timeouts.connect_timeout()));
        Self::connect_with(config, connector).await
    }

    /// Connects through a custom [`Connector`].
    ///
    /// Succeeds when at least one endpoint is reachable; the others keep
    /// reconnecting in the background when reconnects are enabled.
    pub async fn connect_with(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let runtime = Handle::current();
        let (pushes, _) = broadcast::channel(config.push_channel_capacity);
        let pool = SegmentPool::with_max_idle(
            config.buffers.segment_size,
            config.buffers.max_idle_segments,
        );

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let target: Weak<dyn RetryTarget> = weak.clone();
            ClientInner {
                retry: Arc::new(RetryQueue::new(&config.retry, target)),
                router: Router::new(),
                pushes: pushes.clone(),
                pool: pool.clone(),
                runtime,
                config,
            }
        });
        tokio::spawn(inner.retry.clone().run());

        let options = ConnectionOptions::new(&inner.config, pool, pushes)
            .with_retry(inner.retry.clone());
        let mut last_error = None;
        for endpoint in &inner.config.endpoints {
            let conn = Connection::new(endpoint.as_str(), connector.clone(), options.clone());
            if let Err(e) = conn.open().await {
                tracing::warn!("Failed to connect to {}: {}", endpoint, e);
                last_error = Some(e);
            }
            inner.router.add_connection(conn);
        }

        if !inner.router.is_healthy() {
            return Err(last_error.unwrap_or(ClientError::NoConnectionAvailable));
        }
        tracing::info!(
            "Connected to {} of {} endpoint(s)",
            inner.router.connections().iter().filter(|c| c.is_healthy()).count(),
            inner.config.endpoints.len()
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Sends one command.
    ///
    /// The returned handle resolves with the parsed reply. Routing and
    /// transport failures are reported through the handle; only failures
    /// to build the command (disabled command, encoding) are returned here.
    pub async fn send<R, T>(
        &self,
        command: &Command,
        request: R,
        formatter: &impl RequestFormatter<R>,
        parser: impl ReplyParser<T> + 'static,
    ) -> Result<OperationHandle<T>, ClientError> {
        let mut buf = BytesMut::new();
        let (handle, message) = self
            .inner
            .prepare(&mut buf, command, request, formatter, parser)?;
        self.inner.dispatch(vec![message]).await;
        Ok(handle)
    }

    /// Sends one command to `endpoint`, bypassing slot routing.
    ///
    /// Retries of the command also go to `endpoint`.
    pub async fn send_to<R, T>(
        &self,
        endpoint: &str,
        command: &Command,
        request: R,
        formatter: &impl RequestFormatter<R>,
        parser: impl ReplyParser<T> + 'static,
    ) -> Result<OperationHandle<T>, ClientError> {
        let mut buf = BytesMut::new();
        let (handle, mut message) = self
            .inner
            .prepare(&mut buf, command, request, formatter, parser)?;
        message.pinned = Some(Arc::from(endpoint));
        self.inner.dispatch(vec![message]).await;
        Ok(handle)
    }

    /// Sends one command and awaits its reply within the async timeout.
    ///
    /// On timeout the operation is canceled; its reply is still consumed in
    /// order when it arrives.
    pub async fn execute<R, T>(
        &self,
        command: &Command,
        request: R,
        formatter: &impl RequestFormatter<R>,
        parser: impl ReplyParser<T> + 'static,
    ) -> Result<T, ClientError> {
        let mut handle = self.send(command, request, formatter, parser).await?;
        let timeout = self.inner.config.timeouts.async_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(result) => result,
            Err(_) => {
                handle.cancel();
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends one command from a thread outside the runtime and blocks for
    /// the reply within the sync timeout.
    ///
    /// Requires a multi-threaded runtime. Calling it from inside the runtime
    /// fails with [`UsageError::BlockingInAsyncContext`].
    pub fn send_blocking<R, T>(
        &self,
        command: &Command,
        request: R,
        formatter: &impl RequestFormatter<R>,
        parser: impl ReplyParser<T> + 'static,
    ) -> Result<T, ClientError> {
        if Handle::try_current().is_ok() {
            return Err(UsageError::BlockingInAsyncContext.into());
        }
        let handle = self
            .inner
            .runtime
            .block_on(self.send(command, request, formatter, parser))?;
        handle.wait(self.inner.config.timeouts.sync_timeout())
    }

    /// Creates a batch sized for about `size_hint` commands.
    pub fn create_batch(&self, size_hint: usize) -> Batch {
        Batch::new(self.inner.clone(), size_hint)
    }

    /// Replaces the slot routing table. Returns `false` if it was unchanged.
    pub fn set_routing_table(&self, table: Vec<ShardRange>) -> Result<bool, ClientError> {
        self.inner.router.set_routing_table(table)
    }

    /// Receives RESP3 push frames from every connection.
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<Frame> {
        self.inner.pushes.subscribe()
    }

    /// Whether at least one connection is healthy.
    pub fn is_healthy(&self) -> bool {
        self.inner.router.is_healthy()
    }

    /// Operations awaiting a reply or a retry.
    pub fn outstanding(&self) -> usize {
        let pending: usize = self
            .inner
            .router
            .connections()
            .iter()
            .map(|conn| conn.outstanding())
            .sum();
        pending + self.inner.retry.len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.router.connections()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.inner.retry.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Closes every connection and disposes queued retries.
    pub async fn close(&self) {
        tracing::debug!("Closing client...");
        for conn in self.inner.router.connections() {
            conn.close().await;
        }
        self.inner.retry.shutdown();
        tracing::debug!("Client closed");
    }
}
