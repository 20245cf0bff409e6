//! # resplex-client
//!
//! Pipelined client for RESP2/RESP3 servers.
//!
//! This crate provides:
//! - One multiplexed connection per endpoint with FIFO reply matching
//! - Typed operation handles that can be awaited or waited on synchronously
//! - Batches flushed in a single write per connection
//! - Automatic reconnection and a bounded retry queue
//! - Hash-slot routing over primaries and replicas
//!
//! ```no_run
//! use resplex_client::{Args, Client, ClientConfig, Command, CommandArgs, StringReply};
//!
//! # async fn run() -> Result<(), resplex_client::ClientError> {
//! const PING: Command = Command::new("PING");
//!
//! let client = Client::connect(ClientConfig::new("127.0.0.1:6379")).await?;
//! let pong = client.execute(&PING, CommandArgs::new(), &Args, StringReply).await?;
//! assert_eq!(pong, "PONG");
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod operation;
pub mod retry;
pub mod router;
pub mod stream;

#[cfg(test)]
mod testing;

pub use batch::Batch;
pub use client::Client;
pub use command::{
    Args, BulkReply, Command, CommandArgs, CommandFlags, IntegerReply, OkReply, RawReply,
    ReplyParser, RequestFormatter, StringReply,
};
pub use config::{
    BufferConfig, ClientConfig, CommandMap, ConfigError, ReconnectConfig, RetryConfig,
    RetryPolicy, TimeoutConfig,
};
pub use connection::{Connection, ConnectionStats};
pub use error::{ClientError, UsageError};
pub use operation::{OperationHandle, Phase};
pub use retry::{RetryQueue, RetryStats};
pub use router::{hash_slot, Router, ShardRange, SlotRange, SLOT_COUNT};
pub use stream::{BoxedTransport, ClientStream, ConnectFuture, Connector, TcpConnector, Transport};

pub use resplex_protocol::{Frame, FrameKind, PoolStats};
