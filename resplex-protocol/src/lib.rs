//! # resplex-protocol
//!
//! RESP2/RESP3 wire protocol for the resplex client.
//!
//! This crate provides:
//! - Pooled, reference-counted segment buffers ([`BufferArena`])
//! - The frame model covering every RESP3 type ([`Frame`])
//! - An incremental decoder with a fast path for short replies ([`FrameReader`])
//! - A command encoder writing into any [`FrameSink`] ([`FrameWriter`])

pub mod arena;
pub mod error;
pub mod frame;
pub mod reader;
pub mod writer;

pub use arena::{BufferArena, BufferChain, ChainRef, PoolStats, SegmentPool, DEFAULT_SEGMENT_SIZE};
pub use error::ProtocolError;
pub use frame::{Frame, FrameKind};
pub use reader::{FrameReader, ReadStatus, DEFAULT_MAX_BULK_LEN, DEFAULT_MAX_DEPTH};
pub use writer::{encode_command, estimate_command, Arg, FrameSink, FrameWriter, EMPTY_BULK, NULL_BULK};

/// Default port of a RESP server.
pub const DEFAULT_PORT: u16 = 6379;
