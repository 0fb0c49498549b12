//! Domain-specific error types for the rdx engine.
//!
//! Errors are split along the recovery taxonomy of the protocol:
//!
//! - [`FrameError`]: transport-fatal; the connection must close.
//! - [`DecodeError`]: message-recoverable; one message is dropped.
//! - [`EncodeError`]: encode-recoverable; a fallback codec is tried.
//! - [`QueueError`]: backpressure from the outbound queue.
//! - [`HandshakeError`]: no common ground with the peer.
//!
//! [`RdxError`] wraps all of them for operations that can fail in
//! more than one way.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the rdx engine.
#[derive(Debug, Error)]
pub enum RdxError {
    // ── Transport ────────────────────────────────────────────────
    /// A frame-level failure that leaves the byte stream unusable.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The TCP/UDP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The capability exchange failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    // ── Messages ─────────────────────────────────────────────────
    /// A single message could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Encoding or serialisation of an outbound message failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A state transition was attempted from the wrong phase.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Pipeline ─────────────────────────────────────────────────
    /// A pixel encoder failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The outbound queue refused a message.
    #[error(transparent)]
    Queue(#[from] QueueError),

    // ── Lifecycle ────────────────────────────────────────────────
    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The connection is closed.
    #[error("connection closed: {0}")]
    Closed(String),
}

// ── FrameError ────────────────────────────────────────────────────

/// Transport-fatal errors detected while framing bytes.
///
/// Any of these means the stream position can no longer be trusted.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The first header byte is not the frame marker.
    #[error("invalid frame marker: {0:#04x}")]
    InvalidMagic(u8),

    /// The header checksum does not match its contents.
    #[error("header checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The declared payload length exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A header field holds a value this peer does not understand.
    #[error("invalid header field {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },

    /// The byte stream ended in the middle of a frame.
    #[error("truncated frame: {0} bytes left in buffer")]
    Truncated(usize),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// A short reason suitable for a `disconnect` message.
    pub fn reason(&self) -> String {
        match self {
            FrameError::Io(_) => "connection lost".to_string(),
            other => format!("invalid frame: {other}"),
        }
    }
}

// ── DecodeError ───────────────────────────────────────────────────

/// A single message failed to decode. Never fatal for the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to decode {frame_len}-byte frame: {description}")]
pub struct DecodeError {
    /// Byte length of the offending frame payload.
    pub frame_len: usize,
    /// Best-effort description of what went wrong.
    pub description: String,
}

impl DecodeError {
    pub fn new(frame_len: usize, description: impl Into<String>) -> Self {
        Self {
            frame_len,
            description: description.into(),
        }
    }
}

// ── EncodeError ───────────────────────────────────────────────────

/// A pixel encoder could not produce a payload for one region.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The encoder does not handle this pixel layout or geometry.
    #[error("unsupported input for {codec}: {reason}")]
    Unsupported { codec: &'static str, reason: String },

    /// The encoder failed internally.
    #[error("{codec} encoder fault: {reason}")]
    Fault { codec: &'static str, reason: String },

    /// The capture collaborator could not provide pixels.
    #[error("no pixels for window {window_id}: {reason}")]
    Capture { window_id: u64, reason: String },
}

// ── QueueError ────────────────────────────────────────────────────

/// The bounded outbound queue refused a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The priority class is at capacity; the producer should back off.
    #[error("send queue full ({depth} queued)")]
    Full { depth: usize },

    /// The queue has been closed; the connection is going away.
    #[error("send queue closed")]
    Closed,
}

// ── HandshakeError ────────────────────────────────────────────────

/// The peers share no common ground.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("no common compression algorithm")]
    NoCommonCompression,

    #[error("no common picture encoding")]
    NoCommonEncoding,

    #[error("encryption mismatch: {0}")]
    Encryption(&'static str),

    #[error("invalid hello: {0}")]
    InvalidHello(String),

    #[error("peer disconnected during handshake: {0}")]
    PeerDisconnected(String),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RdxError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RdxError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for RdxError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        RdxError::Encoding(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RdxError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RdxError::Timeout(Duration::ZERO)
    }
}
