//! Frame transports.
//!
//! A transport moves whole [`Frame`]s between peers. It is split into a
//! read half and a write half so the connection's inbound and outbound
//! loops own one each and never contend.
//!
//! - [`StreamTransport`]: any reliable byte stream (TCP, in-memory pipes),
//!   framed with [`FrameCodec`](crate::codec::FrameCodec).
//! - [`DatagramTransport`]: UDP, with fragmentation to the MTU and a
//!   reorder window that restores frame order.

pub mod datagram;
pub mod stream;

use async_trait::async_trait;

use crate::error::FrameError;
use crate::frame::Frame;

pub use datagram::{DatagramTransport, FragmentHeader, ReorderBuffer};
pub use stream::StreamTransport;

/// Loss observed by an unreliable transport since the last call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossReport {
    pub lost: u64,
    pub delivered: u64,
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` on a clean end of stream.
    async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError>;

    /// Frames skipped and delivered since the previous call. Reliable
    /// transports never lose frames.
    fn take_loss(&mut self) -> LossReport {
        LossReport::default()
    }
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), FrameError>;

    /// Flush and release the write side.
    async fn shutdown(&mut self) -> Result<(), FrameError>;
}

pub type BoxFrameSource = Box<dyn FrameSource>;
pub type BoxFrameSink = Box<dyn FrameSink>;

/// A bidirectional frame transport.
pub trait FrameTransport: Send + 'static {
    fn split(self) -> (BoxFrameSource, BoxFrameSink);

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}
