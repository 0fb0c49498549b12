//! Byte-stream transport built on `tokio_util::codec::Framed`.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::error::FrameError;
use crate::frame::Frame;
use crate::transport::{BoxFrameSink, BoxFrameSource, FrameSink, FrameSource, FrameTransport};

/// Frames over any reliable, ordered byte stream.
pub struct StreamTransport<T> {
    framed: Framed<T, FrameCodec>,
    peer: String,
}

impl<T> StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: T, max_frame_size: usize, peer: impl Into<String>) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new(max_frame_size)),
            peer: peer.into(),
        }
    }
}

impl StreamTransport<tokio::net::TcpStream> {
    /// Wrap an accepted or connected TCP stream.
    pub fn tcp(stream: tokio::net::TcpStream, max_frame_size: usize) -> Self {
        let _ = stream.set_nodelay(true);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        Self::new(stream, max_frame_size, peer)
    }
}

impl<T> FrameTransport for StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn split(self) -> (BoxFrameSource, BoxFrameSink) {
        let (sink, stream) = self.framed.split();
        (Box::new(StreamSource { stream }), Box::new(StreamSink { sink }))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

struct StreamSource<T> {
    stream: SplitStream<Framed<T, FrameCodec>>,
}

#[async_trait]
impl<T> FrameSource for StreamSource<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        self.stream.next().await.transpose()
    }
}

struct StreamSink<T> {
    sink: SplitSink<Framed<T, FrameCodec>, Frame>,
}

#[async_trait]
impl<T> FrameSink for StreamSink<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn write_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        self.sink.send(frame).await
    }

    async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.sink.close().await
    }
}
