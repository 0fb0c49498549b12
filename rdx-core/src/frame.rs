//! The transport-level envelope: one header plus one payload.

use bytes::Bytes;

use crate::header::{FrameHeader, HEADER_SIZE};

/// Default ceiling for a single frame payload (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One serialised message or one bulk chunk, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, fixing the header length to the payload length.
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        header.payload_length = payload.len() as u32;
        Self { header, payload }
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Header followed by payload, as one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}
