//! Byte-stream framing via `tokio_util::codec`.
//!
//! `Decoder::decode` yields `Ok(None)` while more bytes are needed and
//! `Err(FrameError)` for anything that makes the stream untrustworthy
//! (bad checksum, oversized length). The length is checked against the
//! configured maximum as soon as the header is complete, before a single
//! payload byte is buffered.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::frame::{Frame, MAX_FRAME_SIZE};
use crate::header::{FrameHeader, FrameHeaderBytes, HEADER_SIZE};

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    /// Header of a frame whose payload has not fully arrived yet.
    pending: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            pending: None,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

/// Parse a header and apply the size guard.
pub fn read_header(bytes: &[u8], max_frame_size: usize) -> Result<FrameHeader, FrameError> {
    let mut raw: FrameHeaderBytes = [0; HEADER_SIZE];
    raw.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = FrameHeader::from_bytes(&raw)?;
    let size = header.payload_length as usize;
    if size > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }
    Ok(header)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let header = read_header(&src[..], self.max_frame_size)?;
                src.advance(HEADER_SIZE);
                src.reserve(header.payload_length as usize);
                self.pending = Some(header);
                header
            }
        };

        let len = header.payload_length as usize;
        if src.len() < len {
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { header, payload }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(FrameError::Truncated(buf.len())),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: item.payload.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(item.wire_len());
        dst.extend_from_slice(&item.header.to_bytes());
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
