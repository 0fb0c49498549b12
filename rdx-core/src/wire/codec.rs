//! Message ⇄ frame conversion.
//!
//! The codec is split into a [`WireEncoder`] (owned by the outbound loop)
//! and a [`WireDecoder`] (owned by the inbound loop) so neither loop ever
//! waits on the other.
//!
//! Encoding a message:
//!
//! 1. Large `Bytes` fields are lifted out into bulk frames, one per field,
//!    tagged with `chunk index = field position + 1`. Their slot in the
//!    message is left as an empty byte string. Bulk chunks are never
//!    compressed again (pixel data is already compressed).
//! 2. The remaining message is serialised with `bincode`.
//! 3. If it is large enough, it is compressed with the current algorithm,
//!    which is recorded in the header.
//! 4. If a cipher is active, the result is sealed.
//!
//! Decoding reverses the steps, stashing bulk chunks until the main frame
//! that references them arrives.

use std::collections::BTreeMap;

use bincode::Options;
use tracing::{debug, trace};

use crate::config::ProtocolConfig;
use crate::error::{DecodeError, RdxError};
use crate::flags::FrameFlags;
use crate::frame::Frame;
use crate::header::{FrameHeader, MAX_CHUNK_INDEX};
use crate::message::Message;
use crate::wire::compression::Compression;
use crate::wire::crypto::{Opener, Sealer};
use crate::wire::value::Value;

fn options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new().with_limit(limit as u64)
}

/// Serialise a message without framing, compression or encryption.
pub fn encode_message(message: &Message, max_size: usize) -> Result<Vec<u8>, RdxError> {
    options(max_size).serialize(message).map_err(RdxError::from)
}

/// Inverse of [`encode_message`].
pub fn decode_message(bytes: &[u8], max_size: usize) -> Result<Message, DecodeError> {
    options(max_size)
        .deserialize(bytes)
        .map_err(|e| DecodeError::new(bytes.len(), e.to_string()))
}

/// Serialised size of a message, for diagnostics.
pub fn serialized_len(message: &Message) -> usize {
    bincode::DefaultOptions::new()
        .serialized_size(message)
        .map(|n| n as usize)
        .unwrap_or(0)
}

// ── WireEncoder ──────────────────────────────────────────────────

pub struct WireEncoder {
    compression: Compression,
    level: u8,
    min_compress_size: usize,
    bulk_threshold: usize,
    max_message_size: usize,
    sealer: Option<Sealer>,
}

impl WireEncoder {
    /// An encoder with compression disabled until negotiation completes.
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            compression: Compression::None,
            level: config.compression_level,
            min_compress_size: config.min_compress_size,
            bulk_threshold: config.bulk_threshold,
            max_message_size: config.max_message_size,
            sealer: None,
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    /// Takes effect from the next encoded message.
    pub fn set_compression_level(&mut self, level: u8) {
        self.level = level.clamp(1, 9);
    }

    pub fn set_max_message_size(&mut self, max: usize) {
        self.max_message_size = max;
    }

    pub fn enable_encryption(&mut self, sealer: Sealer) {
        self.sealer = Some(sealer);
    }

    pub fn is_encrypting(&self) -> bool {
        self.sealer.is_some()
    }

    /// Convert a message into its frames: bulk chunks first, main frame last.
    pub fn encode(&mut self, mut message: Message) -> Result<Vec<Frame>, RdxError> {
        let mut frames = Vec::with_capacity(1);

        for (i, field) in message.fields.iter_mut().enumerate() {
            let chunk_index = i + 1;
            if chunk_index > MAX_CHUNK_INDEX as usize {
                break;
            }
            let Value::Bytes(data) = field else { continue };
            if data.len() <= self.bulk_threshold {
                continue;
            }
            if data.len() > self.max_message_size {
                return Err(RdxError::Encoding(format!(
                    "{} field {i} is {} bytes (max {})",
                    message.kind,
                    data.len(),
                    self.max_message_size
                )));
            }
            let data = std::mem::take(data);
            let (flags, payload) = self.seal(FrameFlags::BULK, data)?;
            frames.push(Frame::new(
                FrameHeader::new(flags, Compression::None, chunk_index as u8, 0),
                payload,
            ));
        }

        let raw = encode_message(&message, self.max_message_size)?;
        let (compression, body) = self.compress(raw)?;
        let (flags, payload) = self.seal(FrameFlags::empty(), body)?;
        trace!(
            kind = %message.kind,
            bulk = frames.len(),
            size = payload.len(),
            %compression,
            "encoded message"
        );
        frames.push(Frame::new(FrameHeader::new(flags, compression, 0, 0), payload));
        Ok(frames)
    }

    fn compress(&self, raw: Vec<u8>) -> Result<(Compression, Vec<u8>), RdxError> {
        if self.compression == Compression::None || raw.len() < self.min_compress_size {
            return Ok((Compression::None, raw));
        }
        let packed = self.compression.compress(&raw, self.level)?;
        if packed.len() >= raw.len() {
            return Ok((Compression::None, raw));
        }
        Ok((self.compression, packed))
    }

    fn seal(&mut self, flags: FrameFlags, data: Vec<u8>) -> Result<(FrameFlags, Vec<u8>), RdxError> {
        match self.sealer.as_mut() {
            Some(sealer) => Ok((flags | FrameFlags::ENCRYPTED, sealer.seal(&data)?)),
            None => Ok((flags, data)),
        }
    }
}

// ── WireDecoder ──────────────────────────────────────────────────

pub struct WireDecoder {
    max_message_size: usize,
    opener: Option<Opener>,
    /// Bulk chunks waiting for their main frame, keyed by chunk index.
    pending_chunks: BTreeMap<u8, Vec<u8>>,
    /// Datagram sequence the next frame of the pending message must carry.
    chunk_next: Option<u32>,
}

impl WireDecoder {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            opener: None,
            pending_chunks: BTreeMap::new(),
            chunk_next: None,
        }
    }

    pub fn set_max_message_size(&mut self, max: usize) {
        self.max_message_size = max;
    }

    /// Once enabled, plaintext frames are rejected.
    pub fn enable_encryption(&mut self, opener: Opener) {
        self.opener = Some(opener);
    }

    /// Decode one frame.
    ///
    /// Returns `Ok(None)` for bulk chunks, which are held until the main
    /// frame of their message arrives. Chunks never outlive a failed main
    /// frame, and on sequenced transports a chunk only joins a message
    /// whose frames are contiguous with it.
    pub fn decode(&mut self, frame: Frame) -> Result<Option<Message>, DecodeError> {
        let result = self.decode_frame(frame);
        if result.is_err() {
            self.discard_chunks("message failed to decode");
        }
        result
    }

    fn decode_frame(&mut self, frame: Frame) -> Result<Option<Message>, DecodeError> {
        let frame_len = frame.payload.len();
        let header = frame.header;
        let sequence = header.flags.contains(FrameFlags::SEQUENCED).then_some(header.sequence);

        let plain = match (&self.opener, header.is_encrypted()) {
            (Some(opener), true) => opener.open(&frame.payload)?,
            (Some(_), false) => {
                return Err(DecodeError::new(frame_len, "plaintext frame on encrypted session"));
            }
            (None, true) => {
                return Err(DecodeError::new(frame_len, "encrypted frame but no cipher configured"));
            }
            (None, false) => frame.payload.to_vec(),
        };

        let data = header
            .compression
            .decompress(&plain, self.max_message_size)
            .map_err(|e| DecodeError::new(frame_len, e.description))?;

        if header.is_bulk() {
            if !self.continues_message(header.chunk_index, sequence) {
                self.discard_chunks("chunk starts a new message");
            }
            debug!(chunk = header.chunk_index, size = data.len(), "bulk chunk received");
            self.pending_chunks.insert(header.chunk_index, data);
            self.chunk_next = sequence.map(|s| s.wrapping_add(1));
            return Ok(None);
        }

        if sequence.is_some() && sequence != self.chunk_next {
            self.discard_chunks("main frame does not follow its chunks");
        }
        self.chunk_next = None;
        let chunks = std::mem::take(&mut self.pending_chunks);
        let mut message = decode_message(&data, self.max_message_size)
            .map_err(|e| DecodeError::new(frame_len, e.description))?;

        for (chunk_index, bytes) in chunks {
            let slot = chunk_index as usize - 1;
            match message.fields.get_mut(slot) {
                Some(Value::Bytes(placeholder)) if placeholder.is_empty() => *placeholder = bytes,
                _ => {
                    return Err(DecodeError::new(
                        frame_len,
                        format!("bulk chunk {chunk_index} has no slot in {}", message.kind),
                    ));
                }
            }
        }
        Ok(Some(message))
    }

    /// Chunks of one message arrive with rising indices and, when
    /// sequenced, consecutive frame numbers.
    fn continues_message(&self, chunk_index: u8, sequence: Option<u32>) -> bool {
        let Some((&last, _)) = self.pending_chunks.last_key_value() else {
            return true;
        };
        chunk_index > last && (sequence.is_none() || sequence == self.chunk_next)
    }

    fn discard_chunks(&mut self, why: &'static str) {
        if !self.pending_chunks.is_empty() {
            debug!(dropped = self.pending_chunks.len(), why, "bulk chunks discarded");
            self.pending_chunks.clear();
        }
        self.chunk_next = None;
    }

    /// Number of bulk chunks currently waiting for a main frame.
    pub fn pending_chunks(&self) -> usize {
        self.pending_chunks.len()
    }
}

/// Convenience pair used where one task owns both directions (tests,
/// the handshake).
pub struct WireCodec {
    pub encoder: WireEncoder,
    pub decoder: WireDecoder,
}

impl WireCodec {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            encoder: WireEncoder::new(config),
            decoder: WireDecoder::new(config),
        }
    }

    pub fn into_parts(self) -> (WireEncoder, WireDecoder) {
        (self.encoder, self.decoder)
    }
}
