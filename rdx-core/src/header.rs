//! Fixed-size frame header.
//!
//! ```text
//! offset  size  field
//! 0       1     marker        b'R'
//! 1       1     flags         FrameFlags
//! 2       1     compression   Compression id used on the payload
//! 3       1     chunk index   0 = message, 1..=15 = bulk field slot
//! 4       4     length        payload length after compression/encryption
//! 8       4     sequence      datagram sequence (0 on byte streams)
//! 12      4     checksum      crc32 of bytes 0..12
//! ```
//!
//! All integers are big-endian. The checksum covers every other header
//! byte, so any single-bit corruption is caught before the payload length
//! is trusted.

use crate::error::FrameError;
use crate::flags::FrameFlags;
use crate::wire::compression::Compression;

pub const HEADER_SIZE: usize = 16;

const MARKER: u8 = b'R';

/// Highest chunk index a bulk frame may use.
pub const MAX_CHUNK_INDEX: u8 = 15;

pub type FrameHeaderBytes = [u8; HEADER_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub compression: Compression,
    pub chunk_index: u8,
    pub payload_length: u32,
    pub sequence: u32,
}

impl FrameHeader {
    pub fn new(flags: FrameFlags, compression: Compression, chunk_index: u8, payload_length: u32) -> Self {
        Self {
            flags,
            compression,
            chunk_index,
            payload_length,
            sequence: 0,
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.flags.contains(FrameFlags::BULK)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(FrameFlags::ENCRYPTED)
    }

    /// Stamp a datagram sequence number on this header.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self.flags |= FrameFlags::SEQUENCED;
        self
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut out: FrameHeaderBytes = [0; HEADER_SIZE];
        out[0] = MARKER;
        out[1] = self.flags.bits();
        out[2] = self.compression.id();
        out[3] = self.chunk_index;
        out[4..8].copy_from_slice(&self.payload_length.to_be_bytes());
        out[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        let checksum = crc32fast::hash(&out[..12]);
        out[12..16].copy_from_slice(&checksum.to_be_bytes());
        out
    }

    /// Parse and validate a header.
    ///
    /// The checksum is verified first; field validation only happens on
    /// bytes that are known to be intact.
    pub fn from_bytes(bytes: &FrameHeaderBytes) -> Result<Self, FrameError> {
        let expected = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let actual = crc32fast::hash(&bytes[..12]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }
        if bytes[0] != MARKER {
            return Err(FrameError::InvalidMagic(bytes[0]));
        }

        let flags = FrameFlags::parse(bytes[1]).ok_or(FrameError::InvalidField {
            field: "flags",
            value: bytes[1] as u64,
        })?;
        let compression = Compression::from_id(bytes[2]).ok_or(FrameError::InvalidField {
            field: "compression",
            value: bytes[2] as u64,
        })?;
        let chunk_index = bytes[3];
        if chunk_index > MAX_CHUNK_INDEX || (chunk_index == 0) == flags.contains(FrameFlags::BULK) {
            return Err(FrameError::InvalidField {
                field: "chunk_index",
                value: chunk_index as u64,
            });
        }

        Ok(Self {
            flags,
            compression,
            chunk_index,
            payload_length: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            sequence: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameHeader {
        FrameHeader::new(FrameFlags::ENCRYPTED, Compression::Zstd, 0, 123_456).with_sequence(77)
    }

    #[test]
    fn header_roundtrip() {
        let hdr = sample();
        let parsed = FrameHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed, hdr);
        assert!(parsed.flags.contains(FrameFlags::SEQUENCED));
    }

    #[test]
    fn every_single_bit_flip_is_detected() {
        let headers = [
            sample(),
            FrameHeader::new(FrameFlags::BULK, Compression::None, 7, 1),
            FrameHeader::new(FrameFlags::empty(), Compression::Zlib, 0, 0),
        ];
        for hdr in headers {
            let bytes = hdr.to_bytes();
            for bit in 0..HEADER_SIZE * 8 {
                let mut corrupted = bytes;
                corrupted[bit / 8] ^= 1 << (bit % 8);
                assert!(
                    FrameHeader::from_bytes(&corrupted).is_err(),
                    "bit {bit} flip went undetected"
                );
            }
        }
    }

    #[test]
    fn bulk_flag_requires_chunk_index() {
        let bad = FrameHeader::new(FrameFlags::BULK, Compression::None, 0, 10);
        assert!(matches!(
            FrameHeader::from_bytes(&bad.to_bytes()),
            Err(FrameError::InvalidField { field: "chunk_index", .. })
        ));

        let bad = FrameHeader::new(FrameFlags::empty(), Compression::None, 3, 10);
        assert!(FrameHeader::from_bytes(&bad.to_bytes()).is_err());
    }

    #[test]
    fn wrong_marker_is_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        let checksum = crc32fast::hash(&bytes[..12]);
        bytes[12..16].copy_from_slice(&checksum.to_be_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(FrameError::InvalidMagic(b'X'))
        ));
    }
}
