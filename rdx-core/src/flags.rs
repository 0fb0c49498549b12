//! Frame header flag bits.

use bitflags::bitflags;

bitflags! {
    /// Per-frame flags carried in the second header byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// The payload is wrapped by the session cipher.
        const ENCRYPTED = 0x01;
        /// The payload is a raw bulk chunk, not a serialised message.
        const BULK = 0x02;
        /// The sequence field is meaningful (datagram transports).
        const SEQUENCED = 0x04;
    }
}

impl FrameFlags {
    /// Parse a flags byte, rejecting bits this peer does not know.
    pub fn parse(bits: u8) -> Option<Self> {
        Self::from_bits(bits)
    }
}
