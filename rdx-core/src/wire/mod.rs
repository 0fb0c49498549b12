//! Wire codec: message serialisation, compression and encryption.

pub mod codec;
pub mod compression;
pub mod crypto;
pub mod value;

pub use codec::{WireCodec, WireDecoder, WireEncoder, decode_message, encode_message};
pub use compression::Compression;
pub use value::Value;

/// Which end of a connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The machine whose windows are forwarded.
    Host,
    /// The machine displaying them.
    Client,
}
