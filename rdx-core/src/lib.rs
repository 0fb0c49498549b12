//! # rdx-core
//!
//! Session protocol engine and screen-update encoding pipeline for the
//! rdx remote display.
//!
//! This crate contains:
//! - **Framing**: `FrameHeader`, `Frame`, and `FrameCodec` for byte streams
//! - **Wire**: `Message` values, compression, encryption, and `WireCodec`
//!   which splits large payloads into bulk chunks
//! - **Transport**: `StreamTransport` and `DatagramTransport` behind one
//!   `FrameTransport` seam
//! - **Network**: `Connection` with handshake, two-class `SendQueue`, and
//!   lifecycle `ConnectionPhase`
//! - **Dispatch**: enum-keyed handler table over typed `Packet`s
//! - **Damage**: `DamageBatcher` merging rectangles per window
//! - **Encode**: `CodecSelector`, pixel encoders, the `EncodePipeline`
//!   worker pool, and the receiving side's `FrameDecoder`
//! - **Quality**: `QualityController` turning feedback into targets
//! - **Session / Client**: host and reference client glue
//! - **Error**: `RdxError`, typed, `thiserror`-based error hierarchy

pub mod capture;
pub mod client;
pub mod codec;
pub mod config;
pub mod damage;
pub mod dispatch;
pub mod encode;
pub mod error;
pub mod flags;
pub mod frame;
pub mod header;
pub mod message;
pub mod network;
pub mod packet;
pub mod quality;
pub mod session;
pub mod transport;
pub mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    CaptureSource, DamageEvent, DamageNotifier, DamageReceiver, MemorySource, PixelBuffer, PixelFormat,
};
pub use client::{Client, ClientUpdate};
pub use codec::FrameCodec;
pub use config::{BatchConfig, EncodingConfig, EngineConfig, ProtocolConfig, QualityConfig};
pub use damage::{DamageBatcher, DamageRegion, Rect, RegionBatch};
pub use dispatch::{Dispatched, Dispatcher};
pub use encode::{Codec, CodecSelector, EncodeParams, EncodePipeline, FrameDecoder, PixelEncoder};
pub use error::{DecodeError, EncodeError, FrameError, HandshakeError, QueueError, RdxError};
pub use flags::FrameFlags;
pub use frame::{Frame, MAX_FRAME_SIZE};
pub use header::{FrameHeader, HEADER_SIZE};
pub use message::{Message, MessageType};
pub use network::{Connection, ConnectionEvent, ConnectionPhase, Priority, SendQueue};
pub use packet::{Capabilities, DamageAck, DrawPacket, NegotiatedCaps, Packet};
pub use quality::{QualityController, QualityState};
pub use session::{Session, serve};
pub use transport::{DatagramTransport, FrameTransport, StreamTransport};
pub use wire::{Compression, Side, Value, WireCodec};
