//! Screen-update encoding: codec choice, pixel encoders, the worker
//! pool, and the receiving side's decoder and sequencer.

pub mod codecs;
pub mod decoder;
pub mod pipeline;
pub mod selector;
pub mod sequencer;
pub mod types;

pub use codecs::{CodecState, Encoders, LossyEncoder, PixelEncoder, RgbEncoder, VideoEncoder};
pub use decoder::{DecodedRegion, FrameDecoder};
pub use pipeline::{EncodePipeline, EncodedUpdate, PlannedRegion, WindowJob, WindowResult};
pub use selector::CodecSelector;
pub use sequencer::UpdateSequencer;
pub use types::{Codec, EncodeJob, EncodeParams, EncodedRegion};
