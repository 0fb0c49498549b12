//! Pixel encoders.
//!
//! Three encoders sit behind the [`PixelEncoder`] trait:
//!
//! - **rgb**: packed pixels, zstd compressed. Lossless.
//! - **lossy**: colour channels truncated to a bit depth derived from the
//!   quality target, then zstd compressed.
//! - **video**: a stream of key and delta frames. Delta frames carry the
//!   XOR of the current (quantised) pixels against the per-window
//!   reference frame, which compresses to almost nothing for small
//!   changes.
//!
//! Payload layouts are shared with [`FrameDecoder`](super::decoder::FrameDecoder):
//! every payload is a single zstd stream of tightly packed rows with
//! `bpp` bytes per pixel, `bpp` being sent as a draw option.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::capture::PixelBuffer;
use crate::encode::types::{Codec, EncodeParams, EncodedRegion};
use crate::error::EncodeError;

/// Delta frames between two key frames.
pub const DEFAULT_KEYFRAME_INTERVAL: u32 = 120;

// ── Codec state ──────────────────────────────────────────────────

#[derive(Clone)]
struct Reference {
    width: u32,
    height: u32,
    bpp: usize,
    pixels: Vec<u8>,
}

/// Per-window encoder state. Only the video encoder uses it.
///
/// The state is owned by the selector's arena and moved into the
/// encode job, so an encoder never sees two windows' state at once.
#[derive(Clone, Default)]
pub struct CodecState {
    reference: Option<Reference>,
    /// Frames emitted since the state was created or reset.
    frame: u64,
    since_key: u32,
}

impl CodecState {
    /// Drop the reference frame; the next video frame is a key frame.
    pub fn reset(&mut self) {
        self.reference = None;
        self.since_key = 0;
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl fmt::Debug for CodecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecState")
            .field("has_reference", &self.reference.is_some())
            .field("frame", &self.frame)
            .field("since_key", &self.since_key)
            .finish()
    }
}

// ── PixelEncoder ─────────────────────────────────────────────────

/// Turns one region's pixels into a draw payload.
///
/// Implementations run on blocking worker threads.
pub trait PixelEncoder: Send + Sync {
    fn codec(&self) -> Codec;

    fn encode(
        &self,
        pixels: &PixelBuffer,
        params: EncodeParams,
        state: &mut CodecState,
    ) -> Result<EncodedRegion, EncodeError>;
}

fn check_input(codec: Codec, pixels: &PixelBuffer) -> Result<(), EncodeError> {
    if pixels.width == 0 || pixels.height == 0 {
        return Err(EncodeError::Unsupported {
            codec: codec.name(),
            reason: format!("empty region {}x{}", pixels.width, pixels.height),
        });
    }
    if !pixels.is_well_formed() {
        return Err(EncodeError::Unsupported {
            codec: codec.name(),
            reason: format!(
                "buffer of {} bytes too short for {}x{} with stride {}",
                pixels.data.len(),
                pixels.width,
                pixels.height,
                pixels.stride
            ),
        });
    }
    Ok(())
}

fn compress(codec: Codec, raw: &[u8], params: EncodeParams) -> Result<Vec<u8>, EncodeError> {
    zstd::bulk::compress(raw, params.zstd_level()).map_err(|e| EncodeError::Fault {
        codec: codec.name(),
        reason: format!("zstd: {e}"),
    })
}

/// Colour bits kept per channel at quality `q`. 100 keeps all eight.
pub fn quality_bits(q: u8) -> u8 {
    (1 + (q.min(100) as u32 * 7) / 100) as u8
}

/// Truncate colour channels to `bits` bits in place. Alpha is untouched.
fn quantize(raw: &mut [u8], bpp: usize, bits: u8) {
    if bits >= 8 {
        return;
    }
    let mask = 0xFFu8 << (8 - bits);
    let colour_channels = bpp.min(3);
    for px in raw.chunks_exact_mut(bpp) {
        for c in &mut px[..colour_channels] {
            *c &= mask;
        }
    }
}

// ── rgb ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RgbEncoder;

impl PixelEncoder for RgbEncoder {
    fn codec(&self) -> Codec {
        Codec::Rgb
    }

    fn encode(
        &self,
        pixels: &PixelBuffer,
        params: EncodeParams,
        _state: &mut CodecState,
    ) -> Result<EncodedRegion, EncodeError> {
        check_input(Codec::Rgb, pixels)?;
        let data = compress(Codec::Rgb, &pixels.to_packed(), params)?;
        Ok(EncodedRegion::new(Codec::Rgb, data)
            .with_option("bpp", pixels.format.bytes_per_pixel() as u32))
    }
}

// ── lossy ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LossyEncoder;

impl PixelEncoder for LossyEncoder {
    fn codec(&self) -> Codec {
        Codec::Lossy
    }

    fn encode(
        &self,
        pixels: &PixelBuffer,
        params: EncodeParams,
        _state: &mut CodecState,
    ) -> Result<EncodedRegion, EncodeError> {
        check_input(Codec::Lossy, pixels)?;
        let bpp = pixels.format.bytes_per_pixel();
        let bits = quality_bits(params.quality);
        let mut raw = pixels.to_packed();
        quantize(&mut raw, bpp, bits);
        let data = compress(Codec::Lossy, &raw, params)?;
        Ok(EncodedRegion::new(Codec::Lossy, data)
            .with_option("bpp", bpp as u32)
            .with_option("quality", params.quality as u32)
            .with_option("bits", bits as u32))
    }
}

// ── video ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VideoEncoder {
    keyframe_interval: u32,
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_KEYFRAME_INTERVAL)
    }
}

impl VideoEncoder {
    pub fn new(keyframe_interval: u32) -> Self {
        Self {
            keyframe_interval: keyframe_interval.max(1),
        }
    }
}

impl PixelEncoder for VideoEncoder {
    fn codec(&self) -> Codec {
        Codec::Video
    }

    fn encode(
        &self,
        pixels: &PixelBuffer,
        params: EncodeParams,
        state: &mut CodecState,
    ) -> Result<EncodedRegion, EncodeError> {
        check_input(Codec::Video, pixels)?;
        let bpp = pixels.format.bytes_per_pixel();
        let bits = quality_bits(params.quality);
        let mut current = pixels.to_packed();
        quantize(&mut current, bpp, bits);

        let reusable = state.reference.as_ref().filter(|r| {
            r.width == pixels.width && r.height == pixels.height && r.bpp == bpp
        });
        let key = reusable.is_none() || state.since_key >= self.keyframe_interval;

        let raw: Vec<u8> = match reusable {
            Some(reference) if !key => current
                .iter()
                .zip(&reference.pixels)
                .map(|(a, b)| a ^ b)
                .collect(),
            _ => current.clone(),
        };
        let data = compress(Codec::Video, &raw, params)?;

        state.frame += 1;
        state.since_key = if key { 0 } else { state.since_key + 1 };
        state.reference = Some(Reference {
            width: pixels.width,
            height: pixels.height,
            bpp,
            pixels: current,
        });

        Ok(EncodedRegion::new(Codec::Video, data)
            .with_option("bpp", bpp as u32)
            .with_option("bits", bits as u32)
            .with_option("frame", if key { "key" } else { "delta" })
            .with_option("frame_no", state.frame))
    }
}

// ── Encoders ─────────────────────────────────────────────────────

/// The set of encoders available to a pipeline, one per codec.
#[derive(Clone)]
pub struct Encoders {
    by_codec: HashMap<Codec, Arc<dyn PixelEncoder>>,
}

impl Encoders {
    /// The built-in encoders for every codec.
    pub fn standard() -> Self {
        Self::empty()
            .with(Arc::new(RgbEncoder))
            .with(Arc::new(LossyEncoder))
            .with(Arc::new(VideoEncoder::default()))
    }

    pub fn empty() -> Self {
        Self {
            by_codec: HashMap::new(),
        }
    }

    /// Install `encoder` for its codec, replacing any previous one.
    pub fn with(mut self, encoder: Arc<dyn PixelEncoder>) -> Self {
        self.by_codec.insert(encoder.codec(), encoder);
        self
    }

    pub fn get(&self, codec: Codec) -> Option<&Arc<dyn PixelEncoder>> {
        self.by_codec.get(&codec)
    }

    /// Encode with `codec`, reporting a missing encoder as unsupported.
    pub fn encode(
        &self,
        codec: Codec,
        pixels: &PixelBuffer,
        params: EncodeParams,
        state: &mut CodecState,
    ) -> Result<EncodedRegion, EncodeError> {
        match self.get(codec) {
            Some(encoder) => encoder.encode(pixels, params, state),
            None => Err(EncodeError::Unsupported {
                codec: codec.name(),
                reason: "no encoder installed".to_string(),
            }),
        }
    }
}

impl Default for Encoders {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for Encoders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codecs: Vec<_> = self.by_codec.keys().collect();
        codecs.sort();
        f.debug_struct("Encoders").field("codecs", &codecs).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    fn gradient(w: u32, h: u32) -> PixelBuffer {
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[x as u8, y as u8, (x ^ y) as u8, 0xFF]);
            }
        }
        PixelBuffer::packed(w, h, PixelFormat::Bgra8, data)
    }

    fn unpack(data: &[u8], capacity: usize) -> Vec<u8> {
        zstd::bulk::decompress(data, capacity).unwrap()
    }

    #[test]
    fn rgb_is_lossless() {
        let px = gradient(64, 32);
        let out = RgbEncoder
            .encode(&px, EncodeParams::default(), &mut CodecState::default())
            .unwrap();
        assert_eq!(out.codec, Codec::Rgb);
        assert_eq!(unpack(&out.data, px.data.len()), px.data);
    }

    #[test]
    fn rgb_strips_row_padding() {
        let mut px = gradient(8, 4);
        let packed = px.data.clone();
        let mut padded = Vec::new();
        for row in packed.chunks(32) {
            padded.extend_from_slice(row);
            padded.extend_from_slice(&[0xEE; 8]);
        }
        px.data = padded;
        px.stride = 40;
        let out = RgbEncoder
            .encode(&px, EncodeParams::default(), &mut CodecState::default())
            .unwrap();
        assert_eq!(unpack(&out.data, packed.len()), packed);
    }

    #[test]
    fn malformed_buffers_are_rejected() {
        let mut px = gradient(8, 8);
        px.data.truncate(10);
        let err = RgbEncoder
            .encode(&px, EncodeParams::default(), &mut CodecState::default())
            .unwrap_err();
        assert!(matches!(err, EncodeError::Unsupported { codec: "rgb", .. }));
    }

    #[test]
    fn lossy_quantizes_colour_but_not_alpha() {
        let px = gradient(16, 16);
        let params = EncodeParams {
            quality: 30,
            speed: 50,
        };
        let out = LossyEncoder
            .encode(&px, params, &mut CodecState::default())
            .unwrap();
        let bits = quality_bits(30);
        assert!(bits < 8);
        let mask = 0xFFu8 << (8 - bits);
        let raw = unpack(&out.data, px.data.len());
        for (got, want) in raw.chunks(4).zip(px.data.chunks(4)) {
            assert_eq!(got[0], want[0] & mask);
            assert_eq!(got[3], 0xFF);
        }
    }

    #[test]
    fn quality_bits_are_monotonic() {
        let mut last = 0;
        for q in 0..=100 {
            let b = quality_bits(q);
            assert!(b >= last && (1..=8).contains(&b));
            last = b;
        }
        assert_eq!(quality_bits(100), 8);
    }

    #[test]
    fn video_alternates_key_and_delta() {
        let enc = VideoEncoder::new(3);
        let mut state = CodecState::default();
        let params = EncodeParams {
            quality: 100,
            speed: 50,
        };
        let px = gradient(32, 32);

        let frames: Vec<String> = (0..5)
            .map(|_| {
                let out = enc.encode(&px, params, &mut state).unwrap();
                out.options["frame"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(frames, ["key", "delta", "delta", "delta", "key"]);
        assert_eq!(state.frame(), 5);
    }

    #[test]
    fn video_delta_is_xor_of_reference() {
        let enc = VideoEncoder::default();
        let mut state = CodecState::default();
        let params = EncodeParams {
            quality: 100,
            speed: 50,
        };
        let a = gradient(8, 8);
        let mut b = a.clone();
        b.data[0] ^= 0x0F;

        enc.encode(&a, params, &mut state).unwrap();
        let out = enc.encode(&b, params, &mut state).unwrap();
        let raw = unpack(&out.data, a.data.len());
        assert_eq!(raw[0], 0x0F);
        assert!(raw[1..].iter().all(|&x| x == 0));
    }

    #[test]
    fn video_geometry_change_forces_key_frame() {
        let enc = VideoEncoder::default();
        let mut state = CodecState::default();
        let params = EncodeParams::default();
        enc.encode(&gradient(8, 8), params, &mut state).unwrap();
        let out = enc.encode(&gradient(16, 8), params, &mut state).unwrap();
        assert_eq!(out.options["frame"].as_str(), Some("key"));

        state.reset();
        assert!(!state.has_reference());
        let out = enc.encode(&gradient(16, 8), params, &mut state).unwrap();
        assert_eq!(out.options["frame"].as_str(), Some("key"));
    }

    #[test]
    fn missing_encoder_is_unsupported() {
        let encoders = Encoders::empty().with(Arc::new(RgbEncoder));
        let err = encoders
            .encode(
                Codec::Video,
                &gradient(4, 4),
                EncodeParams::default(),
                &mut CodecState::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EncodeError::Unsupported { codec: "video", .. }));
    }
}
