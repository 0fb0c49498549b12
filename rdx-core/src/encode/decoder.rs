//! Client-side draw decoder.
//!
//! Takes [`DrawPacket`]s received from the host and reconstructs window
//! pixels. Each window gets a persistent surface that draws are patched
//! into, plus the reference frame the video codec's deltas apply to.

use std::collections::HashMap;

use crate::damage::Rect;
use crate::encode::types::Codec;
use crate::error::DecodeError;
use crate::packet::DrawPacket;

/// Default bound on a surface's width and height.
pub const DEFAULT_MAX_SURFACE_SIZE: u32 = 16_384;

// ── DecodedRegion ────────────────────────────────────────────────

/// Pixels of one draw, ready to blit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRegion {
    pub window_id: u64,
    pub rect: Rect,
    pub bpp: usize,
    /// Tightly packed rows, `rect.width * bpp` bytes each.
    pub pixels: Vec<u8>,
}

// ── Surface ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Surface {
    width: u32,
    height: u32,
    bpp: usize,
    buffer: Vec<u8>,
    /// Last video frame and where it was drawn.
    video_reference: Option<(Rect, Vec<u8>)>,
}

impl Surface {
    /// Grow to cover `rect`, keeping existing content. The caller has
    /// checked `rect` against the surface bound.
    fn ensure_covers(&mut self, rect: &Rect, bpp: usize) {
        let width = self.width.max(rect.right() as u32);
        let height = self.height.max(rect.bottom() as u32);
        if width == self.width && height == self.height && bpp == self.bpp {
            return;
        }
        let mut buffer = vec![0u8; width as usize * height as usize * bpp];
        if bpp == self.bpp {
            let old_row = self.width as usize * bpp;
            let new_row = width as usize * bpp;
            for y in 0..self.height as usize {
                buffer[y * new_row..y * new_row + old_row]
                    .copy_from_slice(&self.buffer[y * old_row..(y + 1) * old_row]);
            }
        }
        self.width = width;
        self.height = height;
        self.bpp = bpp;
        self.buffer = buffer;
    }

    fn blit(&mut self, rect: &Rect, pixels: &[u8]) {
        let row_bytes = rect.width as usize * self.bpp;
        let stride = self.width as usize * self.bpp;
        for row in 0..rect.height as usize {
            let dst = (rect.y as usize + row) * stride + rect.x as usize * self.bpp;
            let src = row * row_bytes;
            self.buffer[dst..dst + row_bytes].copy_from_slice(&pixels[src..src + row_bytes]);
        }
    }
}

// ── FrameDecoder ─────────────────────────────────────────────────

/// Stateful decoder for all draws of one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    surfaces: HashMap<u64, Surface>,
    max_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_size(DEFAULT_MAX_SURFACE_SIZE)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that rejects draws reaching past `max_size` pixels on
    /// either axis.
    pub fn with_max_size(max_size: u32) -> Self {
        Self {
            surfaces: HashMap::new(),
            max_size,
        }
    }

    /// Byte size of `rect` at `bpp`, if it fits inside the surface bound.
    fn checked_size(&self, rect: &Rect, bpp: usize) -> Result<usize, String> {
        if rect.is_empty() {
            return Err(format!("empty draw rectangle {rect}"));
        }
        let max = self.max_size as u64;
        if rect.right() > max || rect.bottom() > max {
            return Err(format!("draw rectangle {rect} exceeds the {max}px surface limit"));
        }
        usize::try_from(rect.area())
            .ok()
            .and_then(|area| area.checked_mul(bpp))
            .ok_or_else(|| format!("draw rectangle {rect} is too large"))
    }

    /// Decompress one draw. Video deltas are resolved against the
    /// window's reference frame, which is then replaced.
    pub fn decode(&mut self, draw: &DrawPacket) -> Result<DecodedRegion, DecodeError> {
        let fail = |what: String| DecodeError::new(draw.data.len(), what);

        let bpp = match draw.options.get("bpp").and_then(|v| v.as_int()) {
            None => 4,
            Some(n @ (3 | 4)) => n as usize,
            Some(n) => return Err(fail(format!("unsupported bpp {n}"))),
        };
        let expected = self.checked_size(&draw.rect, bpp).map_err(fail)?;
        let raw = zstd::bulk::decompress(&draw.data, expected)
            .map_err(|e| fail(format!("{} payload: {e}", draw.codec)))?;
        if raw.len() != expected {
            return Err(fail(format!(
                "{} payload holds {} bytes, {} expected for {}",
                draw.codec,
                raw.len(),
                expected,
                draw.rect
            )));
        }

        let pixels = match draw.codec {
            Codec::Rgb | Codec::Lossy => raw,
            Codec::Video => {
                let surface = self.surfaces.entry(draw.window_id).or_default();
                let key = draw.options.get("frame").and_then(|v| v.as_str()) != Some("delta");
                let pixels = if key {
                    raw
                } else {
                    match &surface.video_reference {
                        Some((rect, reference)) if *rect == draw.rect => {
                            raw.iter().zip(reference).map(|(a, b)| a ^ b).collect()
                        }
                        _ => {
                            return Err(fail(format!(
                                "video delta for {} without a matching reference",
                                draw.rect
                            )));
                        }
                    }
                };
                surface.video_reference = Some((draw.rect, pixels.clone()));
                pixels
            }
        };

        Ok(DecodedRegion {
            window_id: draw.window_id,
            rect: draw.rect,
            bpp,
            pixels,
        })
    }

    /// Patch a decoded region into its window surface.
    pub fn apply(&mut self, region: &DecodedRegion) -> Result<(), DecodeError> {
        let fail = |what: String| DecodeError::new(region.pixels.len(), what);
        let expected = self.checked_size(&region.rect, region.bpp).map_err(fail)?;
        if region.pixels.len() != expected {
            return Err(fail(format!(
                "region {} holds {} bytes, {expected} expected",
                region.rect,
                region.pixels.len()
            )));
        }
        let surface = self.surfaces.entry(region.window_id).or_default();
        surface.ensure_covers(&region.rect, region.bpp);
        surface.blit(&region.rect, &region.pixels);
        Ok(())
    }

    /// [`decode`](Self::decode) then [`apply`](Self::apply).
    pub fn decode_and_apply(&mut self, draw: &DrawPacket) -> Result<DecodedRegion, DecodeError> {
        let region = self.decode(draw)?;
        self.apply(&region)?;
        Ok(region)
    }

    /// Current contents of a window: `(width, height, bpp, pixels)`.
    pub fn surface(&self, window_id: u64) -> Option<(u32, u32, usize, &[u8])> {
        self.surfaces
            .get(&window_id)
            .filter(|s| !s.buffer.is_empty())
            .map(|s| (s.width, s.height, s.bpp, &s.buffer[..]))
    }

    /// Pixel at `(x, y)` of a window, if drawn.
    pub fn pixel(&self, window_id: u64, x: u32, y: u32) -> Option<&[u8]> {
        let s = self.surfaces.get(&window_id)?;
        if x >= s.width || y >= s.height {
            return None;
        }
        let at = (y as usize * s.width as usize + x as usize) * s.bpp;
        Some(&s.buffer[at..at + s.bpp])
    }

    pub fn remove_window(&mut self, window_id: u64) {
        self.surfaces.remove(&window_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::capture::{PixelBuffer, PixelFormat};
    use crate::encode::codecs::{CodecState, Encoders};
    use crate::encode::types::EncodeParams;

    fn draw_of(codec: Codec, rect: Rect, px: &PixelBuffer, state: &mut CodecState, seq: u64) -> DrawPacket {
        let params = EncodeParams {
            quality: 100,
            speed: 90,
        };
        let out = Encoders::standard().encode(codec, px, params, state).unwrap();
        DrawPacket {
            window_id: 1,
            rect,
            codec: out.codec,
            data: out.data,
            sequence: seq,
            options: out.options,
        }
    }

    #[test]
    fn rgb_draw_lands_on_surface() {
        let px = PixelBuffer::filled(4, 2, PixelFormat::Bgra8, 0x7F);
        let rect = Rect::new(2, 1, 4, 2);
        let draw = draw_of(Codec::Rgb, rect, &px, &mut CodecState::default(), 1);

        let mut dec = FrameDecoder::new();
        let region = dec.decode_and_apply(&draw).unwrap();
        assert_eq!(region.pixels, px.data);

        let (w, h, bpp, _) = dec.surface(1).unwrap();
        assert_eq!((w, h, bpp), (6, 3, 4));
        assert_eq!(dec.pixel(1, 2, 1), Some(&[0x7F; 4][..]));
        assert_eq!(dec.pixel(1, 0, 0), Some(&[0; 4][..]));
    }

    #[test]
    fn video_deltas_resolve_against_reference() {
        let rect = Rect::new(0, 0, 8, 8);
        let a = PixelBuffer::filled(8, 8, PixelFormat::Bgra8, 0x10);
        let b = PixelBuffer::filled(8, 8, PixelFormat::Bgra8, 0x20);
        let mut state = CodecState::default();
        let key = draw_of(Codec::Video, rect, &a, &mut state, 1);
        let delta = draw_of(Codec::Video, rect, &b, &mut state, 2);
        assert_eq!(delta.options["frame"].as_str(), Some("delta"));

        let mut dec = FrameDecoder::new();
        dec.decode_and_apply(&key).unwrap();
        let region = dec.decode_and_apply(&delta).unwrap();
        assert_eq!(region.pixels, b.data);
    }

    #[test]
    fn delta_without_reference_fails() {
        let rect = Rect::new(0, 0, 8, 8);
        let px = PixelBuffer::filled(8, 8, PixelFormat::Bgra8, 0x10);
        let mut state = CodecState::default();
        let _key = draw_of(Codec::Video, rect, &px, &mut state, 1);
        let delta = draw_of(Codec::Video, rect, &px, &mut state, 2);

        let mut dec = FrameDecoder::new();
        assert!(dec.decode(&delta).is_err());
    }

    #[test]
    fn corrupt_payload_is_a_decode_error() {
        let draw = DrawPacket {
            window_id: 1,
            rect: Rect::new(0, 0, 2, 2),
            codec: Codec::Rgb,
            data: vec![1, 2, 3],
            sequence: 1,
            options: BTreeMap::new(),
        };
        let err = FrameDecoder::new().decode(&draw).unwrap_err();
        assert_eq!(err.frame_len, 3);
    }

    fn raw_draw(rect: Rect, data: Vec<u8>) -> DrawPacket {
        DrawPacket {
            window_id: 1,
            rect,
            codec: Codec::Rgb,
            data,
            sequence: 1,
            options: BTreeMap::new(),
        }
    }

    #[test]
    fn draw_past_the_coordinate_range_is_rejected() {
        let payload = zstd::bulk::compress(&[0u8; 16], 1).unwrap();
        let draw = raw_draw(Rect::new(u32::MAX - 1, 0, 4, 1), payload);
        let mut dec = FrameDecoder::new();
        assert!(dec.decode_and_apply(&draw).is_err());
        assert!(dec.surface(1).is_none());
    }

    #[test]
    fn huge_declared_rectangle_is_rejected_before_decompressing() {
        let draw = raw_draw(Rect::new(0, 0, 60_000, 60_000), vec![0x28, 0xB5, 0x2F, 0xFD]);
        let err = FrameDecoder::new().decode(&draw).unwrap_err();
        assert!(err.description.contains("surface limit"), "{}", err.description);
    }

    #[test]
    fn surface_limit_is_configurable() {
        let px = PixelBuffer::filled(8, 8, PixelFormat::Bgra8, 3);
        let draw = draw_of(Codec::Rgb, Rect::new(0, 0, 8, 8), &px, &mut CodecState::default(), 1);
        assert!(FrameDecoder::with_max_size(4).decode(&draw).is_err());
        assert!(FrameDecoder::with_max_size(8).decode(&draw).is_ok());
    }

    #[test]
    fn apply_checks_the_region_length() {
        let region = DecodedRegion {
            window_id: 1,
            rect: Rect::new(0, 0, 2, 2),
            bpp: 4,
            pixels: vec![0; 3],
        };
        assert!(FrameDecoder::new().apply(&region).is_err());
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let px = PixelBuffer::filled(4, 4, PixelFormat::Bgra8, 1);
        let draw = draw_of(Codec::Rgb, Rect::new(0, 0, 2, 2), &px, &mut CodecState::default(), 1);
        assert!(FrameDecoder::new().decode(&draw).is_err());
    }
}
