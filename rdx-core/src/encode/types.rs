//! Shared types for the picture encoding pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::damage::Rect;
use crate::wire::Value;

// ── Codec ────────────────────────────────────────────────────────

/// Picture encodings a draw payload may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Lossless, zstd-compressed pixels. Every peer must support it.
    Rgb,
    /// Reduced colour depth driven by the quality target.
    Lossy,
    /// Stateful delta stream against a per-window reference frame.
    Video,
}

impl Codec {
    pub const ALL: [Codec; 3] = [Codec::Rgb, Codec::Lossy, Codec::Video];

    pub const fn name(self) -> &'static str {
        match self {
            Codec::Rgb => "rgb",
            Codec::Lossy => "lossy",
            Codec::Video => "video",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub const fn is_lossless(self) -> bool {
        matches!(self, Codec::Rgb)
    }

    /// Whether encoder state carries over between updates.
    pub const fn is_stateful(self) -> bool {
        matches!(self, Codec::Video)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── EncodeParams ─────────────────────────────────────────────────

/// Knobs handed to an encoder for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    /// 0..=100, 100 = visually lossless.
    pub quality: u8,
    /// 0..=100, 100 = fastest.
    pub speed: u8,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            quality: 80,
            speed: 50,
        }
    }
}

impl EncodeParams {
    /// zstd level for this speed: fast settings map to low levels.
    pub fn zstd_level(&self) -> i32 {
        match self.speed {
            90..=100 => 1,
            70..=89 => 2,
            40..=69 => 3,
            20..=39 => 6,
            _ => 9,
        }
    }
}

// ── Encoded output ───────────────────────────────────────────────

/// The product of one successful encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRegion {
    pub codec: Codec,
    pub data: Vec<u8>,
    /// Codec-specific client hints (e.g. `quality`, `frame`).
    pub options: BTreeMap<String, Value>,
}

impl EncodedRegion {
    pub fn new(codec: Codec, data: Vec<u8>) -> Self {
        Self {
            codec,
            data,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

// ── EncodeJob ────────────────────────────────────────────────────

/// One region as it was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeJob {
    pub window_id: u64,
    pub rect: Rect,
    /// The codec actually used, after any fallback.
    pub codec: Codec,
    pub params: EncodeParams,
    /// Per-window, strictly increasing and gap-free.
    pub sequence: u64,
}
