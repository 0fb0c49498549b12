//! Pluggable payload compressors.
//!
//! The algorithm id travels in every frame header, so the receiver always
//! picks the matching decompressor even when the sender switches
//! algorithms mid-session.

use std::fmt;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Compression algorithms, in the order of their header ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Zlib,
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 3] = [Compression::None, Compression::Zlib, Compression::Zstd];

    pub const fn id(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zlib => 1,
            Compression::Zstd => 2,
        }
    }

    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Compression::None),
            1 => Some(Compression::Zlib),
            2 => Some(Compression::Zstd),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
            Compression::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Compress `data` at `level` (1 = fastest, 9 = smallest).
    pub fn compress(self, data: &[u8], level: u8) -> std::io::Result<Vec<u8>> {
        let level = level.clamp(1, 9);
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zlib => {
                let mut enc = ZlibEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    flate2::Compression::new(level as u32),
                );
                enc.write_all(data)?;
                enc.finish()
            }
            Compression::Zstd => zstd::bulk::compress(data, level as i32),
        }
    }

    /// Decompress `data`, refusing output larger than `max_size`.
    pub fn decompress(self, data: &[u8], max_size: usize) -> Result<Vec<u8>, DecodeError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(data)
                    .take(max_size as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| DecodeError::new(data.len(), format!("zlib: {e}")))?;
                if out.len() > max_size {
                    return Err(DecodeError::new(
                        data.len(),
                        format!("zlib output exceeds {max_size} bytes"),
                    ));
                }
                Ok(out)
            }
            Compression::Zstd => zstd::bulk::decompress(data, max_size)
                .map_err(|e| DecodeError::new(data.len(), format!("zstd: {e}"))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick the first entry of `local` (our preference order) that the peer
/// also supports.
pub fn negotiate(local: &[Compression], remote: &[Compression]) -> Option<Compression> {
    local.iter().copied().find(|c| remote.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog "
            .iter()
            .copied()
            .cycle()
            .take(8192)
            .collect()
    }

    #[test]
    fn each_algorithm_restores_input() {
        let data = sample();
        for c in Compression::ALL {
            let packed = c.compress(&data, 3).unwrap();
            if c != Compression::None {
                assert!(packed.len() < data.len(), "{c} did not shrink input");
            }
            assert_eq!(c.decompress(&packed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn decompression_is_bounded() {
        let data = sample();
        for c in [Compression::Zlib, Compression::Zstd] {
            let packed = c.compress(&data, 1).unwrap();
            assert!(c.decompress(&packed, 1024).is_err(), "{c} ignored the limit");
        }
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = Compression::Zstd.decompress(&[1, 2, 3, 4], 1024).unwrap_err();
        assert_eq!(err.frame_len, 4);
    }

    #[test]
    fn negotiation_follows_local_preference() {
        let local = [Compression::Zstd, Compression::Zlib, Compression::None];
        let remote = [Compression::None, Compression::Zlib];
        assert_eq!(negotiate(&local, &remote), Some(Compression::Zlib));
        assert_eq!(negotiate(&[Compression::Zstd], &[Compression::Zlib]), None);
    }

    #[test]
    fn ids_and_names_roundtrip() {
        for c in Compression::ALL {
            assert_eq!(Compression::from_id(c.id()), Some(c));
            assert_eq!(Compression::from_name(c.name()), Some(c));
        }
        assert!(Compression::from_id(9).is_none());
    }
}
