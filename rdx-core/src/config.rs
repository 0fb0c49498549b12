//! Engine configuration.
//!
//! Every tunable of the engine lives here. The host binary embeds
//! [`EngineConfig`] in its TOML file; all sections fall back to their
//! defaults when omitted. Time values are plain milliseconds so they
//! read naturally in TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::encode::types::Codec;
use crate::wire::compression::Compression;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wire codec, framing, and connection settings.
    pub protocol: ProtocolConfig,
    /// Damage batching.
    pub batch: BatchConfig,
    /// Picture encoding policy.
    pub encoding: EncodingConfig,
    /// Bandwidth / quality control loop.
    pub quality: QualityConfig,
}

// ── Protocol ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Compression algorithms in order of preference.
    pub compressors: Vec<Compression>,
    /// Compression level, 1 (fast) to 9 (small).
    pub compression_level: u8,
    /// Serialised messages below this size are sent uncompressed.
    pub min_compress_size: usize,
    /// Byte fields above this size travel as separate bulk frames.
    pub bulk_threshold: usize,
    /// Largest message (or bulk chunk) accepted, after decompression.
    pub max_message_size: usize,
    /// Pre-shared secret enabling encryption. Both peers must agree.
    pub encryption_secret: Option<String>,
    /// Deadline for the capability exchange.
    pub handshake_timeout_ms: u64,
    /// Deadline for flushing queued messages on close.
    pub drain_timeout_ms: u64,
    /// Capacity of the control priority class of the send queue.
    pub control_queue_capacity: usize,
    /// Capacity of the bulk priority class of the send queue.
    pub bulk_queue_capacity: usize,
    /// Decoded messages buffered between the inbound loop and the owner.
    pub inbound_channel_capacity: usize,
    /// Interval between latency probes.
    pub ping_interval_ms: u64,
    /// Largest datagram written by datagram transports.
    pub datagram_mtu: usize,
    /// Out-of-order frames buffered by datagram transports.
    pub reorder_window: usize,
    /// How long a datagram sequence gap may stay open before it is skipped.
    pub gap_timeout_ms: u64,
    /// A draw not acknowledged within this long is sent again. Raised to
    /// four round trips on slow links.
    pub ack_timeout_ms: u64,
    /// Resends of one draw before its region is repainted instead.
    pub max_draw_resends: u32,
    /// Encoded draws kept for resending, in bytes.
    pub resend_cache_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            compressors: vec![Compression::Zstd, Compression::Zlib, Compression::None],
            compression_level: 3,
            min_compress_size: 512,
            bulk_threshold: 4096,
            max_message_size: 64 * 1024 * 1024,
            encryption_secret: None,
            handshake_timeout_ms: 10_000,
            drain_timeout_ms: 2_000,
            control_queue_capacity: 256,
            bulk_queue_capacity: 64,
            inbound_channel_capacity: 256,
            ping_interval_ms: 1_000,
            datagram_mtu: 1_400,
            reorder_window: 64,
            gap_timeout_ms: 250,
            ack_timeout_ms: 1_000,
            max_draw_resends: 3,
            resend_cache_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
}

// ── Batching ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Two regions merge only if their bounding box area is at most
    /// this multiple of the sum of their areas.
    pub merge_ratio: f64,
    /// A window with this many pending regions is flushed immediately.
    pub max_pending_regions: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            merge_ratio: 1.5,
            max_pending_regions: 32,
        }
    }
}

// ── Encoding ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Picture encodings offered to clients.
    pub encodings: Vec<Codec>,
    /// A window quiet for this long gets a lossless refresh.
    pub idle_threshold_ms: u64,
    /// Updates within `video_window_ms` that mark a window as video.
    pub video_min_updates: usize,
    /// Sliding window used to measure update frequency.
    pub video_window_ms: u64,
    /// Minimum region area (pixels) for the video codec.
    pub video_min_area: u64,
    /// Regions below this area (pixels) are always sent lossless.
    pub small_region_area: u64,
    /// At or above this quality target, still images are lossless.
    pub lossless_quality_threshold: u8,
    /// Encode worker threads; 0 uses the available parallelism.
    pub workers: usize,
    /// Largest window edge a client surface may grow to, in pixels.
    pub max_surface_size: u32,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            encodings: vec![Codec::Rgb, Codec::Lossy, Codec::Video],
            idle_threshold_ms: 1_000,
            video_min_updates: 10,
            video_window_ms: 1_000,
            video_min_area: 128 * 128,
            small_region_area: 32 * 32,
            lossless_quality_threshold: 95,
            workers: 0,
            max_surface_size: crate::encode::decoder::DEFAULT_MAX_SURFACE_SIZE,
        }
    }
}

impl EncodingConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn video_window(&self) -> Duration {
        Duration::from_millis(self.video_window_ms)
    }

    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    }
}

// ── Quality control ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub initial_quality: u8,
    pub min_quality: u8,
    pub max_quality: u8,
    pub initial_speed: u8,
    pub min_speed: u8,
    pub max_speed: u8,
    /// Additive increase applied to quality per healthy period.
    pub quality_step: u8,
    /// Additive change applied to speed on each adjustment.
    pub speed_step: u8,
    /// Multiplicative factor applied to quality on congestion.
    pub decrease_factor: f64,
    /// Multiplicative factor applied to the batch delay on congestion.
    pub delay_factor: f64,
    /// Additive decrease of the batch delay per healthy period.
    pub delay_step_ms: u64,
    pub initial_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Send-queue depth that triggers a multiplicative decrease.
    pub high_water: usize,
    /// Send-queue depth under which targets may relax.
    pub low_water: usize,
    /// How long the queue must stay below `low_water` before relaxing.
    pub relax_period_ms: u64,
    /// Minimum spacing between two decreases while congestion persists.
    pub decrease_holdoff_ms: u64,
    /// Latency up to which no quality ceiling applies.
    pub target_latency_ms: u64,
    /// Quality points removed per doubling of latency above the target.
    pub latency_penalty: f64,
    /// Throughput (bytes/s) at which no throughput ceiling applies.
    pub reference_throughput: u64,
    /// Rolling window for throughput estimation.
    pub throughput_window_ms: u64,
    /// Loss fraction treated as a congestion signal.
    pub loss_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            initial_quality: 80,
            min_quality: 10,
            max_quality: 100,
            initial_speed: 50,
            min_speed: 10,
            max_speed: 100,
            quality_step: 5,
            speed_step: 10,
            decrease_factor: 0.5,
            delay_factor: 2.0,
            delay_step_ms: 5,
            initial_delay_ms: 20,
            min_delay_ms: 5,
            max_delay_ms: 1_000,
            high_water: 16,
            low_water: 4,
            relax_period_ms: 1_000,
            decrease_holdoff_ms: 250,
            target_latency_ms: 40,
            latency_penalty: 15.0,
            reference_throughput: 10 * 1024 * 1024,
            throughput_window_ms: 1_000,
            loss_threshold: 0.05,
        }
    }
}

impl QualityConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn relax_period(&self) -> Duration {
        Duration::from_millis(self.relax_period_ms)
    }

    pub fn decrease_holdoff(&self) -> Duration {
        Duration::from_millis(self.decrease_holdoff_ms)
    }

    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_millis(self.throughput_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = EngineConfig::default();
        assert!(cfg.quality.low_water < cfg.quality.high_water);
        assert!(cfg.quality.min_delay_ms <= cfg.quality.initial_delay_ms);
        assert!(cfg.quality.initial_delay_ms <= cfg.quality.max_delay_ms);
        assert_eq!(cfg.batch.merge_ratio, 1.5);
        assert!(cfg.encoding.encodings.contains(&Codec::Rgb));
        assert!(cfg.encoding.worker_count() >= 1);
    }

    #[test]
    fn durations() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.drain_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(1));
    }
}
