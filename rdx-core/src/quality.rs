//! Bandwidth and quality control.
//!
//! The controller turns network feedback into encoding targets:
//!
//! - ping echoes → smoothed latency (EWMA, α = 1/8)
//! - draw acks → acknowledged throughput, in fixed slots over a window
//! - send-queue depth → congestion (AIMD on quality, speed and batch delay)
//! - datagram loss → smoothed loss rate, also a congestion signal
//!
//! The targets are published as a [`QualityState`] value. The selector
//! and the batcher read it; only the controller writes it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::QualityConfig;
use crate::packet::DamageAck;

// ── QualityState ─────────────────────────────────────────────────

/// Snapshot of the measured link and the derived targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityState {
    /// Smoothed round-trip time.
    pub latency: Duration,
    /// Smoothed loss fraction, 0.0..=1.0.
    pub loss: f64,
    /// Acknowledged bytes per second.
    pub throughput: u64,
    /// Picture quality target, 0..=100.
    pub quality: u8,
    /// Encoder speed target, 0..=100.
    pub speed: u8,
    /// How long damage is batched before encoding.
    pub batch_delay: Duration,
}

impl Default for QualityState {
    fn default() -> Self {
        let cfg = QualityConfig::default();
        Self {
            latency: Duration::ZERO,
            loss: 0.0,
            throughput: 0,
            quality: cfg.initial_quality,
            speed: cfg.initial_speed,
            batch_delay: cfg.initial_delay(),
        }
    }
}

// ── LinkEstimator ────────────────────────────────────────────────

/// Slots the throughput window is divided into.
const ACK_SLOTS: u32 = 10;

/// Bytes acknowledged during one slot, starting at its first ack.
#[derive(Debug, Clone, Copy)]
struct AckSlot {
    start: Instant,
    bytes: u64,
}

/// What the controller has measured about the link.
///
/// Acked draw sizes land in fixed time slots; throughput is the bytes
/// still inside the window divided by the time they took to arrive.
/// Latency and loss are exponentially smoothed with weight 1/8.
#[derive(Debug)]
pub struct LinkEstimator {
    slots: VecDeque<AckSlot>,
    slot_width: Duration,
    window: Duration,
    last_ack: Option<Instant>,
    latency: Option<Duration>,
    loss: f64,
}

impl LinkEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            slots: VecDeque::with_capacity(ACK_SLOTS as usize + 1),
            slot_width: (window / ACK_SLOTS).max(Duration::from_millis(1)),
            window,
            last_ack: None,
            latency: None,
            loss: 0.0,
        }
    }

    /// The client acknowledged a draw of `bytes`.
    pub fn on_ack(&mut self, now: Instant, bytes: u64) {
        match self.slots.back_mut() {
            Some(slot) if now.duration_since(slot.start) < self.slot_width => slot.bytes += bytes,
            _ => self.slots.push_back(AckSlot { start: now, bytes }),
        }
        self.last_ack = Some(now);
        while self
            .slots
            .front()
            .is_some_and(|s| now.duration_since(s.start) > self.window)
        {
            self.slots.pop_front();
        }
    }

    pub fn on_rtt(&mut self, rtt: Duration) {
        self.latency = Some(match self.latency {
            None => rtt,
            Some(smoothed) => smoothed.mul_f64(7.0 / 8.0) + rtt / 8,
        });
    }

    /// Fold in a loss report. Empty reports carry no information.
    pub fn on_loss(&mut self, lost: u64, delivered: u64) {
        let total = lost + delivered;
        if total > 0 {
            let sample = lost as f64 / total as f64;
            self.loss = self.loss * 7.0 / 8.0 + sample / 8.0;
        }
    }

    /// Acknowledged bytes per second, once acks span some time.
    pub fn throughput(&self) -> Option<u64> {
        let first = self.slots.front()?;
        let elapsed = self.last_ack?.duration_since(first.start);
        if elapsed.is_zero() {
            return None;
        }
        let bytes: u64 = self.slots.iter().map(|s| s.bytes).sum();
        Some((bytes as f64 / elapsed.as_secs_f64()) as u64)
    }

    /// Smoothed round-trip time; zero before the first echo.
    pub fn latency(&self) -> Duration {
        self.latency.unwrap_or(Duration::ZERO)
    }

    pub fn loss(&self) -> f64 {
        self.loss
    }
}

// ── QualityController ────────────────────────────────────────────

#[derive(Debug)]
pub struct QualityController {
    config: QualityConfig,
    link: LinkEstimator,
    /// AIMD quality, kept fractional so small factors still move it.
    quality: f64,
    speed: u8,
    batch_delay: Duration,
    last_depth: usize,
    congested: bool,
    last_decrease: Option<Instant>,
    /// Start of the current low-water period and the latency seen then.
    calm_since: Option<(Instant, Duration)>,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            link: LinkEstimator::new(config.throughput_window()),
            quality: config.initial_quality as f64,
            speed: config.initial_speed,
            batch_delay: config.initial_delay(),
            last_depth: 0,
            congested: false,
            last_decrease: None,
            calm_since: None,
            config,
        }
    }

    /// A ping came back after `rtt`.
    pub fn on_ping_echo(&mut self, rtt: Duration) {
        self.link.on_rtt(rtt);
    }

    /// A draw of `bytes` was acknowledged.
    pub fn on_ack(&mut self, ack: &DamageAck, bytes: u64, now: Instant) {
        if ack.failed() {
            return;
        }
        self.link.on_ack(now, bytes);
    }

    /// Latest depth of the outbound queue.
    pub fn on_send_queue_depth(&mut self, depth: usize, now: Instant) {
        self.last_depth = depth;
        if depth > self.config.high_water {
            self.calm_since = None;
            self.congestion(now);
            return;
        }
        self.congested = false;

        if depth >= self.config.low_water {
            self.calm_since = None;
            return;
        }
        let latency = self.link.latency();
        match self.calm_since {
            None => self.calm_since = Some((now, latency)),
            Some((since, latency_then)) => {
                if now.duration_since(since) >= self.config.relax_period() {
                    if latency <= latency_then {
                        self.relax();
                    }
                    self.calm_since = Some((now, latency));
                }
            }
        }
    }

    /// Datagram loss since the last report.
    pub fn on_loss(&mut self, lost: u64, delivered: u64, now: Instant) {
        if lost + delivered == 0 {
            return;
        }
        self.link.on_loss(lost, delivered);
        if self.link.loss() > self.config.loss_threshold {
            self.calm_since = None;
            self.congestion(now);
        }
    }

    /// Current targets, derived on demand.
    pub fn current_targets(&self) -> QualityState {
        let cfg = &self.config;
        let quality = self
            .quality
            .min(self.latency_ceiling())
            .min(self.throughput_ceiling())
            .clamp(cfg.min_quality as f64, cfg.max_quality as f64);
        QualityState {
            latency: self.link.latency(),
            loss: self.link.loss(),
            throughput: self.link.throughput().unwrap_or(0),
            quality: quality.round() as u8,
            speed: self.speed,
            batch_delay: self.batch_delay,
        }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    // ── Internal ─────────────────────────────────────────────────

    fn congestion(&mut self, now: Instant) {
        let first = !self.congested;
        self.congested = true;
        let held_off = self
            .last_decrease
            .is_some_and(|t| now.duration_since(t) < self.config.decrease_holdoff());
        if first || !held_off {
            self.decrease(now);
        }
    }

    fn decrease(&mut self, now: Instant) {
        let cfg = &self.config;
        self.quality = (self.quality * cfg.decrease_factor).max(cfg.min_quality as f64);
        self.speed = self.speed.saturating_add(cfg.speed_step).min(cfg.max_speed);
        self.batch_delay = self
            .batch_delay
            .mul_f64(cfg.delay_factor)
            .clamp(cfg.min_delay(), cfg.max_delay());
        self.last_decrease = Some(now);
        debug!(
            quality = self.quality,
            speed = self.speed,
            delay = ?self.batch_delay,
            "congestion, backing off"
        );
    }

    fn relax(&mut self) {
        let cfg = &self.config;
        self.quality = (self.quality + cfg.quality_step as f64).min(cfg.max_quality as f64);
        self.speed = self.speed.saturating_sub(cfg.speed_step).max(cfg.min_speed);
        self.batch_delay = self
            .batch_delay
            .saturating_sub(Duration::from_millis(cfg.delay_step_ms))
            .max(cfg.min_delay());
        debug!(quality = self.quality, speed = self.speed, "link calm, relaxing");
    }

    /// Non-increasing in latency: full quality up to the target, then a
    /// fixed penalty per doubling.
    fn latency_ceiling(&self) -> f64 {
        let max = self.config.max_quality as f64;
        let latency = self.link.latency().as_secs_f64();
        let target = self.config.target_latency().as_secs_f64();
        if target <= 0.0 || latency <= target {
            return max;
        }
        max - self.config.latency_penalty * (latency / target).log2()
    }

    /// Applies only while the queue is backing up: the link, not the
    /// content, is then what limits acknowledged throughput.
    fn throughput_ceiling(&self) -> f64 {
        let cfg = &self.config;
        let max = cfg.max_quality as f64;
        if self.last_depth < cfg.low_water || cfg.reference_throughput == 0 {
            return max;
        }
        let Some(bps) = self.link.throughput() else {
            return max;
        };
        let ratio = (bps as f64 / cfg.reference_throughput as f64).min(1.0);
        cfg.min_quality as f64 + (max - cfg.min_quality as f64) * ratio
    }
}

impl Default for QualityController {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}
