//! Host side of one client: damage in, draws out.
//!
//! A [`Session`] owns an established [`Connection`] and ties the engine
//! together in a single `select!` loop:
//!
//! ```text
//! capture ──damage──► batcher ──batch──► selector ──job──► pipeline
//!                        ▲                                    │
//!                        └──── failed / nacked regions ◄──────┤
//!                                                             ▼
//! client ◄── connection ◄── send queue ◄────────── draw packets
//!    │
//!    └── acks, pings ──► dispatcher ──► quality controller
//! ```
//!
//! Bulk queue slots are reserved when a job is submitted, so a finished
//! job can normally queue its draws. Every draw is kept until the client
//! acknowledges it: one that could not be queued, or whose ack is
//! overdue, is sent again under its original sequence number so the
//! client's in-order decoder is never left waiting on a hole. After
//! `max_draw_resends` attempts, or once the draw has aged out of the
//! resend cache, its region is repainted instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureSource, DamageEvent, DamageReceiver};
use crate::config::EngineConfig;
use crate::damage::{DamageBatcher, Rect};
use crate::dispatch::Dispatcher;
use crate::encode::{CodecSelector, Encoders, EncodePipeline, WindowResult};
use crate::encode::types::Codec;
use crate::error::RdxError;
use crate::message::{Message, MessageType};
use crate::network::{Connection, ConnectionEvent, ConnectionStats, Priority, SendQueue};
use crate::network::handshake::local_capabilities;
use crate::packet::{DrawPacket, Packet};
use crate::quality::{QualityController, QualityState};
use crate::transport::FrameTransport;
use crate::wire::{Side, Value};

/// Draws remembered for matching acks.
const SENT_HISTORY: usize = 1024;

#[derive(Debug)]
struct SentDraw {
    window_id: u64,
    sequence: u64,
    rect: Rect,
    bytes: u64,
    /// When the draw was last queued; `None` until it first fits.
    sent_at: Option<Instant>,
    resends: u32,
    /// Kept for resending while the cache has room.
    packet: Option<DrawPacket>,
}

/// What to do with an unacknowledged draw.
enum Overdue {
    Resend(usize),
    Repaint(usize),
}

// ── SessionState ─────────────────────────────────────────────────

/// Everything the message handlers may touch.
pub struct SessionState {
    controller: QualityController,
    selector: CodecSelector,
    batcher: DamageBatcher,
    sent: VecDeque<SentDraw>,
    stats: Arc<ConnectionStats>,
    epoch: Instant,
    offered: Vec<Codec>,
    peer_reason: Option<String>,
    /// Bytes of encoded draws held in `sent`.
    cached_bytes: usize,
    cache_limit: usize,
    /// Draws in `sent` that have never been queued.
    unqueued: usize,
}

impl SessionState {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn remember(&mut self, mut draw: SentDraw) {
        if self.sent.len() == SENT_HISTORY {
            if let Some(old) = self.sent.pop_front() {
                self.release(&old);
            }
        }
        let size = draw.packet.as_ref().map_or(0, |p| p.data.len());
        if size > self.cache_limit {
            draw.packet = None;
        } else {
            // Evict the oldest cached draws until this one fits.
            for old in self.sent.iter_mut() {
                if self.cached_bytes + size <= self.cache_limit {
                    break;
                }
                if let Some(p) = old.packet.take() {
                    self.cached_bytes -= p.data.len();
                }
            }
            self.cached_bytes += size;
        }
        if draw.sent_at.is_none() {
            self.unqueued += 1;
        }
        self.sent.push_back(draw);
    }

    fn release(&mut self, draw: &SentDraw) {
        if let Some(p) = &draw.packet {
            self.cached_bytes -= p.data.len();
        }
        if draw.sent_at.is_none() {
            self.unqueued -= 1;
        }
    }

    fn forget(&mut self, at: usize) -> Option<SentDraw> {
        let draw = self.sent.remove(at)?;
        self.release(&draw);
        Some(draw)
    }

    fn take_sent(&mut self, window_id: u64, sequence: u64) -> Option<SentDraw> {
        let at = self
            .sent
            .iter()
            .position(|d| d.window_id == window_id && d.sequence == sequence)?;
        self.forget(at)
    }

    fn forget_window(&mut self, window_id: u64) {
        while let Some(at) = self.sent.iter().position(|d| d.window_id == window_id) {
            self.forget(at);
        }
    }

    /// The first draw needing attention at `now`, if any.
    fn next_overdue(&self, now: Instant, timeout: Duration, max_resends: u32) -> Option<Overdue> {
        self.sent.iter().enumerate().find_map(|(at, d)| {
            let due = d.sent_at.is_none_or(|t| now.duration_since(t) >= timeout);
            if !due {
                None
            } else if d.packet.is_none() || (d.sent_at.is_some() && d.resends >= max_resends) {
                Some(Overdue::Repaint(at))
            } else {
                Some(Overdue::Resend(at))
            }
        })
    }
}

fn handlers(queue: Arc<SendQueue>) -> Dispatcher<SessionState> {
    let mut d = Dispatcher::new(queue.clone());

    let replies = queue.clone();
    d.register(MessageType::Ping, move |_: &mut SessionState, packet| {
        if let Packet::Ping { time_us } = packet {
            let echo = Packet::PingEcho {
                echoed_us: time_us,
                backlog: Some(replies.depth() as u64),
            };
            replies.try_push(echo.to_message(), Priority::Control, None)?;
        }
        Ok(())
    });

    d.register(MessageType::PingEcho, |s: &mut SessionState, packet| {
        if let Packet::PingEcho { echoed_us, .. } = packet {
            let rtt = Duration::from_micros(s.now_us().saturating_sub(echoed_us));
            s.controller.on_ping_echo(rtt);
            s.stats.record_rtt(s.controller.current_targets().latency);
            debug!(?rtt, "ping echo");
        }
        Ok(())
    });

    d.register(MessageType::DamageSequence, |s: &mut SessionState, packet| {
        let Packet::DamageSequence(ack) = packet else {
            return Ok(());
        };
        let Some(draw) = s.take_sent(ack.window_id, ack.sequence) else {
            debug!(window_id = ack.window_id, sequence = ack.sequence, "ack for unknown draw");
            return Ok(());
        };
        let now = Instant::now();
        if ack.failed() {
            warn!(
                window_id = ack.window_id,
                sequence = ack.sequence,
                reason = ack.message.as_deref().unwrap_or("unknown"),
                "client failed to decode, resending region"
            );
            s.selector.reset_window(draw.window_id);
            s.batcher.add_region(draw.window_id, draw.rect, now);
        } else {
            s.controller.on_ack(&ack, draw.bytes, now);
        }
        Ok(())
    });

    d.register(MessageType::Encodings, |s: &mut SessionState, packet| {
        if let Packet::Encodings(codecs) = packet {
            let common: Vec<Codec> = s
                .offered
                .iter()
                .copied()
                .filter(|c| *c == Codec::Rgb || codecs.contains(c))
                .collect();
            s.selector.set_client_encodings(common);
        }
        Ok(())
    });

    d.register(MessageType::Disconnect, |s: &mut SessionState, packet| {
        if let Packet::Disconnect { reason } = packet {
            info!(%reason, "client disconnecting");
            s.peer_reason = Some(reason);
        }
        Ok(())
    });

    d.register(MessageType::Error, |_: &mut SessionState, packet| {
        if let Packet::Error { message } = packet {
            warn!(%message, "client reported an error");
        }
        Ok(())
    });

    d
}

// ── Session ──────────────────────────────────────────────────────

pub struct Session {
    connection: Connection,
    dispatcher: Dispatcher<SessionState>,
    state: SessionState,
    queue: Arc<SendQueue>,
    capture: Arc<dyn CaptureSource>,
    pipeline: EncodePipeline,
    results: mpsc::UnboundedReceiver<WindowResult>,
    damage: DamageReceiver,
    ping_interval: Duration,
    ack_timeout: Duration,
    max_resends: u32,
    bulk_capacity: usize,
    /// Bulk slots promised to in-flight jobs, per window.
    reserved: HashMap<u64, usize>,
    /// Set while the bulk queue is full.
    retry_at: Option<Instant>,
}

impl Session {
    pub fn new(
        connection: Connection,
        capture: Arc<dyn CaptureSource>,
        damage: DamageReceiver,
        config: &EngineConfig,
    ) -> Self {
        Self::with_encoders(connection, capture, damage, config, Encoders::standard())
    }

    pub fn with_encoders(
        connection: Connection,
        capture: Arc<dyn CaptureSource>,
        damage: DamageReceiver,
        config: &EngineConfig,
        encoders: Encoders,
    ) -> Self {
        let queue = connection.queue();
        let controller = QualityController::new(config.quality.clone());
        let batch_delay = controller.current_targets().batch_delay;
        let (pipeline, results) = EncodePipeline::new(
            capture.clone(),
            Arc::new(encoders),
            config.encoding.worker_count(),
            connection.cancel_token(),
        );
        let state = SessionState {
            controller,
            selector: CodecSelector::new(
                config.encoding.clone(),
                connection.caps().encodings.clone(),
            ),
            batcher: DamageBatcher::new(&config.batch, batch_delay),
            sent: VecDeque::with_capacity(64),
            stats: connection.stats(),
            epoch: Instant::now(),
            offered: config.encoding.encodings.clone(),
            peer_reason: None,
            cached_bytes: 0,
            cache_limit: config.protocol.resend_cache_bytes,
            unqueued: 0,
        };
        Self {
            dispatcher: handlers(queue.clone()),
            bulk_capacity: config.protocol.bulk_queue_capacity.max(1),
            ping_interval: config.protocol.ping_interval(),
            ack_timeout: config.protocol.ack_timeout(),
            max_resends: config.protocol.max_draw_resends,
            connection,
            state,
            queue,
            capture,
            pipeline,
            results,
            damage,
            reserved: HashMap::new(),
            retry_at: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn quality(&self) -> QualityState {
        self.state.controller.current_targets()
    }

    /// Queue window properties for the client. Repeated updates for the
    /// same window replace each other while queued.
    pub fn announce_window(
        &self,
        window_id: u64,
        properties: std::collections::BTreeMap<String, Value>,
    ) -> Result<(), RdxError> {
        self.dispatcher.send(
            Packet::WindowMetadata {
                window_id,
                properties,
            },
            Priority::Control,
        )
    }

    /// Serve the client until either side closes or `shutdown` fires.
    /// Returns the close reason.
    pub async fn run(mut self, shutdown: CancellationToken) -> String {
        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(peer = %self.connection.peer(), "session started");

        let reason = loop {
            let wake = self.retry_at.or_else(|| self.state.batcher.next_deadline());
            tokio::select! {
                _ = shutdown.cancelled() => break "server shutting down".to_string(),
                event = self.connection.recv() => match event {
                    ConnectionEvent::Message(message) => self.on_message(message),
                    ConnectionEvent::Closed { reason } => break reason,
                },
                Some(event) = self.damage.recv() => self.on_damage(event),
                Some(result) = self.results.recv() => self.on_result(result),
                _ = sleep_until_opt(wake), if wake.is_some() => {}
                _ = ping.tick() => self.on_tick(),
            }
            self.schedule(Instant::now());
        };

        self.pipeline.shutdown();
        self.state.batcher.clear();
        self.connection.close(&reason).await;
        let stats = self.connection.stats().snapshot();
        info!(
            peer = %self.connection.peer(),
            %reason,
            peer_reason = self.state.peer_reason.as_deref().unwrap_or(""),
            messages_in = stats.messages_in,
            messages_out = stats.messages_out,
            "session ended"
        );
        reason
    }

    // ── Event handlers ───────────────────────────────────────────

    fn on_message(&mut self, message: Message) {
        if let Err(e) = self.dispatcher.dispatch(&mut self.state, message) {
            warn!(error = %e, "handler failed");
        }
    }

    fn on_damage(&mut self, event: DamageEvent) {
        let now = Instant::now();
        let batcher = &mut self.state.batcher;
        match event {
            DamageEvent::Damage { window_id, rect } => {
                if batcher.window_size(window_id).is_none() {
                    let Some((w, h)) = self.capture.window_size(window_id) else {
                        debug!(window_id, %rect, "damage for unknown window dropped");
                        return;
                    };
                    batcher.set_window_size(window_id, w, h);
                }
                batcher.add_region(window_id, rect, now);
            }
            DamageEvent::Resize {
                window_id,
                width,
                height,
            } => {
                debug!(window_id, width, height, "window resized");
                batcher.set_window_size(window_id, width, height);
                self.state.selector.reset_window(window_id);
                batcher.add_region(window_id, Rect::new(0, 0, width, height), now);
            }
            DamageEvent::WindowClosed { window_id } => {
                debug!(window_id, "window closed");
                batcher.remove_window(window_id);
                self.state.selector.remove_window(window_id);
                self.pipeline.cancel_window(window_id);
                self.reserved.remove(&window_id);
                self.state.forget_window(window_id);
            }
        }
    }

    fn on_result(&mut self, mut result: WindowResult) {
        let window_id = result.window_id;
        let now = Instant::now();
        self.pipeline.finished(window_id);
        self.reserved.remove(&window_id);
        self.state.batcher.set_busy(window_id, false);
        if !self.state.selector.complete(&mut result) {
            debug!(window_id, "result for closed window discarded");
            return;
        }

        for (rect, error) in result.failed {
            warn!(window_id, %rect, %error, "region could not be encoded, will retry");
            self.state.batcher.add_region(window_id, rect, now);
        }

        for update in result.updates {
            let draw = DrawPacket {
                window_id,
                rect: update.job.rect,
                codec: update.job.codec,
                data: update.region.data,
                sequence: update.job.sequence,
                options: update.region.options,
            };
            let bytes = draw.data.len() as u64;
            let (sequence, rect) = (draw.sequence, draw.rect);
            let sent_at = match self.dispatcher.send(Packet::Draw(draw.clone()), Priority::Bulk) {
                Ok(()) => {
                    debug!(window_id, sequence, codec = %draw.codec, %rect, bytes, "draw queued");
                    Some(now)
                }
                Err(e) => {
                    warn!(window_id, sequence, error = %e, "draw not queued, holding it for resend");
                    None
                }
            };
            self.state.remember(SentDraw {
                window_id,
                sequence,
                rect,
                bytes,
                sent_at,
                resends: 0,
                packet: Some(draw),
            });
        }
    }

    /// Queue draws that never made it out or whose ack is overdue.
    /// Stops at the first draw the bulk queue has no room for.
    fn resend_overdue(&mut self, now: Instant) {
        let timeout = self
            .ack_timeout
            .max(self.state.controller.current_targets().latency * 4)
            .max(Duration::from_millis(1));
        while let Some(next) = self.state.next_overdue(now, timeout, self.max_resends) {
            match next {
                Overdue::Resend(at) => {
                    let draw = &mut self.state.sent[at];
                    let Some(packet) = draw.packet.clone() else {
                        break;
                    };
                    if let Err(e) = self.dispatcher.send(Packet::Draw(packet), Priority::Bulk) {
                        debug!(error = %e, "resend deferred");
                        break;
                    }
                    if draw.sent_at.is_some() {
                        draw.resends += 1;
                        debug!(window_id = draw.window_id, sequence = draw.sequence, resends = draw.resends, "draw resent");
                    } else {
                        self.state.unqueued -= 1;
                    }
                    draw.sent_at = Some(now);
                }
                Overdue::Repaint(at) => {
                    let Some(draw) = self.state.forget(at) else {
                        break;
                    };
                    warn!(
                        window_id = draw.window_id,
                        sequence = draw.sequence,
                        "draw never acknowledged, repainting its region"
                    );
                    if self.state.batcher.window_size(draw.window_id).is_some() {
                        self.state.selector.reset_window(draw.window_id);
                        self.state.batcher.add_region(draw.window_id, draw.rect, now);
                    }
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let (lost, delivered) = self.state.stats.take_loss();
        self.state.controller.on_loss(lost, delivered, now);
        self.resend_overdue(now);

        let ping = Packet::Ping {
            time_us: self.state.now_us(),
        };
        if let Err(e) = self.dispatcher.send(ping, Priority::Control) {
            debug!(error = %e, "ping not queued");
        }
    }

    /// Hand due batches to the pipeline, as far as the bulk queue has
    /// room for their draws.
    fn schedule(&mut self, now: Instant) {
        if self.state.unqueued > 0 {
            self.resend_overdue(now);
        }
        let depth = self.queue.depth_of(Priority::Bulk);
        let state = &mut self.state;
        state.controller.on_send_queue_depth(depth, now);
        let targets = state.controller.current_targets();
        state.batcher.set_batch_delay(targets.batch_delay);

        let reserved: usize = self.reserved.values().sum();
        let mut room = self.bulk_capacity.saturating_sub(depth + reserved);
        if room == 0 {
            if state.batcher.pending_count() > 0 || state.unqueued > 0 {
                self.retry_at = Some(now + targets.batch_delay);
            }
            return;
        }
        self.retry_at = None;

        for mut batch in state.batcher.flush_due(now) {
            let window_id = batch.window_id;
            if room == 0 {
                state.batcher.requeue(window_id, &batch.regions, now);
                self.retry_at = Some(now + targets.batch_delay);
                continue;
            }
            if batch.regions.len() > room {
                let rest = batch.regions.split_off(room);
                state.batcher.requeue(window_id, &rest, now);
                self.retry_at = Some(now + targets.batch_delay);
            }

            let Some(job) = state.selector.plan(&batch, &targets, now) else {
                state.batcher.requeue(window_id, &batch.regions, now);
                continue;
            };
            let planned = job.regions.len();
            match self.pipeline.submit(job) {
                Ok(()) => {
                    room -= planned;
                    self.reserved.insert(window_id, planned);
                    state.batcher.set_busy(window_id, true);
                }
                Err(job) => {
                    let mut unused = WindowResult {
                        window_id,
                        generation: job.generation,
                        updates: Vec::new(),
                        failed: Vec::new(),
                        state: job.state,
                        next_sequence: job.next_sequence,
                    };
                    state.selector.complete(&mut unused);
                    state.batcher.requeue(window_id, &batch.regions, now);
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

/// Handshake with a client over `transport` and serve it until the
/// connection ends. Returns the close reason.
pub async fn serve<T: FrameTransport>(
    transport: T,
    capture: Arc<dyn CaptureSource>,
    damage: DamageReceiver,
    config: &EngineConfig,
    shutdown: CancellationToken,
) -> Result<String, RdxError> {
    let local = local_capabilities(&config.protocol, &config.encoding.encodings);
    let connection = Connection::establish(transport, Side::Host, local, &config.protocol).await?;
    Ok(Session::new(connection, capture, damage, config)
        .run(shutdown)
        .await)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, EncodingConfig, QualityConfig};

    fn state(cache_limit: usize) -> SessionState {
        SessionState {
            controller: QualityController::new(QualityConfig::default()),
            selector: CodecSelector::new(EncodingConfig::default(), vec![Codec::Rgb]),
            batcher: DamageBatcher::new(&BatchConfig::default(), Duration::from_millis(10)),
            sent: VecDeque::new(),
            stats: Arc::new(ConnectionStats::new()),
            epoch: Instant::now(),
            offered: vec![Codec::Rgb],
            peer_reason: None,
            cached_bytes: 0,
            cache_limit,
            unqueued: 0,
        }
    }

    fn draw(sequence: u64, size: usize, sent_at: Option<Instant>) -> SentDraw {
        let rect = Rect::new(0, 0, 4, 4);
        SentDraw {
            window_id: 1,
            sequence,
            rect,
            bytes: size as u64,
            sent_at,
            resends: 0,
            packet: Some(DrawPacket {
                window_id: 1,
                rect,
                codec: Codec::Rgb,
                data: vec![0; size],
                sequence,
                options: Default::default(),
            }),
        }
    }

    #[test]
    fn cache_evicts_oldest_packets_first() {
        let now = Instant::now();
        let mut s = state(100);
        s.remember(draw(1, 60, Some(now)));
        s.remember(draw(2, 30, Some(now)));
        s.remember(draw(3, 50, Some(now)));
        assert!(s.sent[0].packet.is_none());
        assert!(s.sent[1].packet.is_some());
        assert_eq!(s.cached_bytes, 80);

        s.take_sent(1, 2);
        assert_eq!(s.cached_bytes, 50);
        s.remember(draw(4, 500, Some(now)));
        assert!(s.sent.back().is_some_and(|d| d.packet.is_none()));
        assert_eq!(s.cached_bytes, 50);
    }

    #[test]
    fn overdue_draws_are_resent_then_repainted() {
        let start = Instant::now();
        let timeout = Duration::from_millis(100);
        let mut s = state(1024);
        s.remember(draw(1, 10, Some(start)));
        assert!(s.next_overdue(start, timeout, 2).is_none());

        let late = start + timeout;
        assert!(matches!(s.next_overdue(late, timeout, 2), Some(Overdue::Resend(0))));
        s.sent[0].resends = 2;
        assert!(matches!(s.next_overdue(late, timeout, 2), Some(Overdue::Repaint(0))));
    }

    #[test]
    fn unqueued_draws_are_due_at_once() {
        let now = Instant::now();
        let mut s = state(1024);
        s.remember(draw(1, 10, Some(now)));
        s.remember(draw(2, 10, None));
        assert_eq!(s.unqueued, 1);
        assert!(matches!(
            s.next_overdue(now, Duration::from_secs(1), 0),
            Some(Overdue::Resend(1))
        ));

        s.forget_window(1);
        assert_eq!(s.unqueued, 0);
        assert_eq!(s.cached_bytes, 0);
        assert!(s.sent.is_empty());
    }

    #[test]
    fn evicted_draw_is_repainted() {
        let start = Instant::now();
        let mut s = state(10);
        s.remember(draw(1, 10, Some(start)));
        s.remember(draw(2, 10, Some(start)));
        let late = start + Duration::from_secs(2);
        assert!(matches!(
            s.next_overdue(late, Duration::from_secs(1), 3),
            Some(Overdue::Repaint(0))
        ));
    }
}
