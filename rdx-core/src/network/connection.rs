//! One peer connection: handshake, I/O loops, and orderly close.
//!
//! After the handshake, two tasks run per connection:
//!
//! - **outbound**: pops the [`SendQueue`] (control before bulk), encodes
//!   each message into frames, and writes them to the transport.
//! - **inbound**: reads frames, decodes messages, and forwards them to
//!   the owner over a bounded channel.
//!
//! They share only the queue and the atomic counters in
//! [`ConnectionStats`]. A message that fails to decode is dropped,
//! counted, and answered with an `error` message; a framing or transport
//! error closes the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::error::{HandshakeError, RdxError};
use crate::message::{Message, MessageType};
use crate::network::handshake::{exchange_hello, send_message};
use crate::network::phase::ConnectionPhase;
use crate::network::queue::{Priority, SendQueue};
use crate::packet::{Capabilities, NegotiatedCaps, Packet};
use crate::transport::{BoxFrameSink, BoxFrameSource, FrameTransport};
use crate::wire::{Side, WireCodec, WireDecoder, WireEncoder, crypto};

// ── ConnectionStats ──────────────────────────────────────────────

/// Lock-free counters shared by both I/O loops and the owner.
#[derive(Debug)]
pub struct ConnectionStats {
    created: Instant,
    last_activity_us: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    decode_errors: AtomicU64,
    last_rtt_us: AtomicU64,
    lost: AtomicU64,
    delivered: AtomicU64,
}

/// A point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub decode_errors: u64,
    pub last_rtt: Duration,
    pub idle: Duration,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            last_activity_us: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            last_rtt_us: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let us = self.created.elapsed().as_micros() as u64;
        self.last_activity_us.store(us, Ordering::Relaxed);
    }

    fn record_in(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    fn record_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Smoothed round-trip time as last computed by the owner.
    pub fn record_rtt(&self, rtt: Duration) {
        self.last_rtt_us.store(rtt.as_micros() as u64, Ordering::Relaxed);
    }

    /// Loss counts accumulated since the previous call.
    pub fn take_loss(&self) -> (u64, u64) {
        (
            self.lost.swap(0, Ordering::Relaxed),
            self.delivered.swap(0, Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last = Duration::from_micros(self.last_activity_us.load(Ordering::Relaxed));
        StatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            last_rtt: Duration::from_micros(self.last_rtt_us.load(Ordering::Relaxed)),
            idle: self.created.elapsed().saturating_sub(last),
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

// ── ConnectionEvent ──────────────────────────────────────────────

/// What the owner receives from [`Connection::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Message(Message),
    /// The connection is gone. No further events follow.
    Closed { reason: String },
}

// ── Shared ───────────────────────────────────────────────────────

/// State reachable from both I/O tasks and the owner.
struct Shared {
    queue: Arc<SendQueue>,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
    phase: watch::Sender<ConnectionPhase>,
    reason: Mutex<Option<String>>,
    drain_timeout: Duration,
}

impl Shared {
    fn reason(&self) -> String {
        self.reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "connection closed".to_string())
    }

    /// Record the first close reason, queue a final `disconnect`, and stop
    /// accepting messages. Returns `false` if a close was already underway.
    fn begin_close(&self, reason: &str) -> bool {
        {
            let Ok(mut slot) = self.reason.lock() else { return false };
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.to_string());
        }
        let bye = Packet::Disconnect {
            reason: reason.to_string(),
        };
        self.queue.close_with(bye.to_message());
        self.phase.send_modify(|p| {
            if p.begin_close().is_err() {
                p.force_close();
            }
        });
        true
    }

    /// Close initiated from inside an I/O loop. The outbound loop gets
    /// `drain_timeout` to flush the `disconnect` before both loops stop.
    fn fail(&self, reason: &str) {
        if !self.begin_close(reason) {
            return;
        }
        warn!(%reason, "closing connection");
        let cancel = self.cancel.clone();
        let drain = self.drain_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(drain) => cancel.cancel(),
            }
        });
    }

    fn finish(&self) {
        self.cancel.cancel();
        self.phase.send_modify(|p| {
            if p.finish_close().is_err() {
                p.force_close();
            }
        });
    }
}

// ── Connection ───────────────────────────────────────────────────

/// An established connection, owned by its session.
///
/// Dropping it cancels both I/O loops.
pub struct Connection {
    peer: String,
    caps: NegotiatedCaps,
    shared: Arc<Shared>,
    events: mpsc::Receiver<Message>,
    phase_rx: watch::Receiver<ConnectionPhase>,
    outbound: Option<JoinHandle<()>>,
    inbound: Option<JoinHandle<()>>,
}

impl Connection {
    /// Run the handshake over `transport` and start the I/O loops.
    ///
    /// Fails if the peer does not answer within the handshake timeout or
    /// if there is no common ground; in the latter case the peer is sent a
    /// `disconnect` with the reason first.
    pub async fn establish<T: FrameTransport>(
        transport: T,
        side: Side,
        local: Capabilities,
        config: &ProtocolConfig,
    ) -> Result<Connection, RdxError> {
        let peer = transport.peer();
        let (mut source, mut sink) = transport.split();
        let mut phase = ConnectionPhase::default();
        let mut codec = WireCodec::new(config);

        phase.begin_handshake()?;
        debug!(%peer, "handshake started");

        let exchange = exchange_hello(&mut source, &mut sink, &mut codec, &local);
        let remote = match tokio::time::timeout(config.handshake_timeout(), exchange).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                let _ = sink.shutdown().await;
                return Err(e);
            }
            Err(_) => {
                let _ = send_message(&mut sink, &mut codec, bye("handshake timeout")).await;
                let _ = sink.shutdown().await;
                return Err(RdxError::Timeout(config.handshake_timeout()));
            }
        };

        let caps = match local.negotiate(&remote) {
            Ok(caps) => caps,
            Err(e) => {
                warn!(%peer, error = %e, "capability negotiation failed");
                let _ = send_message(&mut sink, &mut codec, bye(&e.to_string())).await;
                let _ = sink.shutdown().await;
                return Err(e.into());
            }
        };

        let (mut encoder, mut decoder) = codec.into_parts();
        encoder.set_compression(caps.compression);
        encoder.set_max_message_size(caps.max_message_size);
        decoder.set_max_message_size(caps.max_message_size);
        if caps.encryption {
            let secret = config
                .encryption_secret
                .as_deref()
                .ok_or(HandshakeError::Encryption("no secret configured"))?;
            let (sealer, opener) = crypto::derive(secret.as_bytes(), side);
            encoder.enable_encryption(sealer);
            decoder.enable_encryption(opener);
        }

        phase.complete_handshake()?;
        info!(
            %peer,
            compression = %caps.compression,
            encryption = caps.encryption,
            encodings = ?caps.encodings,
            "connection active"
        );

        let (phase_tx, phase_rx) = watch::channel(phase);
        let shared = Arc::new(Shared {
            queue: Arc::new(SendQueue::new(
                config.control_queue_capacity,
                config.bulk_queue_capacity,
            )),
            stats: Arc::new(ConnectionStats::new()),
            cancel: CancellationToken::new(),
            phase: phase_tx,
            reason: Mutex::new(None),
            drain_timeout: config.drain_timeout(),
        });
        let (events_tx, events) = mpsc::channel(config.inbound_channel_capacity.max(1));

        let outbound = tokio::spawn(run_outbound(sink, encoder, shared.clone()));
        let inbound = tokio::spawn(run_inbound(source, decoder, events_tx, shared.clone()));

        Ok(Connection {
            peer,
            caps,
            shared,
            events,
            phase_rx,
            outbound: Some(outbound),
            inbound: Some(inbound),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn caps(&self) -> &NegotiatedCaps {
        &self.caps
    }

    /// The outbound queue, for dispatchers and producers.
    pub fn queue(&self) -> Arc<SendQueue> {
        self.shared.queue.clone()
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        self.shared.stats.clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase_rx.borrow().clone()
    }

    /// Watch the lifecycle; `Closed` is published exactly once.
    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_rx.clone()
    }

    /// A token cancelled when the connection goes away. Session components
    /// use it to discard in-flight work.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.child_token()
    }

    /// Next inbound message, or `Closed` once the connection is gone.
    pub async fn recv(&mut self) -> ConnectionEvent {
        match self.events.recv().await {
            Some(message) => {
                self.shared.stats.messages_in.fetch_add(1, Ordering::Relaxed);
                ConnectionEvent::Message(message)
            }
            None => ConnectionEvent::Closed {
                reason: self.shared.reason(),
            },
        }
    }

    /// Orderly close: send `disconnect`, drain the queue within the drain
    /// timeout, then stop both loops.
    pub async fn close(&mut self, reason: &str) {
        if self.shared.begin_close(reason) {
            info!(peer = %self.peer, %reason, "closing connection");
        }
        if let Some(mut outbound) = self.outbound.take() {
            if tokio::time::timeout(self.shared.drain_timeout, &mut outbound)
                .await
                .is_err()
            {
                warn!(peer = %self.peer, "drain timeout, dropping queued messages");
                outbound.abort();
            }
        }
        self.shared.finish();
        if let Some(inbound) = self.inbound.take() {
            let _ = inbound.await;
        }
        self.shared.queue.clear();
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.reason.lock().ok().and_then(|r| r.clone())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn bye(reason: &str) -> Message {
    Packet::Disconnect {
        reason: reason.to_string(),
    }
    .to_message()
}

// ── I/O loops ────────────────────────────────────────────────────

async fn run_outbound(mut sink: BoxFrameSink, mut encoder: WireEncoder, shared: Arc<Shared>) {
    let cancel = shared.cancel.clone();
    'messages: loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            m = shared.queue.pop() => m,
        };
        let Some(message) = message else { break };
        let kind = message.kind.clone();

        let frames = match encoder.encode(message) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%kind, error = %e, "dropping unencodable message");
                continue;
            }
        };
        for frame in frames {
            let len = frame.wire_len();
            let written = tokio::select! {
                _ = cancel.cancelled() => break 'messages,
                r = sink.write_frame(frame) => r,
            };
            if let Err(e) = written {
                let reason = e.reason();
                shared.begin_close(&reason);
                shared.queue.clear();
                shared.finish();
                return;
            }
            shared.stats.record_out(len);
        }
        shared.stats.messages_out.fetch_add(1, Ordering::Relaxed);
        debug!(%kind, "message sent");
    }
    let _ = sink.shutdown().await;
    shared.finish();
}

async fn run_inbound(
    mut source: BoxFrameSource,
    mut decoder: WireDecoder,
    events: mpsc::Sender<Message>,
    shared: Arc<Shared>,
) {
    let cancel = shared.cancel.clone();
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = source.read_frame() => r,
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                shared.fail("peer closed the connection");
                break;
            }
            Err(e) => {
                shared.fail(&e.reason());
                break;
            }
        };
        shared.stats.record_in(frame.wire_len());
        let loss = source.take_loss();
        if loss.lost > 0 || loss.delivered > 0 {
            shared.stats.lost.fetch_add(loss.lost, Ordering::Relaxed);
            shared.stats.delivered.fetch_add(loss.delivered, Ordering::Relaxed);
        }

        match decoder.decode(frame) {
            Ok(Some(message)) => {
                debug!(%message, "message received");
                let is_disconnect = message.message_type() == Some(MessageType::Disconnect);
                let delivered = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = events.send(message) => r,
                };
                if delivered.is_err() {
                    break;
                }
                if is_disconnect {
                    // The peer is going away; nothing useful follows.
                    shared.fail("peer disconnected");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                shared.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping undecodable message");
                let notice = Packet::Error {
                    message: e.to_string(),
                };
                let _ = shared
                    .queue
                    .try_push(notice.to_message(), Priority::Control, None);
            }
        }
    }
}
