//! Headless host service.
//!
//! Accepts clients over TCP (and optionally UDP) and serves each one a
//! synthetic window: a moving bar over a gradient, repainted at the
//! configured frame rate through an in-memory capture source.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rdx_core::capture::{DamageNotifier, MemorySource};
use rdx_core::network::local_capabilities;
use rdx_core::{
    Connection, DatagramTransport, FrameTransport, RdxError, Rect, Session, Side,
    StreamTransport, Value,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DisplayConfig, HostConfig};

/// Window id of the test pattern.
pub const PATTERN_WINDOW: u64 = 1;

// ── HostService ──────────────────────────────────────────────────

/// The top-level host service.
pub struct HostService {
    config: Arc<HostConfig>,
    shutdown: CancellationToken,
}

impl HostService {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the service (and every session) when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Run until the shutdown token fires, then wait for sessions to
    /// send their `disconnect`.
    pub async fn run(&self) -> Result<(), RdxError> {
        let net = &self.config.network;
        let listener = TcpListener::bind(&net.tcp_listen).await?;
        info!("listening on tcp {}", listener.local_addr()?);

        let mut sessions = JoinSet::new();
        if !net.udp_listen.is_empty() {
            let config = Arc::clone(&self.config);
            let shutdown = self.shutdown.clone();
            sessions.spawn(async move { udp_loop(config, shutdown).await });
        }

        let slots = Arc::new(Semaphore::new(net.max_sessions.max(1)));
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept error: {e}");
                        continue;
                    }
                },
            };
            info!(%peer, "client connected");

            let transport = StreamTransport::tcp(stream, self.config.engine.protocol.max_message_size);
            let config = Arc::clone(&self.config);
            let shutdown = self.shutdown.clone();
            sessions.spawn(async move {
                log_outcome(peer.to_string(), run_session(transport, &config, shutdown).await);
                drop(permit);
            });
        }

        info!("stopping, waiting for {} session(s)", sessions.len());
        while sessions.join_next().await.is_some() {}
        info!("host service stopped");
        Ok(())
    }
}

/// Serve datagram clients one at a time on the configured UDP address.
/// The first datagram's source becomes the session peer.
async fn udp_loop(config: Arc<HostConfig>, shutdown: CancellationToken) {
    let mut buf = [0u8; 1];
    while !shutdown.is_cancelled() {
        let socket = match UdpSocket::bind(&config.network.udp_listen).await {
            Ok(s) => s,
            Err(e) => {
                error!("udp bind {} failed: {e}", config.network.udp_listen);
                return;
            }
        };
        info!("listening on udp {}", config.network.udp_listen);

        let peer: SocketAddr = tokio::select! {
            _ = shutdown.cancelled() => return,
            peeked = socket.peek_from(&mut buf) => match peeked {
                Ok((_, from)) => from,
                Err(e) => {
                    warn!("udp receive error: {e}");
                    continue;
                }
            },
        };
        info!(%peer, "datagram client connected");

        let protocol = &config.engine.protocol;
        let transport = DatagramTransport::new(socket, peer, protocol.max_message_size)
            .with_mtu(protocol.datagram_mtu)
            .with_reorder(protocol.reorder_window, protocol.gap_timeout());
        log_outcome(peer.to_string(), run_session(transport, &config, shutdown.clone()).await);
    }
}

fn log_outcome(peer: String, outcome: Result<String, RdxError>) {
    match outcome {
        Ok(reason) => info!(%peer, %reason, "session ended"),
        Err(RdxError::Handshake(e)) => warn!(%peer, "handshake failed: {e}"),
        Err(e) => error!(%peer, "session error: {e}"),
    }
}

/// Handshake, announce the pattern window, and serve until either side
/// closes. The animation stops with the session.
pub async fn run_session<T: FrameTransport>(
    transport: T,
    config: &HostConfig,
    shutdown: CancellationToken,
) -> Result<String, RdxError> {
    let engine = &config.engine;
    let local = local_capabilities(&engine.protocol, &engine.encoding.encodings);
    let connection = Connection::establish(transport, Side::Host, local, &engine.protocol).await?;

    let source = Arc::new(MemorySource::new());
    let (notifier, damage) = DamageNotifier::with_limit(engine.batch.max_pending_regions);
    let pattern = TestPattern::new(&config.display);
    pattern.install(&source, &notifier)?;

    let session = Session::new(connection, source.clone(), damage, engine);
    let mut properties = BTreeMap::new();
    properties.insert("title".to_string(), Value::Str(config.display.title.clone()));
    properties.insert("width".to_string(), Value::Int(pattern.width as i64));
    properties.insert("height".to_string(), Value::Int(pattern.height as i64));
    session.announce_window(PATTERN_WINDOW, properties)?;

    let done = shutdown.child_token();
    let animator = tokio::spawn(pattern.animate(source, notifier, done.clone()));
    let reason = session.run(shutdown).await;
    done.cancel();
    if let Err(e) = animator.await {
        debug!("animator ended abnormally: {e}");
    }
    Ok(reason)
}

// ── Test pattern ─────────────────────────────────────────────────

const BACKGROUND: [u8; 4] = [0x30, 0x30, 0x30, 0xFF];
const BAR: [u8; 4] = [0x20, 0xA0, 0xF0, 0xFF];

/// A horizontal bar sweeping down a grey window.
#[derive(Debug, Clone)]
pub struct TestPattern {
    width: u32,
    height: u32,
    bar_height: u32,
    frame_interval: Duration,
}

impl TestPattern {
    pub fn new(display: &DisplayConfig) -> Self {
        let width = display.width.max(1);
        let height = display.height.max(1);
        Self {
            width,
            height,
            bar_height: display.bar_height.clamp(1, height),
            frame_interval: Duration::from_secs(1) / display.fps.max(1),
        }
    }

    /// Create the window and report its size.
    pub fn install(&self, source: &MemorySource, notifier: &DamageNotifier) -> Result<(), RdxError> {
        source.set_window(PATTERN_WINDOW, self.width, self.height, 0);
        source.paint(PATTERN_WINDOW, Rect::new(0, 0, self.width, self.height), BACKGROUND);
        notifier.notify_resize(PATTERN_WINDOW, self.width, self.height)
    }

    /// Bar position for a frame number.
    pub fn bar_at(&self, frame: u64) -> Rect {
        let travel = (self.height - self.bar_height + 1) as u64;
        Rect::new(0, (frame % travel) as u32, self.width, self.bar_height)
    }

    /// Move the bar once per frame interval until `stop` fires.
    pub async fn animate(self, source: Arc<MemorySource>, notifier: DamageNotifier, stop: CancellationToken) {
        let mut tick = tokio::time::interval(self.frame_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut previous: Option<Rect> = None;
        let mut frame = 0u64;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            let bar = self.bar_at(frame);
            frame += 1;

            let mut damaged = Vec::with_capacity(2);
            if let Some(old) = previous {
                source.paint(PATTERN_WINDOW, old, BACKGROUND);
                damaged.push(old);
            }
            source.paint(PATTERN_WINDOW, bar, BAR);
            damaged.push(bar);
            previous = Some(bar);

            for rect in damaged {
                if notifier.notify_damage(PATTERN_WINDOW, rect).is_err() {
                    debug!("session gone, animation stopped");
                    return;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
