//! Integration tests: host session and reference client talking over
//! in-memory pipes, TCP, and UDP on localhost.

use std::sync::Arc;
use std::time::Duration;

use rdx_core::capture::{DamageNotifier, MemorySource};
use async_trait::async_trait;
use rdx_core::error::FrameError;
use rdx_core::transport::{BoxFrameSink, BoxFrameSource, FrameSink, FrameSource};
use rdx_core::wire::{WireDecoder, WireEncoder};
use rdx_core::{
    Client, ClientUpdate, Codec, DatagramTransport, EngineConfig, Frame, FrameTransport, Message,
    MessageType, Packet, ProtocolConfig, RdxError, Rect, StreamTransport, serve,
};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────

const MAX: usize = 64 * 1024 * 1024;

struct Host {
    source: Arc<MemorySource>,
    notifier: DamageNotifier,
    shutdown: CancellationToken,
    task: JoinHandle<Result<String, RdxError>>,
}

fn config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.protocol.ping_interval_ms = 200;
    cfg
}

/// Start a host serving one 64x48 window over `transport`.
fn spawn_host<T: FrameTransport>(transport: T, cfg: EngineConfig) -> Host {
    let source = Arc::new(MemorySource::new());
    source.set_window(1, 64, 48, 0x40);
    let (notifier, damage) = DamageNotifier::channel();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let source = source.clone();
        let shutdown = shutdown.clone();
        async move { serve(transport, source, damage, &cfg, shutdown).await }
    });
    Host {
        source,
        notifier,
        shutdown,
        task,
    }
}

fn duplex_pair() -> (
    StreamTransport<tokio::io::DuplexStream>,
    StreamTransport<tokio::io::DuplexStream>,
) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (
        StreamTransport::new(a, MAX, "client"),
        StreamTransport::new(b, MAX, "host"),
    )
}

/// Next draw-related update, skipping metadata.
async fn next_draw(client: &mut Client) -> ClientUpdate {
    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), client.next_update())
            .await
            .expect("no update within 5s")
            .expect("connection closed");
        if !matches!(update, ClientUpdate::Metadata { .. }) {
            return update;
        }
    }
}

fn drawn(update: ClientUpdate) -> (u64, Rect, Codec) {
    match update {
        ClientUpdate::Drawn {
            sequence,
            rect,
            codec,
            ..
        } => (sequence, rect, codec),
        other => panic!("expected a draw, got {other:?}"),
    }
}

/// Host-side transport that loses one draw on the way out.
struct DropsDraw<T> {
    inner: T,
    sequence: u64,
    protocol: ProtocolConfig,
}

struct DroppingSink {
    inner: BoxFrameSink,
    peek: WireDecoder,
    sequence: u64,
    dropped: bool,
}

impl<T: FrameTransport> FrameTransport for DropsDraw<T> {
    fn split(self) -> (BoxFrameSource, BoxFrameSink) {
        let (source, sink) = self.inner.split();
        let sink = DroppingSink {
            inner: sink,
            peek: WireDecoder::new(&self.protocol),
            sequence: self.sequence,
            dropped: false,
        };
        (source, Box::new(sink))
    }

    fn peer(&self) -> String {
        self.inner.peer()
    }
}

#[async_trait]
impl FrameSink for DroppingSink {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        if !self.dropped {
            if let Ok(Some(message)) = self.peek.decode(frame.clone()) {
                if let Ok(Packet::Draw(draw)) = Packet::from_message(message) {
                    if draw.sequence == self.sequence {
                        self.dropped = true;
                        return Ok(());
                    }
                }
            }
        }
        self.inner.write_frame(frame).await
    }

    async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await
    }
}

// ── Sessions ─────────────────────────────────────────────────────

#[tokio::test]
async fn first_update_is_a_lossless_full_window() {
    let (host_side, client_side) = duplex_pair();
    let host = spawn_host(host_side, config());
    let mut client = Client::connect(client_side, &config()).await.unwrap();

    host.notifier.notify_resize(1, 64, 48).unwrap();
    let (sequence, rect, codec) = drawn(next_draw(&mut client).await);
    assert_eq!(sequence, 1);
    assert_eq!(rect, Rect::new(0, 0, 64, 48));
    assert_eq!(codec, Codec::Rgb);
    assert_eq!(client.pixel(1, 10, 10), Some(&[0x40; 4][..]));

    host.shutdown.cancel();
    let reason = host.task.await.unwrap().unwrap();
    assert_eq!(reason, "server shutting down");
}

#[tokio::test]
async fn damage_reaches_the_client_in_order() {
    let (host_side, client_side) = duplex_pair();
    let host = spawn_host(host_side, config());
    let mut client = Client::connect(client_side, &config()).await.unwrap();

    host.notifier.notify_resize(1, 64, 48).unwrap();
    drawn(next_draw(&mut client).await);

    let colours = [[0x10, 0x20, 0x30, 0xFF], [0x50, 0x60, 0x70, 0xFF], [0x80, 0x90, 0xA0, 0xFF]];
    let mut last_sequence = 1;
    for (i, colour) in colours.iter().enumerate() {
        let rect = Rect::new(i as u32 * 16, 0, 16, 16);
        host.source.paint(1, rect, *colour).unwrap();
        host.notifier.notify_damage(1, rect).unwrap();

        let (sequence, got, _) = drawn(next_draw(&mut client).await);
        assert_eq!(sequence, last_sequence + 1);
        assert!(got.contains(&rect), "{got} does not cover {rect}");
        last_sequence = sequence;
    }
    // Colours are multiples of 16, so even a lossy draw reproduces them.
    assert_eq!(client.pixel(1, 36, 4), Some(&colours[2][..]));
    host.shutdown.cancel();
}

#[tokio::test]
async fn failed_captures_are_retried_not_lost() {
    let (host_side, client_side) = duplex_pair();
    let host = spawn_host(host_side, config());
    let mut client = Client::connect(client_side, &config()).await.unwrap();

    host.source.set_failing(1, true);
    host.notifier.notify_resize(1, 64, 48).unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(150), client.next_update()).await;
    assert!(nothing.is_err(), "a draw arrived while capture was failing");

    host.source.set_failing(1, false);
    let (sequence, rect, _) = drawn(next_draw(&mut client).await);
    assert_eq!(sequence, 1);
    assert_eq!(rect, Rect::new(0, 0, 64, 48));
    host.shutdown.cancel();
}

#[tokio::test]
async fn client_can_narrow_its_encodings() {
    let (host_side, client_side) = duplex_pair();
    let host = spawn_host(host_side, config());
    let mut client = Client::connect(client_side, &config()).await.unwrap();
    let full = Rect::new(0, 0, 64, 48);

    host.notifier.notify_resize(1, 64, 48).unwrap();
    assert_eq!(drawn(next_draw(&mut client).await).2, Codec::Rgb);
    host.notifier.notify_damage(1, full).unwrap();
    assert_eq!(drawn(next_draw(&mut client).await).2, Codec::Lossy);

    client.send_encodings(vec![Codec::Rgb]).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..3 {
        host.notifier.notify_damage(1, full).unwrap();
        assert_eq!(drawn(next_draw(&mut client).await).2, Codec::Rgb);
    }
    host.shutdown.cancel();
}

#[tokio::test]
async fn closed_window_stops_producing_draws() {
    let (host_side, client_side) = duplex_pair();
    let host = spawn_host(host_side, config());
    let mut client = Client::connect(client_side, &config()).await.unwrap();

    host.notifier.notify_resize(1, 64, 48).unwrap();
    drawn(next_draw(&mut client).await);

    host.source.remove_window(1);
    host.notifier.notify_window_closed(1).unwrap();
    host.notifier.notify_damage(1, Rect::new(0, 0, 8, 8)).unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(150), client.next_update()).await;
    assert!(nothing.is_err());
    host.shutdown.cancel();
}

#[tokio::test]
async fn lost_draw_is_resent_under_its_sequence() {
    let mut cfg = config();
    cfg.protocol.ack_timeout_ms = 200;
    let (host_side, client_side) = duplex_pair();
    let lossy = DropsDraw {
        inner: host_side,
        sequence: 2,
        protocol: cfg.protocol.clone(),
    };
    let host = spawn_host(lossy, cfg.clone());
    let mut client = Client::connect(client_side, &cfg).await.unwrap();

    host.notifier.notify_resize(1, 64, 48).unwrap();
    assert_eq!(drawn(next_draw(&mut client).await).0, 1);

    let rect = Rect::new(8, 8, 8, 8);
    host.source.paint(1, rect, [0xF0, 0x10, 0x10, 0xFF]).unwrap();
    host.notifier.notify_damage(1, rect).unwrap();
    let (sequence, got, _) = drawn(next_draw(&mut client).await);
    assert_eq!(sequence, 2);
    assert!(got.contains(&rect));

    let later = Rect::new(40, 24, 8, 8);
    host.notifier.notify_damage(1, later).unwrap();
    assert_eq!(drawn(next_draw(&mut client).await).0, 3);
    host.shutdown.cancel();
}

#[tokio::test]
async fn encrypted_session() {
    let mut cfg = config();
    cfg.protocol.encryption_secret = Some("correct horse".into());
    let (host_side, client_side) = duplex_pair();
    let host = spawn_host(host_side, cfg.clone());
    let mut client = Client::connect(client_side, &cfg).await.unwrap();
    assert!(client.connection().caps().encryption);

    host.notifier.notify_resize(1, 64, 48).unwrap();
    drawn(next_draw(&mut client).await);
    assert_eq!(client.pixel(1, 0, 0), Some(&[0x40; 4][..]));
    host.shutdown.cancel();
}

#[tokio::test]
async fn encryption_mismatch_fails_both_sides() {
    let mut secret = config();
    secret.protocol.encryption_secret = Some("s3cret".into());
    let (host_side, client_side) = duplex_pair();
    let host = spawn_host(host_side, config());

    let client = Client::connect(client_side, &secret).await;
    assert!(client.is_err());
    let host_result = host.task.await.unwrap();
    assert!(matches!(host_result, Err(RdxError::Handshake(_))));
}

// ── Transports ───────────────────────────────────────────────────

#[tokio::test]
async fn tcp_session_and_client_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connect = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        Client::connect(StreamTransport::tcp(stream, MAX), &config()).await
    });
    let (stream, _) = listener.accept().await.unwrap();
    let host = spawn_host(StreamTransport::tcp(stream, MAX), config());
    let mut client = connect.await.unwrap().unwrap();

    host.notifier.notify_resize(1, 64, 48).unwrap();
    drawn(next_draw(&mut client).await);

    client.close("user quit").await;
    let reason = tokio::time::timeout(Duration::from_secs(5), host.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(reason.contains("disconnect"), "host saw: {reason}");
}

#[tokio::test]
async fn udp_session() {
    let host_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_socket.local_addr().unwrap();
    let client_addr = client_socket.local_addr().unwrap();

    let host = spawn_host(DatagramTransport::new(host_socket, client_addr, MAX), config());
    let mut client = Client::connect(DatagramTransport::new(client_socket, host_addr, MAX), &config())
        .await
        .unwrap();

    host.notifier.notify_resize(1, 64, 48).unwrap();
    let (sequence, rect, _) = drawn(next_draw(&mut client).await);
    assert_eq!(sequence, 1);
    assert_eq!(rect, Rect::new(0, 0, 64, 48));
    host.shutdown.cancel();
}

#[tokio::test]
async fn three_messages_with_induced_delay() {
    let cfg = config().protocol;
    let mut encoder = WireEncoder::new(&cfg);
    let mut wire = Vec::new();
    for t in [1u64, 2, 3] {
        let frames = encoder
            .encode(Packet::Ping { time_us: t }.to_message())
            .unwrap();
        let bytes: Vec<u8> = frames.iter().flat_map(|f| f.to_bytes()).collect();
        wire.push(bytes);
    }

    let mock = tokio_test::io::Builder::new()
        .read(&wire[0])
        .wait(Duration::from_millis(50))
        .read(&wire[1])
        .wait(Duration::from_millis(50))
        .read(&wire[2])
        .build();
    let (mut source, _sink) = StreamTransport::new(mock, MAX, "mock").split();
    let mut decoder = WireDecoder::new(&cfg);

    let mut received = Vec::new();
    for _ in 0..3 {
        let frame = source.read_frame().await.unwrap().unwrap();
        let message: Message = decoder.decode(frame).unwrap().unwrap();
        assert_eq!(message.message_type(), Some(MessageType::Ping));
        received.push(message.field(0).and_then(|v| v.as_int()).unwrap());
    }
    assert_eq!(received, vec![1, 2, 3]);
}

#[tokio::test]
async fn oversized_frame_closes_the_stream() {
    let (a, b) = tokio::io::duplex(1 << 16);
    let (_, mut sink) = StreamTransport::new(a, MAX, "big").split();
    let (mut source, _) = StreamTransport::new(b, 1024, "small").split();

    let mut encoder = WireEncoder::new(&config().protocol);
    let big = Message::of(MessageType::Error).with("x".repeat(4000));
    for frame in encoder.encode(big).unwrap() {
        sink.write_frame(frame).await.unwrap();
    }
    assert!(source.read_frame().await.is_err());
}
