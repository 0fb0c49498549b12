//! UDP transport with fragmentation and a reorder window.
//!
//! Every outbound frame is stamped with a sequence number (header flag
//! `SEQUENCED`), serialised, and split into MTU-sized datagrams. Each
//! datagram starts with a fragment header:
//!
//! ```text
//! sequence:  u32 LE (4)
//! index:     u16 LE (2)
//! count:     u16 LE (2)
//! data:      [u8] (≤ MTU − 8)
//! ```
//!
//! The receiver reassembles fragments into frames and feeds them through a
//! [`ReorderBuffer`], which hands frames to the connection exactly once and
//! in sequence order. A missing frame holds back later ones until either
//! the window overflows or the gap outlives the gap timeout; then it is
//! skipped and counted as lost.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::read_header;
use crate::error::FrameError;
use crate::frame::Frame;
use crate::header::HEADER_SIZE;
use crate::transport::{
    BoxFrameSink, BoxFrameSource, FrameSink, FrameSource, FrameTransport, LossReport,
};

// ── FragmentHeader ───────────────────────────────────────────────

/// Prefix of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub sequence: u32,
    pub index: u16,
    pub count: u16,
}

impl FragmentHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..6].copy_from_slice(&self.index.to_le_bytes());
        buf[6..8].copy_from_slice(&self.count.to_le_bytes());
        buf
    }

    /// `None` for datagrams that cannot be a fragment.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = Self {
            sequence: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            index: u16::from_le_bytes([data[4], data[5]]),
            count: u16::from_le_bytes([data[6], data[7]]),
        };
        (header.count > 0 && header.index < header.count).then_some(header)
    }
}

/// Split serialised frame bytes into datagrams of at most `mtu` bytes.
pub fn fragment(sequence: u32, bytes: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, FrameError> {
    let chunk = mtu.saturating_sub(FragmentHeader::SIZE).max(1);
    let count = bytes.len().div_ceil(chunk).max(1);
    let count = u16::try_from(count).map_err(|_| FrameError::FrameTooLarge {
        size: bytes.len(),
        max: chunk * u16::MAX as usize,
    })?;

    let mut out = Vec::with_capacity(count as usize);
    for index in 0..count {
        let start = index as usize * chunk;
        let end = (start + chunk).min(bytes.len());
        let header = FragmentHeader {
            sequence,
            index,
            count,
        };
        let mut pkt = Vec::with_capacity(FragmentHeader::SIZE + end - start);
        pkt.extend_from_slice(&header.encode());
        pkt.extend_from_slice(&bytes[start..end]);
        out.push(pkt);
    }
    Ok(out)
}

/// Half the sequence space. A sequence at most this far past a
/// reference point is ahead of it; anything else is behind.
const HALF_RANGE: u32 = 1 << 31;

/// Serial-number order (RFC 1982): `sequence` is `base` or later.
fn at_or_after(sequence: u32, base: u32) -> bool {
    sequence.wrapping_sub(base) < HALF_RANGE
}

// ── Reassembler ──────────────────────────────────────────────────

struct Partial {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Collects fragments until a frame is complete.
struct Reassembler {
    partials: HashMap<u32, Partial>,
    max_partials: usize,
}

impl Reassembler {
    fn new(max_partials: usize) -> Self {
        Self {
            partials: HashMap::new(),
            max_partials: max_partials.max(1),
        }
    }

    fn push(&mut self, header: FragmentHeader, data: &[u8]) -> Option<Vec<u8>> {
        if header.count == 1 {
            return Some(data.to_vec());
        }
        let partial = self.partials.entry(header.sequence).or_insert_with(|| Partial {
            parts: vec![None; header.count as usize],
            received: 0,
        });
        let slot = partial.parts.get_mut(header.index as usize)?;
        if slot.is_none() {
            *slot = Some(data.to_vec());
            partial.received += 1;
        }
        if partial.received == partial.parts.len() {
            let partial = self.partials.remove(&header.sequence)?;
            return Some(partial.parts.into_iter().flatten().flatten().collect());
        }

        while self.partials.len() > self.max_partials {
            let newest = header.sequence;
            let Some(&oldest) = self.partials.keys().max_by_key(|&&s| newest.wrapping_sub(s)) else {
                break;
            };
            self.partials.remove(&oldest);
        }
        None
    }

    /// Forget partial frames that can no longer be delivered.
    fn discard_before(&mut self, sequence: u32) {
        self.partials.retain(|&s, _| at_or_after(s, sequence));
    }
}

// ── ReorderBuffer ────────────────────────────────────────────────

/// What happened to an item offered to a [`ReorderBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Already delivered or already buffered.
    Duplicate,
}

/// Restores sequence order over an unreliable channel.
///
/// Each sequence number is delivered at most once, in increasing order.
/// At most `window` items are held back waiting for a gap to fill.
/// Sequences wrap at `u32::MAX`; internally they are extended to 64 bits
/// so ordering survives the wrap.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
    window: usize,
    gap_timeout: Duration,
    gap_since: Option<Instant>,
    lost: u64,
    delivered: u64,
}

impl<T> ReorderBuffer<T> {
    pub fn new(window: usize, gap_timeout: Duration) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            window: window.max(1),
            gap_timeout,
            gap_since: None,
            lost: 0,
            delivered: 0,
        }
    }

    /// The sequence number expected next.
    pub fn next_expected(&self) -> u32 {
        self.next as u32
    }

    /// Whether `sequence` was already delivered or skipped.
    pub fn is_behind(&self, sequence: u32) -> bool {
        !at_or_after(sequence, self.next_expected())
    }

    /// Position of `sequence` in the extended space, if not behind.
    fn extend(&self, sequence: u32) -> Option<u64> {
        let ahead = sequence.wrapping_sub(self.next_expected());
        (ahead < HALF_RANGE).then(|| self.next + ahead as u64)
    }

    pub fn push(&mut self, sequence: u32, item: T, now: Instant) -> Admission {
        let Some(sequence) = self.extend(sequence) else {
            return Admission::Duplicate;
        };
        if self.pending.contains_key(&sequence) {
            return Admission::Duplicate;
        }
        self.pending.insert(sequence, item);
        if sequence != self.next && self.gap_since.is_none() {
            self.gap_since = Some(now);
        }
        if self.pending.len() > self.window {
            self.skip_gap(now);
        }
        Admission::Accepted
    }

    /// Remove every item that is now in order.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            out.push(item);
            self.next += 1;
            self.delivered += 1;
        }
        if !out.is_empty() {
            self.gap_since = if self.pending.is_empty() { None } else { Some(now) };
        }
        out
    }

    /// Skip the current gap if it has been open longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.gap_since {
            Some(since) if now.duration_since(since) >= self.gap_timeout => {
                self.skip_gap(now);
                true
            }
            _ => false,
        }
    }

    /// When the current gap will be skipped, if there is one.
    pub fn gap_deadline(&self) -> Option<Instant> {
        self.gap_since.map(|since| since + self.gap_timeout)
    }

    fn skip_gap(&mut self, now: Instant) {
        if let Some(&first) = self.pending.keys().next() {
            if first > self.next {
                let skipped = first - self.next;
                debug!(from = self.next as u32, to = first as u32, skipped, "skipping sequence gap");
                self.lost += skipped;
                self.next = first;
            }
            self.gap_since = Some(now);
        } else {
            self.gap_since = None;
        }
    }

    /// Loss and delivery counts since the previous call.
    pub fn take_loss(&mut self) -> LossReport {
        let report = LossReport {
            lost: self.lost,
            delivered: self.delivered,
        };
        self.lost = 0;
        self.delivered = 0;
        report
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

// ── DatagramTransport ────────────────────────────────────────────

/// Frames over a UDP socket talking to a single peer.
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mtu: usize,
    max_frame_size: usize,
    reorder_window: usize,
    gap_timeout: Duration,
}

impl DatagramTransport {
    pub fn new(socket: UdpSocket, peer: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            socket: Arc::new(socket),
            peer,
            mtu: 1400,
            max_frame_size,
            reorder_window: 64,
            gap_timeout: Duration::from_millis(250),
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(FragmentHeader::SIZE + 1);
        self
    }

    pub fn with_reorder(mut self, window: usize, gap_timeout: Duration) -> Self {
        self.reorder_window = window;
        self.gap_timeout = gap_timeout;
        self
    }
}

impl FrameTransport for DatagramTransport {
    fn split(self) -> (BoxFrameSource, BoxFrameSink) {
        let source = DatagramSource {
            socket: self.socket.clone(),
            peer: self.peer,
            max_frame_size: self.max_frame_size,
            buf: vec![0u8; 64 * 1024],
            reassembler: Reassembler::new(self.reorder_window),
            reorder: ReorderBuffer::new(self.reorder_window, self.gap_timeout),
            ready: std::collections::VecDeque::new(),
        };
        let sink = DatagramSink {
            socket: self.socket,
            peer: self.peer,
            mtu: self.mtu,
            sequence: 0,
        };
        (Box::new(source), Box::new(sink))
    }

    fn peer(&self) -> String {
        format!("udp://{}", self.peer)
    }
}

struct DatagramSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mtu: usize,
    sequence: u32,
}

#[async_trait]
impl FrameSink for DatagramSink {
    async fn write_frame(&mut self, mut frame: Frame) -> Result<(), FrameError> {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        frame.header = frame.header.with_sequence(sequence);

        for pkt in fragment(sequence, &frame.to_bytes(), self.mtu)? {
            self.socket.send_to(&pkt, self.peer).await?;
        }
        trace!(sequence, size = frame.wire_len(), "datagram frame sent");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), FrameError> {
        Ok(())
    }
}

struct DatagramSource {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    max_frame_size: usize,
    buf: Vec<u8>,
    reassembler: Reassembler,
    reorder: ReorderBuffer<Frame>,
    ready: std::collections::VecDeque<Frame>,
}

impl DatagramSource {
    fn parse(&self, bytes: Vec<u8>) -> Result<Frame, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let header = read_header(&bytes, self.max_frame_size)?;
        let payload_len = bytes.len() - HEADER_SIZE;
        if payload_len != header.payload_length as usize {
            return Err(FrameError::InvalidField {
                field: "payload length",
                value: header.payload_length as u64,
            });
        }
        let payload = Bytes::from(bytes).slice(HEADER_SIZE..);
        Ok(Frame { header, payload })
    }

    fn accept(&mut self, bytes: Vec<u8>) -> Result<(), FrameError> {
        let frame = self.parse(bytes)?;
        let now = Instant::now();
        if self.reorder.push(frame.header.sequence, frame, now) == Admission::Duplicate {
            trace!("duplicate datagram frame dropped");
        }
        self.ready.extend(self.reorder.drain_ready(now));
        self.reassembler.discard_before(self.reorder.next_expected());
        Ok(())
    }
}

#[async_trait]
impl FrameSource for DatagramSource {
    async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let recv = self.socket.recv_from(&mut self.buf);
            let (len, from) = match self.reorder.gap_deadline() {
                Some(deadline) => match tokio::time::timeout_at(deadline, recv).await {
                    Ok(res) => res?,
                    Err(_) => {
                        let now = Instant::now();
                        self.reorder.expire(now);
                        self.ready.extend(self.reorder.drain_ready(now));
                        continue;
                    }
                },
                None => recv.await?,
            };

            if from != self.peer {
                trace!(%from, "datagram from unexpected peer ignored");
                continue;
            }
            let Some(fh) = FragmentHeader::decode(&self.buf[..len]) else {
                debug!(len, "malformed fragment ignored");
                continue;
            };
            if self.reorder.is_behind(fh.sequence) {
                continue;
            }
            let data = &self.buf[FragmentHeader::SIZE..len];
            if let Some(bytes) = self.reassembler.push(fh, data) {
                self.accept(bytes)?;
            }
        }
    }

    fn take_loss(&mut self) -> LossReport {
        self.reorder.take_loss()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FrameFlags;
    use crate::header::FrameHeader;
    use crate::wire::Compression;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fragment_header_rejects_nonsense() {
        let h = FragmentHeader { sequence: 1, index: 3, count: 2 };
        assert!(FragmentHeader::decode(&h.encode()).is_none());
        assert!(FragmentHeader::decode(&[0u8; 4]).is_none());
        let ok = FragmentHeader { sequence: 9, index: 1, count: 2 };
        assert_eq!(FragmentHeader::decode(&ok.encode()), Some(ok));
    }

    #[test]
    fn fragments_respect_mtu_and_reassemble() {
        let bytes: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let pkts = fragment(4, &bytes, 1000).unwrap();
        assert_eq!(pkts.len(), 6);
        assert!(pkts.iter().all(|p| p.len() <= 1000));

        let mut r = Reassembler::new(8);
        let mut out = None;
        // Deliver in reverse to exercise out-of-order fragments.
        for p in pkts.iter().rev() {
            let h = FragmentHeader::decode(p).unwrap();
            if let Some(done) = r.push(h, &p[FragmentHeader::SIZE..]) {
                out = Some(done);
            }
        }
        assert_eq!(out.unwrap(), bytes);
    }

    #[test]
    fn empty_frame_is_one_fragment() {
        let pkts = fragment(0, &[], 100).unwrap();
        assert_eq!(pkts.len(), 1);
    }

    #[test]
    fn reorder_delivers_in_order_exactly_once() {
        let t0 = Instant::now();
        let mut rb = ReorderBuffer::new(8, ms(100));
        rb.push(1, "b", t0);
        rb.push(2, "c", t0);
        assert!(rb.drain_ready(t0).is_empty());
        rb.push(0, "a", t0);
        assert_eq!(rb.drain_ready(t0), vec!["a", "b", "c"]);

        assert_eq!(rb.push(1, "b", t0), Admission::Duplicate);
        assert!(rb.drain_ready(t0).is_empty());
        assert_eq!(rb.take_loss(), LossReport { lost: 0, delivered: 3 });
    }

    #[test]
    fn gap_is_skipped_after_timeout() {
        let t0 = Instant::now();
        let mut rb = ReorderBuffer::new(8, ms(100));
        rb.push(0, 0, t0);
        rb.drain_ready(t0);
        rb.push(2, 2, t0);
        rb.push(3, 3, t0);

        assert!(!rb.expire(t0 + ms(50)));
        assert!(rb.drain_ready(t0 + ms(50)).is_empty());
        assert_eq!(rb.gap_deadline(), Some(t0 + ms(100)));

        assert!(rb.expire(t0 + ms(100)));
        assert_eq!(rb.drain_ready(t0 + ms(100)), vec![2, 3]);
        assert_eq!(rb.take_loss(), LossReport { lost: 1, delivered: 3 });

        // Late arrival of the skipped frame is dropped.
        assert_eq!(rb.push(1, 1, t0 + ms(120)), Admission::Duplicate);
    }

    #[test]
    fn window_overflow_forces_skip() {
        let t0 = Instant::now();
        let mut rb = ReorderBuffer::new(2, Duration::from_secs(60));
        rb.push(5, 5, t0);
        rb.push(6, 6, t0);
        assert!(rb.drain_ready(t0).is_empty());
        rb.push(7, 7, t0);
        assert_eq!(rb.drain_ready(t0), vec![5, 6, 7]);
        assert_eq!(rb.take_loss().lost, 5);
    }

    #[test]
    fn order_survives_sequence_wrap() {
        let t0 = Instant::now();
        let mut rb = ReorderBuffer::new(8, ms(100));
        rb.push(0, "", t0);
        rb.drain_ready(t0);
        rb.next = u32::MAX as u64 - 1;

        rb.push(0, "c", t0);
        rb.push(u32::MAX, "b", t0);
        assert!(rb.drain_ready(t0).is_empty());
        rb.push(u32::MAX - 1, "a", t0);
        assert_eq!(rb.drain_ready(t0), vec!["a", "b", "c"]);
        assert_eq!(rb.next_expected(), 1);

        assert!(rb.is_behind(u32::MAX));
        assert!(!rb.is_behind(1));
        assert_eq!(rb.push(u32::MAX, "b", t0), Admission::Duplicate);
    }

    #[test]
    fn gap_skip_across_the_wrap_counts_the_loss() {
        let t0 = Instant::now();
        let mut rb: ReorderBuffer<u32> = ReorderBuffer::new(8, ms(100));
        rb.next = u32::MAX as u64 - 2;
        rb.push(1, 1, t0);
        assert!(rb.expire(t0 + ms(100)));
        assert_eq!(rb.drain_ready(t0 + ms(100)), vec![1]);
        assert_eq!(rb.take_loss(), LossReport { lost: 4, delivered: 1 });
    }

    #[test]
    fn partials_before_the_wrap_are_discarded_after_it() {
        let mut r = Reassembler::new(8);
        let half = |sequence| FragmentHeader { sequence, index: 0, count: 2 };
        r.push(half(u32::MAX), b"x");
        r.push(half(2), b"y");
        r.discard_before(1);
        assert!(!r.partials.contains_key(&u32::MAX));
        assert!(r.partials.contains_key(&2));
    }

    #[tokio::test]
    async fn udp_roundtrip_with_large_frame() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());

        let (_, mut tx) = DatagramTransport::new(a, b_addr, 1 << 20).with_mtu(512).split();
        let (mut rx, _) = DatagramTransport::new(b, a_addr, 1 << 20).split();

        let payloads: Vec<Vec<u8>> = vec![b"first".to_vec(), vec![0xAB; 3000], b"third".to_vec()];
        for p in &payloads {
            let f = Frame::new(
                FrameHeader::new(FrameFlags::empty(), Compression::None, 0, 0),
                p.clone(),
            );
            tx.write_frame(f).await.unwrap();
        }
        for (i, p) in payloads.iter().enumerate() {
            let f = rx.read_frame().await.unwrap().unwrap();
            assert_eq!(f.header.sequence, i as u32);
            assert_eq!(&f.payload[..], &p[..]);
        }
    }
}
