//! The seam between the engine and the platform capture layer.
//!
//! Platform code implements [`CaptureSource`] to hand out pixels on
//! demand and pushes change notifications through a [`DamageNotifier`].
//! The engine never polls the screen itself.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::Notify;

use crate::damage::Rect;
use crate::error::{EncodeError, RdxError};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of a captured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── PixelBuffer ──────────────────────────────────────────────────

/// Uncompressed pixels of one window region.
///
/// `data` holds `height` rows of `stride` bytes each; `stride` may exceed
/// `width * bytes_per_pixel` when the capture layer pads rows.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

impl PixelBuffer {
    /// A buffer with tightly packed rows.
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
            data,
            timestamp: Instant::now(),
        }
    }

    /// A buffer filled with one byte value.
    pub fn filled(width: u32, height: u32, format: PixelFormat, fill: u8) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self::packed(width, height, format, vec![fill; len])
    }

    /// Bytes per row without padding.
    pub fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Whether `data` is large enough for the declared geometry.
    pub fn is_well_formed(&self) -> bool {
        self.stride as usize >= self.row_len()
            && self.data.len() >= self.stride as usize * self.height as usize
    }

    /// A row without its padding bytes.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.row_len()]
    }

    /// All rows concatenated without padding.
    pub fn to_packed(&self) -> Vec<u8> {
        if self.stride as usize == self.row_len() {
            return self.data[..self.row_len() * self.height as usize].to_vec();
        }
        let mut out = Vec::with_capacity(self.row_len() * self.height as usize);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }
}

// ── CaptureSource ────────────────────────────────────────────────

/// Supplies window pixels to the encode pipeline.
///
/// Called from blocking worker threads, so implementations may take
/// their time but must be thread-safe.
pub trait CaptureSource: Send + Sync + 'static {
    /// Pixels of `rect` in window `window_id`, tightly packed.
    fn get_pixel_snapshot(&self, window_id: u64, rect: Rect) -> Result<PixelBuffer, EncodeError>;

    /// Current window size, or `None` if the window no longer exists.
    fn window_size(&self, window_id: u64) -> Option<(u32, u32)>;
}

// ── DamageNotifier ───────────────────────────────────────────────

/// A change reported by the capture layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DamageEvent {
    Damage { window_id: u64, rect: Rect },
    Resize { window_id: u64, width: u32, height: u32 },
    WindowClosed { window_id: u64 },
}

/// Pending damage rectangles one window may queue before they are
/// folded into a single bounding rectangle.
pub const DEFAULT_DAMAGE_RECTS: usize = 64;

#[derive(Debug)]
struct DamageQueue {
    events: VecDeque<DamageEvent>,
    max_rects: usize,
    senders: usize,
    receiver_alive: bool,
}

impl DamageQueue {
    /// Queue `event`, coalescing with what is already pending for its
    /// window so the queue stays bounded by the number of windows.
    fn push(&mut self, event: DamageEvent) {
        match event {
            DamageEvent::Damage { window_id, rect } => {
                let pending = self
                    .events
                    .iter()
                    .filter(|e| matches!(e, DamageEvent::Damage { window_id: w, .. } if *w == window_id))
                    .count();
                if pending >= self.max_rects {
                    let last = self.events.iter_mut().rev().find_map(|e| match e {
                        DamageEvent::Damage { window_id: w, rect } if *w == window_id => Some(rect),
                        _ => None,
                    });
                    if let Some(last) = last {
                        *last = last.union(&rect);
                        return;
                    }
                }
            }
            // A resize repaints the whole window.
            DamageEvent::Resize { window_id, .. } => self.events.retain(|e| {
                !matches!(e, DamageEvent::Damage { window_id: w, .. } | DamageEvent::Resize { window_id: w, .. } if *w == window_id)
            }),
            DamageEvent::WindowClosed { window_id } => self.events.retain(|e| e.window_id() != window_id),
        }
        self.events.push_back(event);
    }
}

#[derive(Debug)]
struct DamageShared {
    queue: Mutex<DamageQueue>,
    ready: Notify,
}

impl DamageShared {
    fn lock(&self) -> MutexGuard<'_, DamageQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle through which the capture layer reports damage.
///
/// Notifications never block. Damage for a window that already has
/// many rectangles pending is merged on the spot, a resize supersedes
/// the window's pending damage, and a close supersedes everything
/// pending for the window. Memory therefore stays bounded however fast
/// the capture layer reports.
#[derive(Debug)]
pub struct DamageNotifier {
    shared: Arc<DamageShared>,
}

/// Session end of a [`DamageNotifier`].
#[derive(Debug)]
pub struct DamageReceiver {
    shared: Arc<DamageShared>,
}

impl DamageEvent {
    pub fn window_id(&self) -> u64 {
        match *self {
            DamageEvent::Damage { window_id, .. }
            | DamageEvent::Resize { window_id, .. }
            | DamageEvent::WindowClosed { window_id } => window_id,
        }
    }
}

impl DamageNotifier {
    pub fn channel() -> (Self, DamageReceiver) {
        Self::with_limit(DEFAULT_DAMAGE_RECTS)
    }

    /// A channel holding at most `max_rects` damage rectangles per window.
    pub fn with_limit(max_rects: usize) -> (Self, DamageReceiver) {
        let shared = Arc::new(DamageShared {
            queue: Mutex::new(DamageQueue {
                events: VecDeque::new(),
                max_rects: max_rects.max(1),
                senders: 1,
                receiver_alive: true,
            }),
            ready: Notify::new(),
        });
        let rx = DamageReceiver {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, rx)
    }

    pub fn notify_damage(&self, window_id: u64, rect: Rect) -> Result<(), RdxError> {
        self.send(DamageEvent::Damage { window_id, rect })
    }

    pub fn notify_resize(&self, window_id: u64, width: u32, height: u32) -> Result<(), RdxError> {
        self.send(DamageEvent::Resize {
            window_id,
            width,
            height,
        })
    }

    pub fn notify_window_closed(&self, window_id: u64) -> Result<(), RdxError> {
        self.send(DamageEvent::WindowClosed { window_id })
    }

    fn send(&self, event: DamageEvent) -> Result<(), RdxError> {
        {
            let mut queue = self.shared.lock();
            if !queue.receiver_alive {
                return Err(RdxError::ChannelClosed);
            }
            queue.push(event);
        }
        self.shared.ready.notify_one();
        Ok(())
    }
}

impl Clone for DamageNotifier {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for DamageNotifier {
    fn drop(&mut self) {
        self.shared.lock().senders -= 1;
        self.shared.ready.notify_one();
    }
}

impl DamageReceiver {
    /// Next event, or `None` once every notifier is gone and the queue
    /// is empty.
    pub async fn recv(&mut self) -> Option<DamageEvent> {
        loop {
            let ready = self.shared.ready.notified();
            {
                let mut queue = self.shared.lock();
                if let Some(event) = queue.events.pop_front() {
                    return Some(event);
                }
                if queue.senders == 0 {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Events waiting to be received.
    pub fn pending(&self) -> usize {
        self.shared.lock().events.len()
    }
}

impl Drop for DamageReceiver {
    fn drop(&mut self) {
        let mut queue = self.shared.lock();
        queue.receiver_alive = false;
        queue.events.clear();
    }
}

// ── MemorySource ─────────────────────────────────────────────────

struct MemoryWindow {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    failing: bool,
}

/// An in-memory [`CaptureSource`] holding one BGRA framebuffer per window.
///
/// Used by the headless host and by tests.
#[derive(Default)]
pub struct MemorySource {
    windows: Mutex<HashMap<u64, MemoryWindow>>,
}

const BPP: usize = 4;

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or resize a window, clearing it to `fill`.
    pub fn set_window(&self, window_id: u64, width: u32, height: u32, fill: u8) {
        let pixels = vec![fill; width as usize * height as usize * BPP];
        if let Ok(mut windows) = self.windows.lock() {
            windows.insert(
                window_id,
                MemoryWindow {
                    width,
                    height,
                    pixels,
                    failing: false,
                },
            );
        }
    }

    pub fn remove_window(&self, window_id: u64) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(&window_id);
        }
    }

    /// Fill `rect` with one BGRA colour. Returns the clipped rectangle.
    pub fn paint(&self, window_id: u64, rect: Rect, bgra: [u8; 4]) -> Option<Rect> {
        let mut windows = self.windows.lock().ok()?;
        let win = windows.get_mut(&window_id)?;
        let rect = rect.clip_to(win.width, win.height);
        if rect.is_empty() {
            return None;
        }
        let stride = win.width as usize * BPP;
        for y in rect.y..rect.y + rect.height {
            let row = y as usize * stride;
            for x in rect.x..rect.x + rect.width {
                let off = row + x as usize * BPP;
                win.pixels[off..off + BPP].copy_from_slice(&bgra);
            }
        }
        Some(rect)
    }

    /// Make snapshots of a window fail, to exercise error paths.
    pub fn set_failing(&self, window_id: u64, failing: bool) {
        if let Ok(mut windows) = self.windows.lock() {
            if let Some(win) = windows.get_mut(&window_id) {
                win.failing = failing;
            }
        }
    }
}

impl CaptureSource for MemorySource {
    fn get_pixel_snapshot(&self, window_id: u64, rect: Rect) -> Result<PixelBuffer, EncodeError> {
        let capture_err = |reason: &str| EncodeError::Capture {
            window_id,
            reason: reason.to_string(),
        };
        let windows = self.windows.lock().map_err(|_| capture_err("source poisoned"))?;
        let win = windows.get(&window_id).ok_or_else(|| capture_err("unknown window"))?;
        if win.failing {
            return Err(capture_err("capture failed"));
        }
        let rect = rect.clip_to(win.width, win.height);
        if rect.is_empty() {
            return Err(capture_err("region outside window"));
        }

        let stride = win.width as usize * BPP;
        let row_len = rect.width as usize * BPP;
        let mut data = Vec::with_capacity(row_len * rect.height as usize);
        for y in rect.y..rect.y + rect.height {
            let start = y as usize * stride + rect.x as usize * BPP;
            data.extend_from_slice(&win.pixels[start..start + row_len]);
        }
        Ok(PixelBuffer::packed(rect.width, rect.height, PixelFormat::Bgra8, data))
    }

    fn window_size(&self, window_id: u64) -> Option<(u32, u32)> {
        let windows = self.windows.lock().ok()?;
        windows.get(&window_id).map(|w| (w.width, w.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_rows_are_packed() {
        let buf = PixelBuffer {
            width: 2,
            height: 2,
            stride: 12,
            format: PixelFormat::Bgra8,
            data: (0..24).collect(),
            timestamp: Instant::now(),
        };
        assert!(buf.is_well_formed());
        let packed = buf.to_packed();
        assert_eq!(packed.len(), 16);
        assert_eq!(&packed[8..], &(12..20).collect::<Vec<u8>>()[..]);
    }

    fn damage(window_id: u64, rect: Rect) -> DamageEvent {
        DamageEvent::Damage { window_id, rect }
    }

    #[tokio::test]
    async fn flood_of_damage_stays_bounded() {
        let (tx, mut rx) = DamageNotifier::with_limit(4);
        for i in 0..10_000u32 {
            tx.notify_damage(1, Rect::new(i % 100, 0, 1, 1)).unwrap();
            tx.notify_damage(2, Rect::new(0, i % 50, 1, 1)).unwrap();
        }
        assert_eq!(rx.pending(), 8);

        let mut covered = Rect::default();
        for _ in 0..8 {
            let event = rx.recv().await.unwrap();
            if let DamageEvent::Damage { window_id: 1, rect } = event {
                covered = covered.union(&rect);
            }
        }
        assert_eq!(covered, Rect::new(0, 0, 100, 1));
    }

    #[tokio::test]
    async fn resize_and_close_supersede_pending_damage() {
        let (tx, mut rx) = DamageNotifier::channel();
        tx.notify_damage(1, Rect::new(0, 0, 4, 4)).unwrap();
        tx.notify_damage(2, Rect::new(0, 0, 4, 4)).unwrap();
        tx.notify_resize(1, 64, 64).unwrap();
        tx.notify_damage(1, Rect::new(8, 8, 4, 4)).unwrap();
        tx.notify_damage(2, Rect::new(4, 4, 4, 4)).unwrap();
        tx.notify_window_closed(2).unwrap();

        let mut got = Vec::new();
        while rx.pending() > 0 {
            got.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            got,
            vec![
                DamageEvent::Resize { window_id: 1, width: 64, height: 64 },
                damage(1, Rect::new(8, 8, 4, 4)),
                DamageEvent::WindowClosed { window_id: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn channel_closes_from_either_end() {
        let (tx, mut rx) = DamageNotifier::channel();
        let extra = tx.clone();
        tx.notify_damage(1, Rect::new(0, 0, 1, 1)).unwrap();
        drop(tx);
        drop(extra);
        assert_eq!(rx.recv().await, Some(damage(1, Rect::new(0, 0, 1, 1))));
        assert_eq!(rx.recv().await, None);

        let (tx, rx) = DamageNotifier::channel();
        drop(rx);
        assert!(tx.notify_damage(1, Rect::new(0, 0, 1, 1)).is_err());
    }

    #[tokio::test]
    async fn receiver_wakes_on_notify() {
        let (tx, mut rx) = DamageNotifier::channel();
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.notify_resize(3, 10, 10).unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(DamageEvent::Resize { window_id: 3, width: 10, height: 10 }));
    }

    #[test]
    fn memory_source_snapshot() {
        let src = MemorySource::new();
        src.set_window(1, 64, 32, 0);
        src.paint(1, Rect::new(8, 8, 4, 4), [1, 2, 3, 4]);

        let snap = src.get_pixel_snapshot(1, Rect::new(8, 8, 4, 4)).unwrap();
        assert_eq!(snap.data.len(), 4 * 4 * 4);
        assert!(snap.data.chunks(4).all(|p| p == [1, 2, 3, 4]));

        let clipped = src.get_pixel_snapshot(1, Rect::new(60, 30, 10, 10)).unwrap();
        assert_eq!((clipped.width, clipped.height), (4, 2));
        assert_eq!(src.window_size(1), Some((64, 32)));
    }

    #[test]
    fn failing_window() {
        let src = MemorySource::new();
        src.set_window(3, 10, 10, 0);
        src.set_failing(3, true);
        assert!(matches!(
            src.get_pixel_snapshot(3, Rect::new(0, 0, 5, 5)),
            Err(EncodeError::Capture { window_id: 3, .. })
        ));
        assert!(src.get_pixel_snapshot(9, Rect::new(0, 0, 5, 5)).is_err());
    }

    #[tokio::test]
    async fn notifier_delivers_in_order() {
        let (notifier, mut rx) = DamageNotifier::channel();
        notifier.notify_damage(1, Rect::new(0, 0, 10, 10)).unwrap();
        notifier.notify_resize(2, 100, 100).unwrap();
        notifier.notify_window_closed(3).unwrap();
        assert!(matches!(rx.recv().await, Some(DamageEvent::Damage { window_id: 1, .. })));
        assert!(matches!(rx.recv().await, Some(DamageEvent::Resize { width: 100, .. })));
        assert_eq!(rx.recv().await, Some(DamageEvent::WindowClosed { window_id: 3 }));

        drop(rx);
        assert!(notifier.notify_damage(1, Rect::new(0, 0, 1, 1)).is_err());
    }
}
