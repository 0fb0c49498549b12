//! Damage batching.
//!
//! Damage rectangles reported for a window are accumulated and merged
//! until the window's batch delay elapses, then handed out as one
//! [`RegionBatch`]. Two rectangles merge only when their bounding box is
//! not much larger than the pixels they actually cover:
//!
//! ```text
//! area(a ∪ b) ≤ merge_ratio × (area(a) + area(b))
//! ```
//!
//! Merging cascades: the merged rectangle is checked against the
//! remaining ones until nothing else qualifies.
//!
//! Windows are independent. A window with an encode in flight is never
//! flushed; its damage keeps accumulating until the job completes.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::BatchConfig;
use crate::damage::rect::Rect;

/// One damaged rectangle, as reported by the capture layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageRegion {
    pub window_id: u64,
    pub rect: Rect,
    /// Window generation the rectangle belongs to. Bumped on resize.
    pub generation: u64,
}

/// All pending regions of one window, released together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionBatch {
    pub window_id: u64,
    pub generation: u64,
    pub regions: Vec<Rect>,
}

impl RegionBatch {
    pub fn total_area(&self) -> u64 {
        self.regions.iter().map(Rect::area).sum()
    }
}

#[derive(Debug, Default)]
struct WindowDamage {
    regions: Vec<Rect>,
    /// When the oldest un-flushed region arrived.
    first_at: Option<Instant>,
    size: Option<(u32, u32)>,
    generation: u64,
    busy: bool,
}

#[derive(Debug)]
pub struct DamageBatcher {
    windows: BTreeMap<u64, WindowDamage>,
    merge_ratio: f64,
    max_pending_regions: usize,
    delay: Duration,
}

/// Whether `a` and `b` should become one rectangle.
pub fn should_merge(a: &Rect, b: &Rect, ratio: f64) -> bool {
    let union = a.union(b).area() as f64;
    union <= ratio * (a.area() + b.area()) as f64
}

impl DamageBatcher {
    pub fn new(config: &BatchConfig, delay: Duration) -> Self {
        Self {
            windows: BTreeMap::new(),
            merge_ratio: config.merge_ratio,
            max_pending_regions: config.max_pending_regions.max(1),
            delay,
        }
    }

    /// Adopt the controller's current batch delay.
    pub fn set_batch_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn batch_delay(&self) -> Duration {
        self.delay
    }

    /// Record a window's size. Pending regions are clipped to it and the
    /// window's generation moves on if the size changed.
    pub fn set_window_size(&mut self, window_id: u64, width: u32, height: u32) {
        let win = self.windows.entry(window_id).or_default();
        if win.size == Some((width, height)) {
            return;
        }
        if win.size.is_some() {
            win.generation += 1;
        }
        win.size = Some((width, height));
        win.regions = win
            .regions
            .iter()
            .map(|r| r.clip_to(width, height))
            .filter(|r| !r.is_empty())
            .collect();
        if win.regions.is_empty() {
            win.first_at = None;
        }
    }

    pub fn window_size(&self, window_id: u64) -> Option<(u32, u32)> {
        self.windows.get(&window_id).and_then(|w| w.size)
    }

    pub fn generation(&self, window_id: u64) -> u64 {
        self.windows.get(&window_id).map_or(0, |w| w.generation)
    }

    /// Add one damaged rectangle. Returns `false` if nothing remained
    /// after clipping.
    pub fn add_region(&mut self, window_id: u64, rect: Rect, now: Instant) -> bool {
        let ratio = self.merge_ratio;
        let win = self.windows.entry(window_id).or_default();
        let mut rect = match win.size {
            Some((w, h)) => rect.clip_to(w, h),
            None => rect,
        };
        if rect.is_empty() {
            return false;
        }

        while let Some(i) = win.regions.iter().position(|r| should_merge(r, &rect, ratio)) {
            rect = win.regions.swap_remove(i).union(&rect);
        }
        win.regions.push(rect);
        win.first_at.get_or_insert(now);
        trace!(window_id, %rect, pending = win.regions.len(), "damage added");
        true
    }

    /// Mark a window as having an encode in flight (or not).
    pub fn set_busy(&mut self, window_id: u64, busy: bool) {
        if let Some(win) = self.windows.get_mut(&window_id) {
            win.busy = busy;
        } else if busy {
            self.windows.insert(
                window_id,
                WindowDamage {
                    busy,
                    ..Default::default()
                },
            );
        }
    }

    pub fn is_busy(&self, window_id: u64) -> bool {
        self.windows.get(&window_id).is_some_and(|w| w.busy)
    }

    fn is_due(&self, win: &WindowDamage, now: Instant) -> bool {
        if win.busy || win.regions.is_empty() {
            return false;
        }
        if win.regions.len() >= self.max_pending_regions {
            return true;
        }
        win.first_at.is_some_and(|t| now >= t + self.delay)
    }

    /// Release every window whose batch is due. Busy windows wait.
    pub fn flush_due(&mut self, now: Instant) -> Vec<RegionBatch> {
        let due: Vec<u64> = self
            .windows
            .iter()
            .filter(|(_, w)| self.is_due(w, now))
            .map(|(&id, _)| id)
            .collect();

        let mut out = Vec::with_capacity(due.len());
        for window_id in due {
            if let Some(win) = self.windows.get_mut(&window_id) {
                win.first_at = None;
                out.push(RegionBatch {
                    window_id,
                    generation: win.generation,
                    regions: std::mem::take(&mut win.regions),
                });
            }
        }
        out
    }

    /// Put back regions that could not be encoded. They are merged with
    /// anything that arrived meanwhile and become due again immediately.
    pub fn requeue(&mut self, window_id: u64, regions: &[Rect], now: Instant) {
        let delay = self.delay;
        for rect in regions {
            self.add_region(window_id, *rect, now);
        }
        if let Some(win) = self.windows.get_mut(&window_id) {
            if !win.regions.is_empty() {
                let due_now = now.checked_sub(delay).unwrap_or(now);
                win.first_at = Some(win.first_at.map_or(due_now, |t| t.min(due_now)));
            }
        }
    }

    /// Earliest instant at which some window becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.windows
            .values()
            .filter(|w| !w.busy && !w.regions.is_empty())
            .filter_map(|w| {
                if w.regions.len() >= self.max_pending_regions {
                    w.first_at
                } else {
                    w.first_at.map(|t| t + self.delay)
                }
            })
            .min()
    }

    pub fn pending_regions(&self, window_id: u64) -> &[Rect] {
        self.windows
            .get(&window_id)
            .map_or(&[][..], |w| &w.regions[..])
    }

    pub fn pending_count(&self) -> usize {
        self.windows.values().map(|w| w.regions.len()).sum()
    }

    pub fn remove_window(&mut self, window_id: u64) {
        self.windows.remove(&window_id);
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }
}
