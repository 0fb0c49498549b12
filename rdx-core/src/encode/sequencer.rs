//! Per-window draw ordering on the receiving side.
//!
//! Draws for one window must be applied in sequence order. Early
//! arrivals are held back until the gap before them fills. A gap that
//! never fills (the buffer for that window exceeds `max_pending`) is
//! skipped so one lost update cannot freeze a window.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::packet::DrawPacket;

#[derive(Debug, Default)]
struct WindowOrder {
    /// Next sequence to release. `None` until the first draw arrives.
    next: Option<u64>,
    held: BTreeMap<u64, DrawPacket>,
}

#[derive(Debug)]
pub struct UpdateSequencer {
    windows: HashMap<u64, WindowOrder>,
    max_pending: usize,
    skipped: u64,
}

impl UpdateSequencer {
    pub fn new(max_pending: usize) -> Self {
        Self {
            windows: HashMap::new(),
            max_pending: max_pending.max(1),
            skipped: 0,
        }
    }

    /// Accept one draw and return every draw now ready, in order.
    ///
    /// Duplicates and draws older than the window's position are
    /// dropped.
    pub fn push(&mut self, draw: DrawPacket) -> Vec<DrawPacket> {
        let win = self.windows.entry(draw.window_id).or_default();
        let next = *win.next.get_or_insert(draw.sequence);
        if draw.sequence < next || win.held.contains_key(&draw.sequence) {
            debug!(window_id = draw.window_id, sequence = draw.sequence, "stale draw dropped");
            return Vec::new();
        }
        win.held.insert(draw.sequence, draw);

        if win.held.len() > self.max_pending {
            if let Some(&lowest) = win.held.keys().next() {
                warn!(
                    expected = next,
                    resuming_at = lowest,
                    "draw sequence gap skipped"
                );
                self.skipped += lowest - next;
                win.next = Some(lowest);
            }
        }

        let mut ready = Vec::new();
        while let Some(next) = win.next {
            match win.held.remove(&next) {
                Some(d) => {
                    ready.push(d);
                    win.next = Some(next + 1);
                }
                None => break,
            }
        }
        ready
    }

    /// Draws held back for a window.
    pub fn pending(&self, window_id: u64) -> usize {
        self.windows.get(&window_id).map_or(0, |w| w.held.len())
    }

    /// Sequence numbers given up on so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn remove_window(&mut self, window_id: u64) {
        self.windows.remove(&window_id);
    }
}

impl Default for UpdateSequencer {
    fn default() -> Self {
        Self::new(64)
    }
}
