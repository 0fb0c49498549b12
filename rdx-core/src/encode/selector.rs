//! Codec selection and the per-window codec state arena.
//!
//! Rules, in order, for each region:
//!
//! 1. first update of a window, or first after `idle_threshold` → `rgb`
//! 2. tiny regions → `rgb`
//! 3. sustained large updates and a client that takes video → `video`
//! 4. quality below the lossless threshold → `lossy`
//! 5. otherwise → `rgb`
//!
//! The arena owns each window's [`CodecState`] and sequence counter.
//! Both move into the [`WindowJob`] when a batch is planned and come
//! back with the result, which is what limits a window to one job.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;
use tracing::debug;

use crate::config::EncodingConfig;
use crate::damage::{Rect, RegionBatch};
use crate::encode::codecs::CodecState;
use crate::encode::pipeline::{PlannedRegion, WindowJob, WindowResult};
use crate::encode::types::{Codec, EncodeParams};
use crate::quality::QualityState;

#[derive(Debug)]
struct WindowCodec {
    /// `None` while a job holds it.
    state: Option<CodecState>,
    next_sequence: u64,
    last_update: Option<Instant>,
    recent: VecDeque<Instant>,
    /// Geometry the video reference frame was built for.
    video_rect: Option<Rect>,
    /// A reset was requested while the state was away.
    reset_pending: bool,
}

impl Default for WindowCodec {
    fn default() -> Self {
        Self {
            state: Some(CodecState::default()),
            next_sequence: 1,
            last_update: None,
            recent: VecDeque::new(),
            video_rect: None,
            reset_pending: false,
        }
    }
}

impl WindowCodec {
    fn reset_video(&mut self) {
        self.video_rect = None;
        match self.state.as_mut() {
            Some(state) => state.reset(),
            None => self.reset_pending = true,
        }
    }
}

/// How a window has been updating, sampled once per update.
#[derive(Debug, Clone, Copy)]
struct Activity {
    idle: bool,
    /// Updates within the video window, this one included.
    recent: usize,
}

#[derive(Debug)]
pub struct CodecSelector {
    config: EncodingConfig,
    client_encodings: Vec<Codec>,
    windows: HashMap<u64, WindowCodec>,
}

impl CodecSelector {
    pub fn new(config: EncodingConfig, client_encodings: Vec<Codec>) -> Self {
        Self {
            config,
            client_encodings,
            windows: HashMap::new(),
        }
    }

    pub fn client_encodings(&self) -> &[Codec] {
        &self.client_encodings
    }

    /// The client changed what it can decode. Video streams restart.
    pub fn set_client_encodings(&mut self, codecs: Vec<Codec>) {
        if codecs == self.client_encodings {
            return;
        }
        debug!(?codecs, "client encodings changed");
        self.client_encodings = codecs;
        for win in self.windows.values_mut() {
            win.reset_video();
        }
    }

    fn supports(&self, codec: Codec) -> bool {
        codec == Codec::Rgb || self.client_encodings.contains(&codec)
    }

    /// Pick a codec and parameters for a single-region update.
    pub fn select(
        &mut self,
        window_id: u64,
        rect: Rect,
        quality: &QualityState,
        now: Instant,
    ) -> (Codec, EncodeParams) {
        let activity = self.record_update(window_id, now);
        self.choose(window_id, rect, activity, true, quality)
    }

    /// Count one update of the window. A batch is one update however
    /// many regions it carries.
    fn record_update(&mut self, window_id: u64, now: Instant) -> Activity {
        let cfg = &self.config;
        let win = self.windows.entry(window_id).or_default();

        let idle = win
            .last_update
            .is_none_or(|t| now.duration_since(t) >= cfg.idle_threshold());
        win.last_update = Some(now);
        win.recent.push_back(now);
        while let Some(&t) = win.recent.front() {
            if now.duration_since(t) > cfg.video_window() {
                win.recent.pop_front();
            } else {
                break;
            }
        }
        Activity {
            idle,
            recent: win.recent.len(),
        }
    }

    fn choose(
        &mut self,
        window_id: u64,
        rect: Rect,
        activity: Activity,
        video_free: bool,
        quality: &QualityState,
    ) -> (Codec, EncodeParams) {
        let video_ok = video_free && self.supports(Codec::Video);
        let lossy_ok = self.supports(Codec::Lossy);
        let cfg = &self.config;
        let win = self.windows.entry(window_id).or_default();

        let area = rect.area();
        let codec = if activity.idle || area < cfg.small_region_area {
            Codec::Rgb
        } else if video_ok && activity.recent >= cfg.video_min_updates && area >= cfg.video_min_area {
            Codec::Video
        } else if lossy_ok && quality.quality < cfg.lossless_quality_threshold {
            Codec::Lossy
        } else {
            Codec::Rgb
        };

        if codec == Codec::Video && win.video_rect != Some(rect) {
            if win.video_rect.is_some() {
                debug!(window_id, %rect, "video geometry changed");
            }
            win.reset_video();
            win.video_rect = Some(rect);
        }

        let params = EncodeParams {
            quality: if codec.is_lossless() { 100 } else { quality.quality },
            speed: quality.speed,
        };
        (codec, params)
    }

    /// Turn a batch into a job, taking the window's codec state.
    ///
    /// Every region of the batch sees the same idle and motion state. At
    /// most one region per job is sent as video since the window has a
    /// single reference frame.
    ///
    /// Returns `None` while the window has a job in flight.
    pub fn plan(&mut self, batch: &RegionBatch, quality: &QualityState, now: Instant) -> Option<WindowJob> {
        if self.is_in_flight(batch.window_id) {
            return None;
        }
        let activity = self.record_update(batch.window_id, now);
        let mut video_free = true;
        let mut regions = Vec::with_capacity(batch.regions.len());
        for &rect in &batch.regions {
            let (codec, params) = self.choose(batch.window_id, rect, activity, video_free, quality);
            video_free &= codec != Codec::Video;
            regions.push(PlannedRegion { rect, codec, params });
        }

        let win = self.windows.entry(batch.window_id).or_default();
        let state = win.state.take()?;
        Some(WindowJob {
            window_id: batch.window_id,
            generation: batch.generation,
            regions,
            state,
            next_sequence: win.next_sequence,
        })
    }

    /// Take back the state and sequence counter from a finished job.
    ///
    /// Returns `false` if the window is gone.
    pub fn complete(&mut self, result: &mut WindowResult) -> bool {
        let Some(win) = self.windows.get_mut(&result.window_id) else {
            return false;
        };
        let mut state = std::mem::take(&mut result.state);
        if std::mem::take(&mut win.reset_pending) {
            state.reset();
        }
        win.state = Some(state);
        win.next_sequence = result.next_sequence;
        true
    }

    pub fn is_in_flight(&self, window_id: u64) -> bool {
        self.windows.get(&window_id).is_some_and(|w| w.state.is_none())
    }

    /// The window was resized or the client lost its reference frame.
    pub fn reset_window(&mut self, window_id: u64) {
        if let Some(win) = self.windows.get_mut(&window_id) {
            win.reset_video();
            win.last_update = None;
            win.recent.clear();
        }
    }

    /// Forget a window. A job still holding its state is abandoned.
    pub fn remove_window(&mut self, window_id: u64) {
        self.windows.remove(&window_id);
    }

    pub fn next_sequence(&self, window_id: u64) -> u64 {
        self.windows.get(&window_id).map_or(1, |w| w.next_sequence)
    }
}
