//! Encode worker pool.
//!
//! Each [`WindowJob`] carries every planned region of one window batch,
//! the window's codec state and its next sequence number. The job runs
//! on a blocking thread once a pool permit is free; the pool is sized to
//! the machine's parallelism. At most one job per window is in flight,
//! since the codec state can only be in one place at a time.
//!
//! A region whose codec fails is retried with `rgb`. If that fails too
//! the region is reported back so the session can requeue it. Sequence
//! numbers are only consumed by regions that produced a payload, so the
//! receiver never waits for a number that will not come.
//!
//! A job whose worker panics comes back as a result with every region
//! failed, a fresh codec state and the sequence counter it started with.
//!
//! Results of cancelled jobs (window closed, session ending) are
//! discarded.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capture::CaptureSource;
use crate::damage::Rect;
use crate::encode::codecs::{CodecState, Encoders};
use crate::encode::types::{Codec, EncodeJob, EncodeParams, EncodedRegion};
use crate::error::EncodeError;

// ── Job and result ───────────────────────────────────────────────

/// Codec choice for one region, made by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRegion {
    pub rect: Rect,
    pub codec: Codec,
    pub params: EncodeParams,
}

/// All planned regions of one window batch.
#[derive(Debug)]
pub struct WindowJob {
    pub window_id: u64,
    pub generation: u64,
    pub regions: Vec<PlannedRegion>,
    pub state: CodecState,
    pub next_sequence: u64,
}

/// One region that produced a payload.
#[derive(Debug, Clone)]
pub struct EncodedUpdate {
    pub job: EncodeJob,
    pub region: EncodedRegion,
    /// The planned codec failed and `rgb` was used instead.
    pub fell_back: bool,
}

#[derive(Debug)]
pub struct WindowResult {
    pub window_id: u64,
    pub generation: u64,
    /// In sequence order.
    pub updates: Vec<EncodedUpdate>,
    /// Regions for which no payload could be produced.
    pub failed: Vec<(Rect, EncodeError)>,
    pub state: CodecState,
    pub next_sequence: u64,
}

// ── Worker ───────────────────────────────────────────────────────

/// Body of one job. Runs on a blocking thread.
fn run_job(
    capture: &dyn CaptureSource,
    encoders: &Encoders,
    mut job: WindowJob,
    cancel: &CancellationToken,
) -> WindowResult {
    let mut updates = Vec::with_capacity(job.regions.len());
    let mut failed = Vec::new();

    for planned in &job.regions {
        if cancel.is_cancelled() {
            break;
        }
        let pixels = match capture.get_pixel_snapshot(job.window_id, planned.rect) {
            Ok(p) => p,
            Err(e) => {
                failed.push((planned.rect, e));
                continue;
            }
        };

        let mut fell_back = false;
        let result = match encoders.encode(planned.codec, &pixels, planned.params, &mut job.state)
        {
            Ok(region) => Ok(region),
            Err(e) if planned.codec != Codec::Rgb => {
                warn!(
                    window_id = job.window_id,
                    codec = %planned.codec,
                    error = %e,
                    "encode failed, falling back to rgb"
                );
                fell_back = true;
                encoders.encode(Codec::Rgb, &pixels, planned.params, &mut job.state)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(region) => {
                // The window may have shrunk since the region was planned.
                let rect = Rect::new(planned.rect.x, planned.rect.y, pixels.width, pixels.height);
                let sequence = job.next_sequence;
                job.next_sequence += 1;
                updates.push(EncodedUpdate {
                    job: EncodeJob {
                        window_id: job.window_id,
                        rect,
                        codec: region.codec,
                        params: planned.params,
                        sequence,
                    },
                    region,
                    fell_back,
                });
            }
            Err(e) => failed.push((planned.rect, e)),
        }
    }

    WindowResult {
        window_id: job.window_id,
        generation: job.generation,
        updates,
        failed,
        state: job.state,
        next_sequence: job.next_sequence,
    }
}

/// What the session needs back if the worker never returns.
struct JobOutline {
    window_id: u64,
    generation: u64,
    regions: Vec<(Rect, Codec)>,
    next_sequence: u64,
}

impl JobOutline {
    fn of(job: &WindowJob) -> Self {
        Self {
            window_id: job.window_id,
            generation: job.generation,
            regions: job.regions.iter().map(|r| (r.rect, r.codec)).collect(),
            next_sequence: job.next_sequence,
        }
    }

    /// Every region failed. Encoders may have left the state half
    /// written, so the window starts over from a key frame.
    fn abandoned(self, reason: &str) -> WindowResult {
        let failed = self
            .regions
            .into_iter()
            .map(|(rect, codec)| {
                let error = EncodeError::Fault {
                    codec: codec.name(),
                    reason: reason.to_string(),
                };
                (rect, error)
            })
            .collect();
        WindowResult {
            window_id: self.window_id,
            generation: self.generation,
            updates: Vec::new(),
            failed,
            state: CodecState::default(),
            next_sequence: self.next_sequence,
        }
    }
}

// ── EncodePipeline ───────────────────────────────────────────────

pub struct EncodePipeline {
    capture: Arc<dyn CaptureSource>,
    encoders: Arc<Encoders>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: HashMap<u64, JoinHandle<()>>,
    results_tx: mpsc::UnboundedSender<WindowResult>,
}

impl EncodePipeline {
    /// Create a pool of `workers` blocking threads. Completed jobs are
    /// delivered on the returned receiver.
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        encoders: Arc<Encoders>,
        workers: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<WindowResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let pipeline = Self {
            capture,
            encoders,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            cancel,
            tasks: HashMap::new(),
            results_tx,
        };
        (pipeline, results_rx)
    }

    /// Start a job. Returns it unchanged if its window already has one
    /// in flight.
    pub fn submit(&mut self, job: WindowJob) -> Result<(), WindowJob> {
        let window_id = job.window_id;
        if self.is_in_flight(window_id) {
            return Err(job);
        }
        let capture = self.capture.clone();
        let encoders = self.encoders.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        let results_tx = self.results_tx.clone();

        debug!(window_id, regions = job.regions.len(), "encode job submitted");
        let outline = JobOutline::of(&job);
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if cancel.is_cancelled() {
                return;
            }
            let worker_cancel = cancel.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                run_job(capture.as_ref(), &encoders, job, &worker_cancel)
            })
            .await;
            match outcome {
                Ok(result) if !cancel.is_cancelled() => {
                    let _ = results_tx.send(result);
                }
                Ok(_) => debug!(window_id, "encode result discarded after cancel"),
                Err(e) if e.is_panic() && !cancel.is_cancelled() => {
                    warn!(window_id, error = %e, "encode worker panicked, regions will be retried");
                    let _ = results_tx.send(outline.abandoned("encode worker panicked"));
                }
                Err(e) => debug!(window_id, error = %e, "encode worker stopped"),
            }
        });
        self.tasks.insert(window_id, handle);
        Ok(())
    }

    pub fn is_in_flight(&self, window_id: u64) -> bool {
        self.tasks.get(&window_id).is_some_and(|h| !h.is_finished())
    }

    /// Forget the task of a window whose result has been received.
    pub fn finished(&mut self, window_id: u64) {
        self.tasks.remove(&window_id);
    }

    /// Abandon a window's job. Its result will never be delivered.
    pub fn cancel_window(&mut self, window_id: u64) {
        if let Some(handle) = self.tasks.remove(&window_id) {
            handle.abort();
        }
    }

    /// Abandon every job.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.values().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}
