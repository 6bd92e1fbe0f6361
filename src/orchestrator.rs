//! Batch orchestration: runs Loader → Detector → Fitter → Aggregator over a
//! worklist on a bounded rayon pool, with caching, progress and cancellation.

use bumpalo::Bump;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::MetricsCache;
use crate::config::{Config, ConfigError};
use crate::frame_loader::{FitsLoader, FrameLoader, LoadError};
use crate::metrics::{aggregate, AggregationParams};
use crate::models::{FailureKind, FileIdentity, Frame, FrameMetrics};
use crate::psf_fitting::{fit_stars, FitParams};
use crate::star_detection::{detect_stars_with, DetectionParams, ImageStatistics};
use crate::statistics::{self, BandStatistics, Metric};

/// Lifecycle of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Emitted once per finished file. `completed` strictly increases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub file_name: String,
    pub cached: bool,
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_files: usize,
    pub workers_used: usize,
    pub cache_hits: usize,
    pub frames_analyzed: usize,
    pub frames_failed: usize,
    /// Files never started because the batch was cancelled.
    pub frames_skipped: usize,
    pub elapsed: Duration,
}

/// Result of one batch: per-frame records in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub state: BatchState,
    pub frames: Vec<FrameMetrics>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn band_statistics(&self, metric: Metric) -> Option<BandStatistics> {
        statistics::band_statistics(&self.frames, metric)
    }

    pub fn all_band_statistics(&self) -> Vec<(Metric, BandStatistics)> {
        statistics::all_band_statistics(&self.frames)
    }

    /// Bands of `metric` over the frames accepted by `keep`, e.g. after the
    /// user removed some frames from the set.
    pub fn rebanded(
        &self,
        metric: Metric,
        keep: impl Fn(&FrameMetrics) -> bool,
    ) -> Option<BandStatistics> {
        let values: Vec<f64> = self
            .frames
            .iter()
            .filter(|f| keep(f))
            .filter_map(|f| metric.extract(f))
            .collect();
        BandStatistics::from_values(&values)
    }

    pub fn outlier_indices(&self, metric: Metric, threshold: f64) -> Vec<usize> {
        statistics::outlier_indices(&self.frames, metric, threshold)
    }

    pub fn successes(&self) -> impl Iterator<Item = &FrameMetrics> {
        self.frames.iter().filter(|f| !f.is_failed())
    }

    pub fn failures(&self) -> impl Iterator<Item = &FrameMetrics> {
        self.frames.iter().filter(|f| f.is_failed())
    }
}

/// Requests cancellation of a running batch. Work already dispatched
/// finishes; nothing new starts.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Handle to a batch running in the background.
pub struct BatchHandle {
    pub progress: mpsc::UnboundedReceiver<BatchProgress>,
    pub cancel: CancelHandle,
    pub join: JoinHandle<BatchReport>,
}

impl BatchHandle {
    /// Wait for the batch to finish.
    pub async fn wait(self) -> Result<BatchReport, tokio::task::JoinError> {
        self.join.await
    }
}

/// How many times each pipeline stage ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub loads: usize,
    pub detections: usize,
    pub fits: usize,
}

#[derive(Debug, Default)]
struct StageCounters {
    loads: AtomicUsize,
    detections: AtomicUsize,
    fits: AtomicUsize,
}

enum FileOutcome {
    Analyzed,
    Cached,
    Failed,
}

pub struct Orchestrator {
    loader: Arc<dyn FrameLoader>,
    cache: MetricsCache,
    detection: DetectionParams,
    fitting: FitParams,
    aggregation: AggregationParams,
    workers: usize,
    cancel: CancelHandle,
    state: Arc<RwLock<BatchState>>,
    counters: StageCounters,
}

impl Orchestrator {
    /// Build an orchestrator. Fails only on invalid configuration.
    pub fn new(
        config: &Config,
        loader: Arc<dyn FrameLoader>,
        cache: MetricsCache,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            loader,
            cache,
            detection: config.detection_params(),
            fitting: config.fit_params(),
            aggregation: config.aggregation_params(),
            workers: config.effective_worker_count(),
            cancel: CancelHandle::default(),
            state: Arc::new(RwLock::new(BatchState::Idle)),
            counters: StageCounters::default(),
        })
    }

    /// Orchestrator reading FITS files from disk.
    pub fn with_fits_loader(config: &Config, cache: MetricsCache) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(FitsLoader), cache)
    }

    pub fn cache(&self) -> &MetricsCache {
        &self.cache
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> BatchState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(BatchState::Idle)
    }

    pub fn stage_counts(&self) -> StageCounts {
        StageCounts {
            loads: self.counters.loads.load(Ordering::Relaxed),
            detections: self.counters.detections.load(Ordering::Relaxed),
            fits: self.counters.fits.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: BatchState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    /// Analyze `paths`, calling `on_progress` after each finished file.
    pub fn run(&self, paths: &[PathBuf], on_progress: impl Fn(BatchProgress) + Sync) -> BatchReport {
        let start = Instant::now();
        let total = paths.len();
        let workers_used = self.workers.min(total).max(1);
        self.set_state(BatchState::Running);
        info!(
            "🚀 Analyzing {} frames with {} worker(s)",
            total, workers_used
        );

        let completed = Mutex::new(0usize);
        let cache_hits = AtomicUsize::new(0);
        let analyzed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        let process = |index: usize| -> Option<FrameMetrics> {
            if self.cancel.is_cancelled() {
                return None;
            }
            let path = &paths[index];
            let (metrics, outcome) = self.process_file(path);
            let counter = match outcome {
                FileOutcome::Analyzed => &analyzed,
                FileOutcome::Cached => &cache_hits,
                FileOutcome::Failed => &failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);

            let mut done = completed.lock().unwrap_or_else(|e| e.into_inner());
            *done += 1;
            on_progress(BatchProgress {
                completed: *done,
                total,
                file_name: metrics.file_name.clone(),
                cached: matches!(outcome, FileOutcome::Cached),
                failed: metrics.is_failed(),
            });
            drop(done);
            Some(metrics)
        };

        let results: Vec<Option<FrameMetrics>> = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers_used)
            .thread_name(|i| format!("subframe-worker-{}", i))
            .build()
        {
            Ok(pool) => pool.install(|| (0..total).into_par_iter().map(process).collect()),
            Err(e) => {
                warn!("⚠️ Failed to build worker pool ({}), analyzing sequentially", e);
                (0..total).map(process).collect()
            }
        };

        let frames: Vec<FrameMetrics> = results.into_iter().flatten().collect();
        let cancelled = self.cancel.is_cancelled();
        self.cancel.reset();
        let state = if cancelled {
            BatchState::Cancelled
        } else {
            BatchState::Completed
        };
        self.set_state(state);

        let summary = BatchSummary {
            total_files: total,
            workers_used,
            cache_hits: cache_hits.into_inner(),
            frames_analyzed: analyzed.into_inner(),
            frames_failed: failed.into_inner(),
            frames_skipped: total - frames.len(),
            elapsed: start.elapsed(),
        };

        let elapsed = Duration::from_millis(summary.elapsed.as_millis() as u64);
        match state {
            BatchState::Cancelled => warn!(
                "🛑 Batch cancelled after {} of {} frames ({})",
                frames.len(),
                total,
                humantime::format_duration(elapsed)
            ),
            _ => info!(
                "✅ Batch finished: {} analyzed, {} cached, {} failed in {}",
                summary.frames_analyzed,
                summary.cache_hits,
                summary.frames_failed,
                humantime::format_duration(elapsed)
            ),
        }

        BatchReport {
            state,
            frames,
            summary,
        }
    }

    /// Run a batch on the blocking pool, streaming progress over a channel.
    pub fn spawn(self: &Arc<Self>, paths: Vec<PathBuf>) -> BatchHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::clone(self);
        let join = tokio::task::spawn_blocking(move || {
            orchestrator.run(&paths, |progress| {
                // Receiver may be gone; the batch still completes.
                let _ = tx.send(progress);
            })
        });
        BatchHandle {
            progress: rx,
            cancel: self.cancel_handle(),
            join,
        }
    }

    fn process_file(&self, path: &Path) -> (FrameMetrics, FileOutcome) {
        let identity = match self.loader.identify(path) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("❌ {}", e);
                return (
                    FrameMetrics::failed(path, FailureKind::Load, e),
                    FileOutcome::Failed,
                );
            }
        };

        if let Some(metrics) = self.cache.lookup(&identity) {
            debug!("💾 Cache hit for {:?}", path);
            return (metrics, FileOutcome::Cached);
        }

        let analysis = panic::catch_unwind(AssertUnwindSafe(|| self.analyze(&identity)));
        match analysis {
            Ok(Ok(metrics)) => {
                self.cache.store(identity, metrics.clone());
                (metrics, FileOutcome::Analyzed)
            }
            Ok(Err(e)) => {
                warn!("❌ {}", e);
                (
                    FrameMetrics::failed(path, FailureKind::Load, e),
                    FileOutcome::Failed,
                )
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!("💥 Analysis of {:?} panicked: {}", path, reason);
                (
                    FrameMetrics::failed(
                        path,
                        FailureKind::Internal,
                        format!("analysis panicked: {}", reason),
                    ),
                    FileOutcome::Failed,
                )
            }
        }
    }

    fn analyze(&self, identity: &FileIdentity) -> Result<FrameMetrics, LoadError> {
        let frame = self.loader.load(&identity.path)?;
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.measure(identity, &frame))
    }

    /// Detection, fitting and aggregation of one decoded frame. Scratch
    /// buffers live in an arena dropped with this call.
    fn measure(&self, identity: &FileIdentity, frame: &Frame) -> FrameMetrics {
        let mut bump = Bump::new();

        let stats = ImageStatistics::compute_in(&frame.pixels, self.detection.sample_limit, &bump);
        let candidates = detect_stars_with(&frame.pixels, &stats, &self.detection, &bump);
        self.counters.detections.fetch_add(1, Ordering::Relaxed);
        bump.reset();

        let fits = fit_stars(&frame.pixels, &candidates, &self.fitting, &mut bump);
        self.counters.fits.fetch_add(1, Ordering::Relaxed);

        let metrics = aggregate(
            identity,
            candidates.len(),
            &fits,
            &stats,
            &frame.header,
            &self.aggregation,
        );
        debug!(
            "📊 {}: {} stars of {} candidates, FWHM {:?}",
            metrics.file_name, metrics.star_count, metrics.candidates_detected, metrics.fwhm_pixels
        );
        metrics
    }
}
