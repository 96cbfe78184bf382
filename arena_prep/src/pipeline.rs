// THEORY:
// The `pipeline` module is the top-level API of the preprocessing engine. It
// wires the leaf modules into request/response operations a UI or CLI layer can
// call directly: estimate a background, segment a frame, edit arena, timing and
// regions, mark subjects, finalize.
//
// Responsibilities that belong here and nowhere else:
// 1.  **Offloading**: every CPU-heavy call (estimation, segmentation, decoding)
//     runs on the `JobPool`, never on the async executor.
// 2.  **Exclusivity**: an estimation claims its video first; a second request
//     for the same video is rejected with `Busy`.
// 3.  **All-or-nothing persistence**: results are written to the store only
//     after a computation finished and was not cancelled. A cancelled or failed
//     run leaves the stored state exactly as it was.
// 4.  **Clamping**: timing windows are clamped to the probed video duration
//     before they are stored.

use crate::core_modules::background::{BackgroundEstimator, BackgroundParams, EstimatorConfig, TimingWindow};
use crate::core_modules::frame_source::{FrameSource, VideoProbe};
use crate::core_modules::geometry::ArenaBox;
use crate::core_modules::image_helper::image_helper;
use crate::core_modules::labeling::LabelMatrix;
use crate::core_modules::mark_writer::{MarkWriter, MarkWriterConfig};
use crate::core_modules::marks::{frame_key, FrameMark, MarkAssigner, MarkAssignerConfig};
use crate::core_modules::regions::RegionStore;
use crate::core_modules::segmenter::{FrameSegmenter, SegmenterConfig, Segmentation};
use crate::core_modules::sidecar::VideoState;
use crate::core_modules::state_store::{PerVideoStateStore, StatePatch};
use crate::day_group::PropagationConfig;
use crate::error::{PrepError, Result};
use crate::job_pool::JobPool;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Re-export key data structures for the public API.
pub use crate::core_modules::segmenter::{SegmentStats, SegmentStatus};
pub use crate::core_modules::sidecar::BackgroundRecord;

/// Configuration for the PrepPipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub estimator: EstimatorConfig,
    pub segmenter: SegmenterConfig,
    pub marks: MarkAssignerConfig,
    pub mark_writer: MarkWriterConfig,
    pub propagation: PropagationConfig,
    /// Blocking worker threads; defaults to the number of CPUs.
    pub workers: usize,
    /// Embed a PNG data-URL of the analyzed frame in each marked frame.
    pub inline_snapshots: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            segmenter: SegmenterConfig::default(),
            marks: MarkAssignerConfig::default(),
            mark_writer: MarkWriterConfig::default(),
            propagation: PropagationConfig::default(),
            workers: num_cpus::get(),
            inline_snapshots: false,
        }
    }
}

/// The main, top-level struct of the preprocessing engine.
pub struct PrepPipeline {
    config: PipelineConfig,
    source: Arc<dyn FrameSource>,
    store: Arc<PerVideoStateStore>,
    estimator: Arc<BackgroundEstimator>,
    segmenter: Arc<FrameSegmenter>,
    assigner: MarkAssigner,
    jobs: JobPool,
}

impl PrepPipeline {
    pub fn new(config: PipelineConfig, source: Arc<dyn FrameSource>, store: Arc<PerVideoStateStore>) -> Result<Self> {
        let segmenter = FrameSegmenter::new(config.segmenter.clone())?;
        Ok(Self {
            estimator: Arc::new(BackgroundEstimator::new(config.estimator.clone())),
            segmenter: Arc::new(segmenter),
            assigner: MarkAssigner::new(config.marks.clone()),
            jobs: JobPool::new(config.workers),
            config,
            source,
            store,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PerVideoStateStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    pub fn assigner(&self) -> &MarkAssigner {
        &self.assigner
    }

    pub fn jobs(&self) -> &JobPool {
        &self.jobs
    }

    pub async fn load(&self, video: &Path) -> Result<VideoState> {
        let store = self.store.clone();
        let video = video.to_path_buf();
        self.jobs.run_blocking(move || store.load(&video)).await
    }

    async fn save(&self, video: &Path, patch: StatePatch) -> Result<VideoState> {
        let store = self.store.clone();
        let video = video.to_path_buf();
        self.jobs.run_blocking(move || store.save(&video, patch)).await
    }

    pub async fn probe(&self, video: &Path) -> Result<VideoProbe> {
        let source = self.source.clone();
        let video = video.to_path_buf();
        self.jobs.run_blocking(move || source.probe(&video)).await
    }

    /// Stores the arena. Grid and physical size left unset on `arena` are kept
    /// from the stored arena.
    pub async fn set_arena(&self, video: &Path, mut arena: ArenaBox) -> Result<VideoState> {
        arena.validate()?;
        if let Some(stored) = self.load(video).await?.arena {
            arena.grid_cols = arena.grid_cols.or(stored.grid_cols);
            arena.grid_rows = arena.grid_rows.or(stored.grid_rows);
            arena.width_in_cm = arena.width_in_cm.or(stored.width_in_cm);
            arena.height_in_cm = arena.height_in_cm.or(stored.height_in_cm);
        }
        self.save(video, StatePatch::arena(arena)).await
    }

    /// Stores the timing window, clamped to the video duration.
    pub async fn set_timing(&self, video: &Path, window: TimingWindow) -> Result<VideoState> {
        let window = self.clamp_window(video, window).await?;
        self.save(video, StatePatch::timing(window)).await
    }

    pub async fn set_background_params(&self, video: &Path, params: BackgroundParams) -> Result<VideoState> {
        params.validate()?;
        self.save(
            video,
            StatePatch {
                bg_params: Some(params),
                ..StatePatch::default()
            },
        )
        .await
    }

    pub async fn set_regions(&self, video: &Path, regions: RegionStore) -> Result<VideoState> {
        self.save(video, StatePatch::regions(regions)).await
    }

    /// Stores arena and regions exactly as given, in one write.
    pub async fn apply_layout(&self, video: &Path, arena: ArenaBox, regions: RegionStore) -> Result<VideoState> {
        arena.validate()?;
        self.save(
            video,
            StatePatch {
                arena: Some(arena),
                regions: Some(regions),
                ..StatePatch::default()
            },
        )
        .await
    }

    async fn clamp_window(&self, video: &Path, window: TimingWindow) -> Result<TimingWindow> {
        window.validate()?;
        let probe = self.probe(video).await?;
        window.clamped_to(probe.duration)
    }

    /// Estimates and stores the background of `video`. `window` and `params`
    /// default to the stored timing window (or the whole video) and the stored
    /// parameters. The timing window used is stored along with the background.
    pub async fn estimate_background(
        &self,
        video: &Path,
        window: Option<TimingWindow>,
        params: Option<BackgroundParams>,
        cancel: &CancellationToken,
    ) -> Result<VideoState> {
        let _claim = self.jobs.claim(video)?;
        let state = self.load(video).await?;
        let params = params.unwrap_or(state.bg_params);
        params.validate()?;
        let window = match window.or(state.timing) {
            Some(window) => self.clamp_window(video, window).await?,
            None => TimingWindow::full(self.probe(video).await?.duration)?,
        };

        tracing::info!(
            video = %video.display(),
            start = window.start_time,
            end = window.end_time,
            frames = params.n_frames,
            quantile = params.quantile,
            "Estimating background"
        );
        let background = {
            let estimator = self.estimator.clone();
            let source = self.source.clone();
            let owned = video.to_path_buf();
            let token = cancel.clone();
            self.jobs
                .run_blocking(move || estimator.estimate(source.as_ref(), &owned, &window, &params, &token))
                .await?
        };
        if cancel.is_cancelled() {
            return Err(PrepError::Cancelled);
        }

        self.save(
            video,
            StatePatch {
                timing: Some(window),
                background: Some(background),
                ..StatePatch::default()
            },
        )
        .await
    }

    /// Decodes the frame at `timestamp` and segments it against the stored
    /// background, when there is one.
    pub async fn segment_frame(&self, video: &Path, timestamp: f64, cancel: &CancellationToken) -> Result<Segmentation> {
        let (_, segmentation) = self.decode_and_segment(video, timestamp, cancel).await?;
        Ok(segmentation)
    }

    async fn decode_and_segment(
        &self,
        video: &Path,
        timestamp: f64,
        cancel: &CancellationToken,
    ) -> Result<(image::RgbaImage, Segmentation)> {
        let store = self.store.clone();
        let source = self.source.clone();
        let segmenter = self.segmenter.clone();
        let owned = video.to_path_buf();
        let token = cancel.clone();
        self.jobs
            .run_blocking(move || {
                let state = store.load(&owned)?;
                let background = store.load_background(&owned, &state)?;
                let frame = source.decode_frame(&owned, timestamp)?;
                let segmentation = segmenter.segment(&frame, background.as_ref(), &token)?;
                Ok((frame, segmentation))
            })
            .await
    }

    /// The marks record of a frame: the stored one when the frame was marked
    /// before, otherwise a fresh record over a new segmentation. A fresh record
    /// is not persisted until a mark is placed on it.
    pub async fn open_frame(&self, video: &Path, timestamp: f64, cancel: &CancellationToken) -> Result<FrameMark> {
        let mut state = self.load(video).await?;
        if let Some(stored) = state.frames.remove(&frame_key(timestamp)) {
            return Ok(stored);
        }
        let (frame, segmentation) = self.decode_and_segment(video, timestamp, cancel).await?;
        let mut record = FrameMark::new(segmentation.labels);
        if self.config.inline_snapshots {
            record.snapshot = Some(image_helper::to_data_url(&image_helper::encode_png(&frame)?));
        }
        Ok(record)
    }

    /// A debounced writer for the frame marks of `video`.
    pub fn mark_writer(&self, video: &Path) -> MarkWriter {
        MarkWriter::new(self.store.clone(), video, self.config.mark_writer.clone())
    }

    pub async fn finalize(&self, video: &Path) -> Result<VideoState> {
        let store = self.store.clone();
        let video = video.to_path_buf();
        self.jobs.run_blocking(move || store.finalize(&video)).await
    }

    /// 16-bit grayscale PNG of a label matrix.
    pub fn export_labels(&self, labels: &LabelMatrix) -> Result<Vec<u8>> {
        image_helper::encode_labels(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::geometry::PixelPoint;
    use crate::core_modules::state_store::MemorySidecars;
    use crate::test_support::{BrokenVideo, SyntheticVideo};
    use assert_matches::assert_matches;
    use image::Rgba;

    fn pipeline_with(source: Arc<dyn FrameSource>) -> PrepPipeline {
        let config = PipelineConfig {
            estimator: EstimatorConfig {
                seed: Some(7),
                ..EstimatorConfig::default()
            },
            workers: 2,
            ..PipelineConfig::default()
        };
        let store = Arc::new(PerVideoStateStore::new(Arc::new(MemorySidecars::new())));
        PrepPipeline::new(config, source, store).unwrap()
    }

    fn synthetic() -> PrepPipeline {
        pipeline_with(Arc::new(SyntheticVideo::default()))
    }

    #[tokio::test]
    async fn background_then_segmentation_isolates_the_square() {
        let pipeline = synthetic();
        let video = Path::new("cage.day01.mp4");
        let token = CancellationToken::new();
        let state = pipeline
            .estimate_background(
                video,
                Some(TimingWindow::new(0.0, 10.0).unwrap()),
                Some(BackgroundParams {
                    n_frames: 20,
                    quantile: 0.5,
                }),
                &token,
            )
            .await
            .unwrap();
        assert!(state.has_fresh_background());

        let background = pipeline.store().load_background(video, &state).unwrap().unwrap();
        assert!(background.pixels().all(|p| *p == Rgba([128, 128, 128, 255])));

        let segmentation = pipeline.segment_frame(video, 0.05, &token).await.unwrap();
        assert_eq!(segmentation.stats.distinct_label_count, 1);
        let area = segmentation.stats.nonzero_pixel_count as f64;
        assert!((area - 3600.0).abs() <= 180.0, "area {area}");
    }

    #[tokio::test]
    async fn concurrent_estimation_for_the_same_video_is_busy() {
        let pipeline = synthetic();
        let video = Path::new("cage.day01.mp4");
        let _claim = pipeline.jobs().claim(video).unwrap();
        let err = pipeline
            .estimate_background(video, None, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, PrepError::Busy(_));
    }

    #[tokio::test]
    async fn cancelled_estimation_persists_nothing() {
        let pipeline = synthetic();
        let video = Path::new("cage.day01.mp4");
        let token = CancellationToken::new();
        token.cancel();
        let err = pipeline.estimate_background(video, None, None, &token).await.unwrap_err();
        assert_matches!(err, PrepError::Cancelled);
        let state = pipeline.load(video).await.unwrap();
        assert!(state.background.is_none());
        assert!(state.timing.is_none());
        assert!(!pipeline.jobs().is_busy(video));
    }

    #[tokio::test]
    async fn undecodable_video_reports_decode_failure() {
        let pipeline = pipeline_with(Arc::new(BrokenVideo));
        let video = Path::new("broken.mp4");
        let err = pipeline
            .estimate_background(video, None, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, PrepError::DecodeFailure { .. });
        assert!(pipeline.load(video).await.unwrap().background.is_none());
    }

    #[tokio::test]
    async fn timing_is_clamped_to_the_video() {
        let pipeline = synthetic();
        let video = Path::new("cage.day01.mp4");
        let state = pipeline
            .set_timing(video, TimingWindow::new(2.0, 50.0).unwrap())
            .await
            .unwrap();
        assert_eq!(state.timing, Some(TimingWindow::new(2.0, 10.0).unwrap()));
        let err = pipeline
            .set_timing(video, TimingWindow::new(12.0, 20.0).unwrap())
            .await
            .unwrap_err();
        assert_matches!(err, PrepError::InvalidWindow { .. });
    }

    #[tokio::test]
    async fn arena_edits_keep_the_stored_grid() {
        let pipeline = synthetic();
        let video = Path::new("cage.day01.mp4");
        let mut first = ArenaBox::new(PixelPoint::new(0.0, 0.0), PixelPoint::new(100.0, 100.0));
        first.grid_cols = Some(5);
        first.grid_rows = Some(4);
        pipeline.set_arena(video, first).await.unwrap();
        let moved = ArenaBox::new(PixelPoint::new(10.0, 10.0), PixelPoint::new(300.0, 200.0));
        let state = pipeline.set_arena(video, moved).await.unwrap();
        let arena = state.arena.unwrap();
        assert_eq!(arena.tl, PixelPoint::new(10.0, 10.0));
        assert_eq!((arena.grid_cols, arena.grid_rows), (Some(5), Some(4)));
    }

    #[tokio::test]
    async fn opened_frames_carry_labels_and_reload_once_marked() {
        let pipeline = synthetic();
        let video = Path::new("cage.day01.mp4");
        let token = CancellationToken::new();
        pipeline
            .estimate_background(video, None, None, &token)
            .await
            .unwrap();

        let mut record = pipeline.open_frame(video, 0.05, &token).await.unwrap();
        assert!(record.marks.is_empty());
        pipeline
            .assigner()
            .assign(&mut record, PixelPoint::new(70.0, 230.0), (640, 480), "R")
            .unwrap();
        let writer = pipeline.mark_writer(video);
        writer.submit(frame_key(0.05), record.clone());
        writer.flush().await.unwrap();

        let reopened = pipeline.open_frame(video, 0.05, &token).await.unwrap();
        assert_eq!(reopened.labels, record.labels);
        assert_eq!(reopened.marks.len(), 1);
        assert_eq!((reopened.marks[0].subject.as_str(), reopened.marks[0].label), ("R", 1));

        let png = pipeline.export_labels(&reopened.labels).unwrap();
        assert!(!png.is_empty());
    }
}
