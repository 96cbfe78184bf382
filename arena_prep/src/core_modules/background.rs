// THEORY:
// The `background` module estimates what the arena looks like with nobody in it.
// Where a temporal analyzer keeps a rolling history per region and summarizes it
// with running statistics, the estimator keeps a *sampled* history per pixel and
// summarizes it with a rank statistic.
//
// Key architectural principles:
// 1.  **Sampling, not streaming**: `n_frames` timestamps are drawn uniformly from
//     the timing window (minus a small margin at each end) and deduplicated at
//     millisecond resolution. `n_frames` is the operator's cost dial.
// 2.  **Bounded working resolution**: every decoded frame is resized to a fixed
//     maximum width (aspect preserved) before it is kept, so long or 4K videos
//     cost the same as small ones.
// 3.  **Quantile over mean**: per pixel and per channel the samples are sorted
//     and the value at `round(q * (n - 1))` is kept. A subject that crosses a pixel
//     in a minority of samples cannot drag the estimate, which a mean would allow.
// 4.  **Fail loudly**: if not a single frame decodes, the result is an explicit
//     error. A black raster must never pass for a background.
// 5.  **Cancellable**: the token is polled between frames and between scanline
//     bands. A cancelled estimate returns `Cancelled` and its partial raster is
//     dropped with the stack frame.

use crate::core_modules::frame_source::FrameSource;
use crate::error::{PrepError, Result};
use image::imageops::FilterType;
use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Rows summarized between two cancellation checks.
const BAND_ROWS: u32 = 16;
/// Extra draws allowed per requested sample when deduplication collides.
const DRAW_BUDGET_FACTOR: usize = 8;

/// The sampling window inside a video, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingWindow {
    pub start_time: f64,
    pub end_time: f64,
}

impl TimingWindow {
    pub fn new(start_time: f64, end_time: f64) -> Result<Self> {
        let window = Self {
            start_time,
            end_time,
        };
        window.validate()?;
        Ok(window)
    }

    /// The whole video.
    pub fn full(duration: f64) -> Result<Self> {
        Self::new(0.0, duration)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.start_time.is_finite() || !self.end_time.is_finite() {
            return Err(self.invalid("timestamps must be finite"));
        }
        if self.start_time < 0.0 {
            return Err(self.invalid("start is negative"));
        }
        if self.end_time <= self.start_time {
            return Err(self.invalid("end must be after start"));
        }
        Ok(())
    }

    /// Clamps the end to the video duration. A window starting at or past the
    /// end of the video cannot be clamped into anything useful.
    pub fn clamped_to(&self, duration: f64) -> Result<Self> {
        self.validate()?;
        if self.start_time >= duration {
            return Err(self.invalid(&format!("starts at or after the video end ({duration:.3}s)")));
        }
        Ok(Self {
            start_time: self.start_time,
            end_time: self.end_time.min(duration),
        })
    }

    pub fn length(&self) -> f64 {
        self.end_time - self.start_time
    }

    fn invalid(&self, reason: &str) -> PrepError {
        PrepError::InvalidWindow {
            start: self.start_time,
            end: self.end_time,
            reason: reason.to_string(),
        }
    }
}

/// Operator-chosen sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundParams {
    pub n_frames: u32,
    pub quantile: f64,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            n_frames: 20,
            quantile: 0.5,
        }
    }
}

impl BackgroundParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_frames == 0 {
            return Err(PrepError::InvalidParameter("n_frames must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.quantile) {
            return Err(PrepError::InvalidParameter(format!(
                "quantile must lie in [0, 1], got {}",
                self.quantile
            )));
        }
        Ok(())
    }
}

/// An estimated background and the parameters that produced it.
#[derive(Debug, Clone)]
pub struct BackgroundImage {
    pub raster: RgbaImage,
    pub params: BackgroundParams,
    /// Frames that actually decoded and contributed.
    pub frames_used: usize,
    /// Timestamps that contributed, in seconds.
    pub sample_times: Vec<f64>,
}

/// Tunables for the estimator.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    /// Frames wider than this are downscaled before sampling.
    pub max_width: u32,
    /// Margin kept from both ends of the window, in seconds.
    pub edge_epsilon: f64,
    /// Fixed seed for reproducible sampling; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            max_width: 640,
            edge_epsilon: 0.05,
            seed: None,
        }
    }
}

/// Builds quantile backgrounds from sampled frames.
#[derive(Debug, Clone, Default)]
pub struct BackgroundEstimator {
    config: EstimatorConfig,
}

impl BackgroundEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn estimate(
        &self,
        source: &dyn FrameSource,
        video: &Path,
        window: &TimingWindow,
        params: &BackgroundParams,
        cancel: &CancellationToken,
    ) -> Result<BackgroundImage> {
        params.validate()?;

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let timestamps = sample_timestamps(
            window.start_time,
            window.end_time,
            params.n_frames as usize,
            self.config.edge_epsilon,
            &mut rng,
        );

        let mut frames: Vec<RgbaImage> = Vec::with_capacity(timestamps.len());
        let mut sample_times = Vec::with_capacity(timestamps.len());
        for &timestamp in &timestamps {
            if cancel.is_cancelled() {
                return Err(PrepError::Cancelled);
            }
            match source.decode_frame(video, timestamp) {
                Ok(frame) => {
                    let target = match frames.first() {
                        Some(first) => first.dimensions(),
                        None => working_size(frame.width(), frame.height(), self.config.max_width),
                    };
                    frames.push(fit_to(frame, target));
                    sample_times.push(timestamp);
                }
                Err(e) => {
                    tracing::warn!(video = %video.display(), timestamp, error = %e, "Skipping undecodable sample frame");
                }
            }
        }

        if frames.is_empty() {
            return Err(PrepError::DecodeFailure {
                video: video.to_path_buf(),
                attempted: timestamps.len(),
            });
        }

        let raster = quantile_raster(&frames, params.quantile, cancel)?;
        tracing::info!(
            video = %video.display(),
            requested = params.n_frames,
            frames = frames.len(),
            quantile = params.quantile,
            width = raster.width(),
            height = raster.height(),
            "Background estimated"
        );

        Ok(BackgroundImage {
            raster,
            params: *params,
            frames_used: frames.len(),
            sample_times,
        })
    }
}

/// Draws up to `n` distinct timestamps (millisecond resolution, ascending) from
/// `[start + eps, end - eps]`. A degenerate window yields one timestamp at `start`.
pub fn sample_timestamps(start: f64, end: f64, n: usize, eps: f64, rng: &mut impl Rng) -> Vec<f64> {
    if !(end > start) || n == 0 {
        return vec![start.max(0.0)];
    }

    let (mut low, mut high) = (start + eps, end - eps);
    if low >= high {
        let middle = (start + end) / 2.0;
        low = middle;
        high = middle;
    }
    if low == high {
        return vec![low];
    }

    let mut picked: BTreeSet<u64> = BTreeSet::new();
    let mut draws = 0;
    while picked.len() < n && draws < n * DRAW_BUDGET_FACTOR {
        let timestamp: f64 = rng.random_range(low..=high);
        picked.insert((timestamp * 1000.0).round() as u64);
        draws += 1;
    }
    picked.into_iter().map(|millis| millis as f64 / 1000.0).collect()
}

/// Index of the quantile in a sorted sample of length `n`.
pub fn quantile_rank(quantile: f64, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    ((quantile.clamp(0.0, 1.0) * (n - 1) as f64).round() as usize).min(n - 1)
}

/// Size a frame is reduced to before sampling.
pub fn working_size(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || max_width == 0 {
        return (width, height);
    }
    let scaled_height = (height as f64 * max_width as f64 / width as f64).round() as u32;
    (max_width, scaled_height.max(1))
}

fn fit_to(frame: RgbaImage, (width, height): (u32, u32)) -> RgbaImage {
    if frame.dimensions() == (width, height) {
        frame
    } else {
        image::imageops::resize(&frame, width, height, FilterType::Triangle)
    }
}

/// Per-pixel, per-channel quantile across same-sized frames. Alpha is opaque.
fn quantile_raster(frames: &[RgbaImage], quantile: f64, cancel: &CancellationToken) -> Result<RgbaImage> {
    let (width, height) = frames[0].dimensions();
    let rank = quantile_rank(quantile, frames.len());
    let mut output = RgbaImage::new(width, height);
    let raw: &mut [u8] = &mut output;
    let mut samples: Vec<u8> = vec![0; frames.len()];
    let row_bytes = width as usize * 4;

    let mut band_start = 0;
    while band_start < height {
        if cancel.is_cancelled() {
            return Err(PrepError::Cancelled);
        }
        let band_end = (band_start + BAND_ROWS).min(height);
        let first_byte = band_start as usize * row_bytes;
        let last_byte = band_end as usize * row_bytes;

        for (offset, pixel) in raw[first_byte..last_byte].chunks_exact_mut(4).enumerate() {
            let base = first_byte + offset * 4;
            for channel in 0..3 {
                for (sample, frame) in samples.iter_mut().zip(frames) {
                    *sample = frame.as_raw()[base + channel];
                }
                samples.sort_unstable();
                pixel[channel] = samples[rank];
            }
            pixel[3] = 255;
        }
        band_start = band_end;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BrokenVideo, ConstantVideo, FlakyVideo, SyntheticVideo};
    use assert_matches::assert_matches;
    use image::Rgba;

    fn seeded() -> BackgroundEstimator {
        BackgroundEstimator::new(EstimatorConfig {
            seed: Some(7),
            ..EstimatorConfig::default()
        })
    }

    #[test]
    fn window_rejects_inverted_and_clamps_to_duration() {
        assert_matches!(TimingWindow::new(5.0, 5.0), Err(PrepError::InvalidWindow { .. }));
        assert_matches!(TimingWindow::new(-1.0, 5.0), Err(PrepError::InvalidWindow { .. }));
        let clamped = TimingWindow::new(2.0, 30.0).unwrap().clamped_to(10.0).unwrap();
        assert_eq!(clamped, TimingWindow { start_time: 2.0, end_time: 10.0 });
        assert_matches!(
            TimingWindow::new(12.0, 30.0).unwrap().clamped_to(10.0),
            Err(PrepError::InvalidWindow { .. })
        );
    }

    #[test]
    fn samples_are_distinct_sorted_and_inside_the_margins() {
        let mut rng = StdRng::seed_from_u64(1);
        let times = sample_timestamps(2.0, 8.0, 50, 0.1, &mut rng);
        assert_eq!(times.len(), 50);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert!(times.iter().all(|&t| (2.1..=7.9).contains(&t)));
    }

    #[test]
    fn degenerate_window_falls_back_to_one_timestamp_at_start() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample_timestamps(4.0, 4.0, 20, 0.05, &mut rng), vec![4.0]);
        assert_eq!(sample_timestamps(4.0, 3.0, 20, 0.05, &mut rng), vec![4.0]);
    }

    #[test]
    fn quantile_rank_matches_rounding_rule() {
        assert_eq!(quantile_rank(0.5, 20), 10);
        assert_eq!(quantile_rank(0.5, 1), 0);
        assert_eq!(quantile_rank(0.0, 7), 0);
        assert_eq!(quantile_rank(1.0, 7), 6);
        assert_eq!(quantile_rank(0.9, 11), 9);
    }

    #[test]
    fn working_size_preserves_aspect() {
        assert_eq!(working_size(1920, 1080, 640), (640, 360));
        assert_eq!(working_size(320, 240, 640), (320, 240));
    }

    #[test]
    fn median_of_constant_video_is_the_constant() {
        let video = ConstantVideo::new(64, 48, Rgba([90, 140, 200, 255]));
        for n in [1, 2, 5, 20] {
            let params = BackgroundParams { n_frames: n, quantile: 0.5 };
            let window = TimingWindow::new(0.0, 10.0).unwrap();
            let bg = seeded()
                .estimate(&video, Path::new("const.mp4"), &window, &params, &CancellationToken::new())
                .unwrap();
            assert!(bg.raster.pixels().all(|p| *p == Rgba([90, 140, 200, 255])), "n = {n}");
        }
    }

    #[test]
    fn median_removes_a_moving_subject() {
        let video = SyntheticVideo::default();
        let params = BackgroundParams { n_frames: 20, quantile: 0.5 };
        let window = TimingWindow::new(0.0, 10.0).unwrap();
        let bg = seeded()
            .estimate(&video, Path::new("synthetic.mp4"), &window, &params, &CancellationToken::new())
            .unwrap();
        assert_eq!(bg.raster.dimensions(), (640, 480));
        assert!(bg.raster.pixels().all(|p| *p == video.background));
    }

    #[test]
    fn every_decode_failing_is_an_explicit_error() {
        let params = BackgroundParams::default();
        let window = TimingWindow::new(0.0, 10.0).unwrap();
        let err = seeded()
            .estimate(&BrokenVideo, Path::new("broken.mp4"), &window, &params, &CancellationToken::new())
            .unwrap_err();
        assert_matches!(err, PrepError::DecodeFailure { attempted: 20, .. });
    }

    #[test]
    fn partial_decode_failures_are_tolerated() {
        let video = FlakyVideo::new(ConstantVideo::new(16, 16, Rgba([10, 20, 30, 255])));
        let params = BackgroundParams { n_frames: 10, quantile: 0.5 };
        let window = TimingWindow::new(0.0, 10.0).unwrap();
        let bg = seeded()
            .estimate(&video, Path::new("flaky.mp4"), &window, &params, &CancellationToken::new())
            .unwrap();
        assert!(bg.frames_used < 10 && bg.frames_used > 0);
        assert_eq!(bg.sample_times.len(), bg.frames_used);
    }

    #[test]
    fn wide_frames_are_reduced_to_working_width() {
        let video = ConstantVideo::new(1280, 720, Rgba([50, 50, 50, 255]));
        let params = BackgroundParams { n_frames: 2, quantile: 0.5 };
        let window = TimingWindow::new(0.0, 10.0).unwrap();
        let bg = seeded()
            .estimate(&video, Path::new("wide.mp4"), &window, &params, &CancellationToken::new())
            .unwrap();
        assert_eq!(bg.raster.dimensions(), (640, 360));
    }

    #[test]
    fn cancelled_estimate_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let window = TimingWindow::new(0.0, 10.0).unwrap();
        let err = seeded()
            .estimate(&SyntheticVideo::default(), Path::new("s.mp4"), &window, &BackgroundParams::default(), &cancel)
            .unwrap_err();
        assert_matches!(err, PrepError::Cancelled);
    }

    #[test]
    fn invalid_quantile_is_rejected_before_decoding() {
        let params = BackgroundParams { n_frames: 5, quantile: 1.5 };
        let window = TimingWindow::new(0.0, 10.0).unwrap();
        let err = seeded()
            .estimate(&BrokenVideo, Path::new("x.mp4"), &window, &params, &CancellationToken::new())
            .unwrap_err();
        assert_matches!(err, PrepError::InvalidParameter(_));
    }
}
