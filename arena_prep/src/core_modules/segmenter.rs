// THEORY:
// The `segmenter` is the single-frame analysis stage. It answers "which pixels of
// this frame belong to a color-marked subject, and which blob is which" without
// any memory of previous frames. Temporal reasoning lives in the background
// estimate it is handed, not here.
//
// Pipeline, per frame:
// 1.  **Color gate**: each pixel is normalized and viewed in HSV. Only pixels that
//     are saturated enough and bright enough survive as color candidates; grays,
//     near-black and near-white pixels are never a marker.
// 2.  **Change gate**: when a background is supplied, the Euclidean RGB distance
//     to it forms a distance map. Otsu's method over a 256-bin histogram of that
//     map separates "same as background" from "changed". Only a degenerate
//     histogram (every pixel in one bin, or nothing to split) falls back to the
//     configured fixed distance.
// 3.  **Classification**: every surviving pixel is assigned the nearest palette
//     color, producing a coarse class map.
// 4.  **Grouping**: the `labeling` layer smooths each class and grows connected
//     components into a label matrix with deterministic ids.
//
// An empty result is not a failure. The caller receives an all-zero label matrix
// with a `NoForegroundDetected` status.

use crate::core_modules::labeling::{self, Centroid, Connectivity, LabelMatrix};
use crate::core_modules::pixel::pixel::{parse_hex, Pixel};
use crate::error::{PrepError, Result};
use image::imageops::FilterType;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tokio_util::sync::CancellationToken;

const HISTOGRAM_BINS: usize = 256;
const MAX_DISTANCE: f32 = 1.732_050_8;

/// One target marker color.
#[derive(Debug, Clone, PartialEq)]
pub struct PaletteEntry {
    /// Subject code reported for blobs of this color (e.g. "R").
    pub code: String,
    pub color: Pixel,
}

impl PaletteEntry {
    pub fn from_hex(code: &str, hex: &str) -> Option<Self> {
        Some(Self {
            code: code.to_string(),
            color: parse_hex(hex)?,
        })
    }
}

/// Red, green, blue and yellow markers.
pub fn default_palette() -> Vec<PaletteEntry> {
    [("R", "#ff4f4f"), ("G", "#34c759"), ("B", "#4f8cff"), ("Y", "#ffd166")]
        .iter()
        .filter_map(|(code, hex)| PaletteEntry::from_hex(code, hex))
        .collect()
}

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Minimum HSV saturation of a color candidate.
    pub sat_min: f32,
    /// Minimum HSV value of a color candidate.
    pub val_min: f32,
    /// Background distance used when Otsu cannot split the histogram.
    pub fixed_distance_threshold: f32,
    /// Components below this many pixels are erased.
    pub area_min: usize,
    /// Disk radius of the open/close smoothing. 0 disables it.
    pub morph_radius: u32,
    pub connectivity: Connectivity,
    pub palette: Vec<PaletteEntry>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sat_min: 0.25,
            val_min: 0.15,
            fixed_distance_threshold: 0.1,
            area_min: 50,
            morph_radius: 2,
            connectivity: Connectivity::Eight,
            palette: default_palette(),
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("sat_min", self.sat_min), ("val_min", self.val_min)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PrepError::InvalidParameter(format!("{name} must lie in [0, 1], got {value}")));
            }
        }
        if !(self.fixed_distance_threshold > 0.0) {
            return Err(PrepError::InvalidParameter("fixed_distance_threshold must be positive".into()));
        }
        if self.palette.is_empty() || self.palette.len() > u8::MAX as usize {
            return Err(PrepError::InvalidParameter(format!(
                "palette needs 1..=255 colors, got {}",
                self.palette.len()
            )));
        }
        Ok(())
    }
}

/// How the change gate threshold was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdKind {
    Adaptive,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceThreshold {
    /// Minimum RGB distance to the background for a pixel to count as changed.
    pub value: f32,
    pub kind: ThresholdKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Ok,
    NoForegroundDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentStats {
    pub nonzero_pixel_count: usize,
    pub distinct_label_count: usize,
}

/// A connected blob with its palette code.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentComponent {
    pub label: u32,
    pub code: String,
    pub area: usize,
    pub centroid: Centroid,
    pub bounding_box: (u32, u32, u32, u32),
}

#[derive(Debug, Clone)]
pub struct Segmentation {
    pub labels: LabelMatrix,
    pub components: Vec<SegmentComponent>,
    pub stats: SegmentStats,
    pub status: SegmentStatus,
    /// `None` when no background was supplied.
    pub threshold: Option<DistanceThreshold>,
}

#[derive(Debug, Clone, Default)]
pub struct FrameSegmenter {
    config: SegmenterConfig,
}

impl FrameSegmenter {
    pub fn new(config: SegmenterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Segments one frame. A background of a different size is resampled to the
    /// frame first.
    pub fn segment(
        &self,
        frame: &RgbaImage,
        background: Option<&RgbaImage>,
        cancel: &CancellationToken,
    ) -> Result<Segmentation> {
        let (width, height) = frame.dimensions();
        let pixels: Vec<Pixel> = frame.pixels().map(|p| Pixel::from_bytes(&p.0)).collect();

        let mut candidates: Vec<bool> = pixels
            .iter()
            .map(|p| p.saturation_hsv() >= self.config.sat_min && p.value_hsv() >= self.config.val_min)
            .collect();

        let threshold = match background {
            Some(background) => {
                let background = if background.dimensions() == frame.dimensions() {
                    Cow::Borrowed(background)
                } else {
                    Cow::Owned(image::imageops::resize(background, width, height, FilterType::Triangle))
                };
                let distances: Vec<f32> = pixels
                    .iter()
                    .zip(background.pixels())
                    .map(|(p, b)| p.distance(&Pixel::from_bytes(&b.0)))
                    .collect();
                let threshold = self.distance_threshold(&distances);
                for (candidate, distance) in candidates.iter_mut().zip(&distances) {
                    *candidate &= *distance >= threshold.value;
                }
                Some(threshold)
            }
            None => None,
        };

        if cancel.is_cancelled() {
            return Err(PrepError::Cancelled);
        }

        let classes: Vec<u8> = pixels
            .iter()
            .zip(&candidates)
            .map(|(pixel, &candidate)| if candidate { self.nearest_class(pixel) } else { 0 })
            .collect();
        let smoothed = labeling::smooth_classes(&classes, width, height, self.config.morph_radius);

        if cancel.is_cancelled() {
            return Err(PrepError::Cancelled);
        }

        let (labels, infos) =
            labeling::label_components(&smoothed, width, height, self.config.connectivity, self.config.area_min);

        let components: Vec<SegmentComponent> = infos
            .into_iter()
            .map(|info| SegmentComponent {
                label: info.label,
                code: self.config.palette[info.class as usize - 1].code.clone(),
                area: info.area,
                centroid: info.centroid,
                bounding_box: info.bounding_box,
            })
            .collect();

        let stats = SegmentStats {
            nonzero_pixel_count: components.iter().map(|c| c.area).sum(),
            distinct_label_count: components.len(),
        };
        let status = if components.is_empty() {
            tracing::debug!(width, height, "No foreground detected");
            SegmentStatus::NoForegroundDetected
        } else {
            SegmentStatus::Ok
        };

        Ok(Segmentation {
            labels,
            components,
            stats,
            status,
            threshold,
        })
    }

    fn distance_threshold(&self, distances: &[f32]) -> DistanceThreshold {
        match otsu_threshold(distances) {
            Some(value) => DistanceThreshold {
                value,
                kind: ThresholdKind::Adaptive,
            },
            None => DistanceThreshold {
                value: self.config.fixed_distance_threshold,
                kind: ThresholdKind::Fixed,
            },
        }
    }

    /// 1-based index of the closest palette color.
    fn nearest_class(&self, pixel: &Pixel) -> u8 {
        let mut best = 0usize;
        let mut best_distance = f32::INFINITY;
        for (index, entry) in self.config.palette.iter().enumerate() {
            let distance = pixel.distance_squared(&entry.color);
            if distance < best_distance {
                best_distance = distance;
                best = index;
            }
        }
        best as u8 + 1
    }
}

/// Otsu's method over RGB distances in `[0, sqrt(3)]`. Returns the smallest
/// distance classified as "changed", or `None` when the histogram cannot be
/// split (fewer than two samples or every sample in a single bin).
pub fn otsu_threshold(distances: &[f32]) -> Option<f32> {
    if distances.len() < 2 {
        return None;
    }
    let bucket = |d: f32| (((d / MAX_DISTANCE).clamp(0.0, 1.0) * (HISTOGRAM_BINS - 1) as f32) as usize).min(HISTOGRAM_BINS - 1);

    let mut histogram = [0u64; HISTOGRAM_BINS];
    for &d in distances {
        histogram[bucket(d)] += 1;
    }

    let total = distances.len() as f64;
    let global_mean: f64 = histogram.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum::<f64>() / total;

    let mut cum_weight = 0.0f64;
    let mut cum_mean = 0.0f64;
    let mut max_variance = 0.0f64;
    let mut optimal = None;
    for (t, &count) in histogram.iter().enumerate().take(HISTOGRAM_BINS - 1) {
        cum_weight += count as f64 / total;
        cum_mean += t as f64 * count as f64 / total;
        let w0 = cum_weight;
        let w1 = 1.0 - w0;
        if w0 < 1e-12 || w1 < 1e-12 {
            continue;
        }
        let mu0 = cum_mean / w0;
        let mu1 = (global_mean - cum_mean) / w1;
        let variance = w0 * w1 * (mu0 - mu1) * (mu0 - mu1);
        if variance > max_variance {
            max_variance = variance;
            optimal = Some(t);
        }
    }

    // Pixels in buckets above `t` are foreground: d >= (t + 1) / 255 * sqrt(3).
    optimal.map(|t| (t + 1) as f32 / (HISTOGRAM_BINS - 1) as f32 * MAX_DISTANCE)
}
