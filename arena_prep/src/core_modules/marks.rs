// THEORY:
// The `marks` module associates operator-chosen subject codes with segmentation
// blobs on one frame. It is the interactive counterpart of a tracker's data
// association step: instead of matching detections to tracks by distance, a
// click names the match directly and the module enforces the exclusivity rules.
//
// Rules, per frame:
// 1.  A label carries at most one subject; a subject sits on at most one label.
//     Assigning therefore evicts any mark on the same label and any mark of the
//     same subject before inserting the new one.
// 2.  A click that lands on background searches a small disk around itself for
//     the nearest labeled pixel before giving up.
// 3.  Dragging a mark re-resolves the label under the drop point. Dropping it on
//     background or outside the frame removes the mark.
//
// Clicks arrive in native video pixels and are rescaled into the label matrix
// resolution, which can be smaller when frames were analyzed downscaled.

use crate::core_modules::geometry::{resample_point, PixelPoint};
use crate::core_modules::labeling::{Centroid, LabelMatrix};
use crate::error::{PrepError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One subject placed on one blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub subject: String,
    pub label: u32,
    pub centroid: Centroid,
}

/// Everything recorded for one frame timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMark {
    /// Reference to (or inline data-URL of) the frame image the labels were computed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    pub labels: LabelMatrix,
    #[serde(default)]
    pub marks: Vec<Mark>,
}

impl FrameMark {
    pub fn new(labels: LabelMatrix) -> Self {
        Self {
            snapshot: None,
            labels,
            marks: Vec::new(),
        }
    }

    pub fn mark_for(&self, subject: &str) -> Option<&Mark> {
        self.marks.iter().find(|m| m.subject == subject)
    }

    /// Removes the mark of `subject`, if any.
    pub fn remove(&mut self, subject: &str) -> Option<Mark> {
        let index = self.marks.iter().position(|m| m.subject == subject)?;
        Some(self.marks.remove(index))
    }

    pub fn clear(&mut self) {
        self.marks.clear();
    }
}

/// Marked frames keyed by `frame_key(timestamp)`.
pub type FrameMarks = BTreeMap<String, FrameMark>;

/// Frame timestamps are keyed with millisecond precision.
pub fn frame_key(timestamp: f64) -> String {
    format!("{timestamp:.3}")
}

/// What an assignment or drag did to the frame's marks.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkUpdate {
    Assigned(Mark),
    Removed(Mark),
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct MarkAssignerConfig {
    /// Radius in label pixels searched around a click that hits background.
    pub search_radius: u32,
}

impl Default for MarkAssignerConfig {
    fn default() -> Self {
        Self { search_radius: 2 }
    }
}

#[derive(Debug, Clone)]
pub struct MarkAssigner {
    config: MarkAssignerConfig,
    /// Neighborhood offsets, nearest first.
    search_offsets: Vec<(i64, i64)>,
}

impl Default for MarkAssigner {
    fn default() -> Self {
        Self::new(MarkAssignerConfig::default())
    }
}

impl MarkAssigner {
    pub fn new(config: MarkAssignerConfig) -> Self {
        let r = config.search_radius as i64;
        let mut search_offsets: Vec<(i64, i64)> = (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
            .filter(|(dx, dy)| dx * dx + dy * dy <= r * r)
            .collect();
        search_offsets.sort_by_key(|&(dx, dy)| (dx * dx + dy * dy, dy, dx));
        Self {
            config,
            search_offsets,
        }
    }

    pub fn config(&self) -> &MarkAssignerConfig {
        &self.config
    }

    /// Label under `point` (label matrix pixels), searching the neighborhood when
    /// the point itself is background. `None` outside the matrix or when nothing
    /// labeled is near.
    pub fn resolve_label(&self, labels: &LabelMatrix, point: PixelPoint) -> Option<u32> {
        let (x, y) = (point.x.floor() as i64, point.y.floor() as i64);
        labels.get(x, y)?;
        self.search_offsets
            .iter()
            .filter_map(|&(dx, dy)| labels.get(x + dx, y + dy))
            .find(|&label| label != 0)
    }

    /// Places `subject` on the blob under `click`, given in native video pixels of
    /// a frame of `native_size`.
    pub fn assign(
        &self,
        frame: &mut FrameMark,
        click: PixelPoint,
        native_size: (u32, u32),
        subject: &str,
    ) -> Result<MarkUpdate> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(PrepError::InvalidParameter("subject code must not be empty".into()));
        }
        let point = resample_point(click, native_size, frame.labels.dimensions());
        let Some(label) = self.resolve_label(&frame.labels, point) else {
            return Ok(MarkUpdate::Unchanged);
        };
        let Some(centroid) = frame.labels.centroid(label) else {
            return Ok(MarkUpdate::Unchanged);
        };

        frame.marks.retain(|m| m.label != label && m.subject != subject);
        let mark = Mark {
            subject: subject.to_string(),
            label,
            centroid,
        };
        frame.marks.push(mark.clone());
        Ok(MarkUpdate::Assigned(mark))
    }

    /// Moves the mark of `subject` to the blob under `drop`. A drop outside the
    /// frame or on background removes the mark.
    pub fn drag(
        &self,
        frame: &mut FrameMark,
        subject: &str,
        drop: PixelPoint,
        native_size: (u32, u32),
    ) -> Result<MarkUpdate> {
        let subject = subject.trim();
        if frame.mark_for(subject).is_none() {
            return Ok(MarkUpdate::Unchanged);
        }
        let point = resample_point(drop, native_size, frame.labels.dimensions());
        let landed = frame
            .labels
            .get(point.x.floor() as i64, point.y.floor() as i64)
            .filter(|&label| label != 0);
        match landed {
            Some(_) => self.assign(frame, drop, native_size, subject),
            None => Ok(frame.remove(subject).map_or(MarkUpdate::Unchanged, MarkUpdate::Removed)),
        }
    }
}
