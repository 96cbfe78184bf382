// THEORY:
// Calibrating a video is a sequence of steps whose availability depends on what
// has been done so far: regions can only be drawn once the arena exists, colors
// can only be marked against a background, and so on. `allowed_next_steps` is
// that gating rule as a pure function of the stored state. It knows nothing
// about how the steps are presented.
//
// `EditorSession` carries the transient state of one operator editing one
// video: which region the brush paints into, which subject a click marks, an
// in-progress drag, and the frame currently open for marking. It is created per
// editing session and passed explicitly; nothing about an edit in progress lives
// in shared state. Edits are routed to `RegionStore` and `MarkAssigner`; the
// session never persists anything itself.

use crate::core_modules::geometry::{Cell, GeometryMapper, PixelPoint, resample_point};
use crate::core_modules::mark_writer::MarkWriter;
use crate::core_modules::marks::{FrameMark, MarkAssigner, MarkUpdate};
use crate::core_modules::regions::RegionStore;
use crate::core_modules::sidecar::VideoState;
use crate::error::{PrepError, Result};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Arena,
    Timing,
    Background,
    Regions,
    Colors,
    Finalize,
}

/// Steps the operator may work on given the stored state.
pub fn allowed_next_steps(state: &VideoState) -> BTreeSet<Step> {
    let arena = state.has_valid_arena();
    let timing = state.timing.is_some();
    let background = state.has_fresh_background();

    let mut steps = BTreeSet::from([Step::Arena, Step::Timing]);
    if timing {
        steps.insert(Step::Background);
    }
    if arena {
        steps.insert(Step::Regions);
    }
    if arena && background {
        steps.insert(Step::Colors);
    }
    if arena && timing && background {
        steps.insert(Step::Finalize);
    }
    steps
}

/// A frame open for marking.
#[derive(Debug, Clone)]
struct OpenFrame {
    key: String,
    record: FrameMark,
    dirty: bool,
}

/// Request-scoped editing state for one video.
#[derive(Debug, Clone)]
pub struct EditorSession {
    assigner: MarkAssigner,
    /// Native video resolution clicks are given in.
    native_size: (u32, u32),
    active_region: Option<String>,
    marking_subject: Option<String>,
    dragging: Option<String>,
    frame: Option<OpenFrame>,
}

impl EditorSession {
    pub fn new(assigner: MarkAssigner, native_size: (u32, u32)) -> Self {
        Self {
            assigner,
            native_size,
            active_region: None,
            marking_subject: None,
            dragging: None,
            frame: None,
        }
    }

    pub fn active_region(&self) -> Option<&str> {
        self.active_region.as_deref()
    }

    pub fn select_region(&mut self, regions: &RegionStore, name: &str) -> Result<()> {
        let region = regions
            .get(name)
            .ok_or_else(|| PrepError::UnknownRegion(name.to_string()))?;
        self.active_region = Some(region.name.clone());
        Ok(())
    }

    pub fn clear_region(&mut self) {
        self.active_region = None;
    }

    /// Toggles the grid cell under a video pixel in the active region. Returns
    /// the cell and whether it is now part of the region, or `None` when the
    /// pixel is outside the grid.
    pub fn paint(
        &self,
        regions: &mut RegionStore,
        mapper: &GeometryMapper,
        point: PixelPoint,
    ) -> Result<Option<(Cell, bool)>> {
        let name = self
            .active_region
            .as_deref()
            .ok_or_else(|| PrepError::InvalidParameter("no region selected".into()))?;
        let Some(cell) = mapper.pixel_to_cell_in_grid(point.x, point.y) else {
            return Ok(None);
        };
        let member = regions.toggle_cell(name, cell)?;
        Ok(Some((cell, member)))
    }

    /// Keeps the session pointing at a region the operator just renamed.
    pub fn region_renamed(&mut self, old_name: &str, new_name: &str) {
        if self
            .active_region
            .as_deref()
            .is_some_and(|active| active.eq_ignore_ascii_case(old_name))
        {
            self.active_region = Some(new_name.trim().to_string());
        }
    }

    pub fn marking_subject(&self) -> Option<&str> {
        self.marking_subject.as_deref()
    }

    pub fn start_marking(&mut self, subject: &str) -> Result<()> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(PrepError::InvalidParameter("subject code must not be empty".into()));
        }
        self.marking_subject = Some(subject.to_string());
        Ok(())
    }

    pub fn stop_marking(&mut self) {
        self.marking_subject = None;
    }

    /// Opens a frame for marking, dropping any drag in progress.
    pub fn open_frame(&mut self, key: String, record: FrameMark) {
        self.dragging = None;
        self.frame = Some(OpenFrame {
            key,
            record,
            dirty: false,
        });
    }

    pub fn current_frame(&self) -> Option<(&str, &FrameMark)> {
        self.frame.as_ref().map(|f| (f.key.as_str(), &f.record))
    }

    fn frame_mut(&mut self) -> Result<&mut OpenFrame> {
        self.frame
            .as_mut()
            .ok_or_else(|| PrepError::InvalidParameter("no frame open for marking".into()))
    }

    /// Marks the blob under `click` with the current subject.
    pub fn click(&mut self, click: PixelPoint) -> Result<MarkUpdate> {
        let subject = self
            .marking_subject
            .clone()
            .ok_or_else(|| PrepError::InvalidParameter("no subject selected for marking".into()))?;
        let native_size = self.native_size;
        let assigner = self.assigner.clone();
        let frame = self.frame_mut()?;
        let update = assigner.assign(&mut frame.record, click, native_size, &subject)?;
        frame.dirty |= update != MarkUpdate::Unchanged;
        Ok(update)
    }

    /// Starts dragging the mark on the blob under `point`. Returns its subject.
    pub fn begin_drag(&mut self, point: PixelPoint) -> Option<&str> {
        let frame = self.frame.as_ref()?;
        let labels = &frame.record.labels;
        let local = resample_point(point, self.native_size, labels.dimensions());
        let label = labels
            .get(local.x.floor() as i64, local.y.floor() as i64)
            .filter(|&label| label != 0)?;
        let subject = frame.record.marks.iter().find(|m| m.label == label)?.subject.clone();
        self.dragging = Some(subject);
        self.dragging.as_deref()
    }

    pub fn dragging(&self) -> Option<&str> {
        self.dragging.as_deref()
    }

    /// Drops the dragged mark at `point`.
    pub fn end_drag(&mut self, point: PixelPoint) -> Result<MarkUpdate> {
        let Some(subject) = self.dragging.take() else {
            return Ok(MarkUpdate::Unchanged);
        };
        let native_size = self.native_size;
        let assigner = self.assigner.clone();
        let frame = self.frame_mut()?;
        let update = assigner.drag(&mut frame.record, &subject, point, native_size)?;
        frame.dirty |= update != MarkUpdate::Unchanged;
        Ok(update)
    }

    pub fn cancel_drag(&mut self) {
        self.dragging = None;
    }

    /// Hands the open frame to `writer` if it changed since it was opened or
    /// last submitted.
    pub fn submit(&mut self, writer: &MarkWriter) -> bool {
        match self.frame.as_mut() {
            Some(frame) if frame.dirty => {
                writer.submit(frame.key.clone(), frame.record.clone());
                frame.dirty = false;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::background::TimingWindow;
    use crate::core_modules::geometry::{ArenaBox, GridSize};
    use crate::core_modules::labeling::LabelMatrix;
    use crate::core_modules::mark_writer::MarkWriterConfig;
    use crate::core_modules::sidecar::{BackgroundRecord, BackgroundRef};
    use crate::core_modules::state_store::{MemorySidecars, PerVideoStateStore};
    use assert_matches::assert_matches;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn arena() -> ArenaBox {
        ArenaBox::new(PixelPoint::new(0.0, 0.0), PixelPoint::new(100.0, 100.0))
    }

    fn fresh_background() -> BackgroundRecord {
        BackgroundRecord {
            reference: BackgroundRef::File("v.background.png".into()),
            n_frames: 20,
            frames_used: 20,
            quantile: 0.5,
            stale: false,
        }
    }

    #[test]
    fn empty_state_allows_arena_and_timing_only() {
        let steps = allowed_next_steps(&VideoState::default());
        assert_eq!(steps, BTreeSet::from([Step::Arena, Step::Timing]));
    }

    #[test]
    fn steps_unlock_as_state_fills_in() {
        let mut state = VideoState {
            arena: Some(arena()),
            ..VideoState::default()
        };
        assert!(allowed_next_steps(&state).contains(&Step::Regions));
        assert!(!allowed_next_steps(&state).contains(&Step::Background));

        state.timing = Some(TimingWindow::new(0.0, 5.0).unwrap());
        assert!(allowed_next_steps(&state).contains(&Step::Background));
        assert!(!allowed_next_steps(&state).contains(&Step::Colors));

        state.background = Some(fresh_background());
        let steps = allowed_next_steps(&state);
        assert!(steps.contains(&Step::Colors));
        assert!(steps.contains(&Step::Finalize));

        state.background.as_mut().unwrap().stale = true;
        let steps = allowed_next_steps(&state);
        assert!(!steps.contains(&Step::Colors));
        assert!(!steps.contains(&Step::Finalize));
    }

    #[test]
    fn tiny_arena_gates_regions() {
        let state = VideoState {
            arena: Some(ArenaBox::new(PixelPoint::new(0.0, 0.0), PixelPoint::new(5.0, 5.0))),
            ..VideoState::default()
        };
        assert!(!allowed_next_steps(&state).contains(&Step::Regions));
    }

    #[test]
    fn painting_toggles_cells_of_the_active_region() {
        let mut regions = RegionStore::new();
        regions.add("Food").unwrap();
        let mapper = GeometryMapper::new(&arena(), GridSize::new(4, 4)).unwrap();
        let mut session = EditorSession::new(MarkAssigner::default(), (100, 100));

        assert_matches!(
            session.paint(&mut regions, &mapper, PixelPoint::new(10.0, 10.0)),
            Err(PrepError::InvalidParameter(_))
        );
        assert_matches!(session.select_region(&regions, "water"), Err(PrepError::UnknownRegion(_)));

        session.select_region(&regions, "food").unwrap();
        assert_eq!(session.active_region(), Some("Food"));
        let painted = session.paint(&mut regions, &mapper, PixelPoint::new(30.0, 60.0)).unwrap();
        assert_eq!(painted, Some((Cell::new(2, 1), true)));
        let again = session.paint(&mut regions, &mapper, PixelPoint::new(30.0, 60.0)).unwrap();
        assert_eq!(again, Some((Cell::new(2, 1), false)));
        assert!(regions.get("Food").unwrap().cells.is_empty());
        assert_eq!(session.paint(&mut regions, &mapper, PixelPoint::new(150.0, 10.0)).unwrap(), None);

        regions.rename("Food", "Feeder").unwrap();
        session.region_renamed("food", "Feeder");
        assert_eq!(session.active_region(), Some("Feeder"));
    }

    /// 10x10 frame, label 1 in the left half, label 2 in the right half of row 5.
    fn frame() -> FrameMark {
        let mut data = vec![0u32; 100];
        for x in 0..10 {
            data[50 + x] = if x < 5 { 1 } else { 2 };
        }
        FrameMark::new(LabelMatrix::from_raw(10, 10, data).unwrap())
    }

    #[test]
    fn clicks_need_a_subject_and_a_frame() {
        let mut session = EditorSession::new(MarkAssigner::default(), (10, 10));
        assert_matches!(session.click(PixelPoint::new(2.0, 5.0)), Err(PrepError::InvalidParameter(_)));
        session.start_marking("R").unwrap();
        assert_matches!(session.click(PixelPoint::new(2.0, 5.0)), Err(PrepError::InvalidParameter(_)));
        assert_matches!(session.start_marking("  "), Err(PrepError::InvalidParameter(_)));

        session.open_frame("1.000".into(), frame());
        assert_matches!(session.click(PixelPoint::new(2.0, 5.0)).unwrap(), MarkUpdate::Assigned(_));
        let (_, record) = session.current_frame().unwrap();
        assert_eq!(record.mark_for("R").map(|m| m.label), Some(1));
    }

    #[test]
    fn dragging_moves_and_removes_marks() {
        let mut session = EditorSession::new(MarkAssigner::default(), (10, 10));
        session.start_marking("G").unwrap();
        session.open_frame("2.000".into(), frame());
        session.click(PixelPoint::new(1.0, 5.0)).unwrap();

        assert_eq!(session.begin_drag(PixelPoint::new(8.0, 8.0)), None);
        assert_eq!(session.begin_drag(PixelPoint::new(3.0, 5.0)), Some("G"));
        assert_matches!(session.end_drag(PixelPoint::new(8.0, 5.0)).unwrap(), MarkUpdate::Assigned(_));
        assert_eq!(session.current_frame().unwrap().1.marks[0].label, 2);
        assert_eq!(session.dragging(), None);

        session.begin_drag(PixelPoint::new(9.0, 5.0));
        assert_matches!(session.end_drag(PixelPoint::new(9.0, 0.0)).unwrap(), MarkUpdate::Removed(_));
        assert!(session.current_frame().unwrap().1.marks.is_empty());
        assert_eq!(session.end_drag(PixelPoint::new(1.0, 5.0)).unwrap(), MarkUpdate::Unchanged);
    }

    #[tokio::test]
    async fn only_changed_frames_are_submitted() {
        let store = Arc::new(PerVideoStateStore::new(Arc::new(MemorySidecars::new())));
        let writer = MarkWriter::new(
            store.clone(),
            Path::new("v.mp4"),
            MarkWriterConfig {
                debounce: Duration::from_secs(60),
                ..MarkWriterConfig::default()
            },
        );
        let mut session = EditorSession::new(MarkAssigner::default(), (10, 10));
        session.start_marking("B").unwrap();
        session.open_frame("3.000".into(), frame());
        assert!(!session.submit(&writer));

        session.click(PixelPoint::new(6.0, 5.0)).unwrap();
        assert!(session.submit(&writer));
        assert!(!session.submit(&writer));
        assert_eq!(writer.flush().await.unwrap(), 1);
        let stored = store.load(Path::new("v.mp4")).unwrap();
        assert_eq!(stored.frames["3.000"].marks[0].subject, "B");
    }
}
