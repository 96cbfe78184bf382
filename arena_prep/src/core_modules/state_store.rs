// THEORY:
// `PerVideoStateStore` is the sole owner of persisted per-video state. Every
// read and write of a video's sidecar goes through it, under a lock scoped to
// that video, so two writers never interleave a read-modify-write on the same
// document while different videos proceed in parallel.
//
// Writes are section merges. A `StatePatch` names only the sections it changes
// (arena, timing, background parameters, background, regions, frame marks,
// readiness); everything else in the stored document is carried over.
// Validation happens before the first byte is written, so a rejected patch
// leaves the stored state untouched.
//
// Derived-state rules enforced here:
// - changing the timing window marks an existing background stale; it is never
//   deleted and never recomputed implicitly
// - any change to arena, timing, background or regions clears `ready`
// - `finalize` checks its prerequisites, writes the export and sets `ready`
//   under one hold of the video's lock; the export lands before the flag
//
// A new background raster is first written to a staging sidecar and moved over
// the live one only after the document that describes it has been written, so
// a failed save never pairs the old record with new pixels.
//
// Loading never fails on a malformed document: the condition is logged and the
// defaults of the facility's active setup are returned instead.

use crate::core_modules::background::{BackgroundImage, BackgroundParams, TimingWindow};
use crate::core_modules::geometry::ArenaBox;
use crate::core_modules::image_helper::image_helper;
use crate::core_modules::marks::{FrameMark, FrameMarks};
use crate::core_modules::regions::RegionStore;
use crate::core_modules::setup::SetupCatalog;
use crate::core_modules::sidecar::{self, BackgroundRecord, BackgroundRef, VideoState};
use crate::error::{PrepError, Result};
use image::RgbaImage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The files kept next to a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SidecarKind {
    /// `X.preproc.json`, the working document.
    State,
    /// `X.background.png`.
    Background,
    /// `X.background.staged.png`, a raster waiting for its document write.
    StagedBackground,
    /// `X.arena.json`, written on finalize.
    Export,
}

impl SidecarKind {
    fn extension(&self) -> &'static str {
        match self {
            SidecarKind::State => "preproc.json",
            SidecarKind::Background => "background.png",
            SidecarKind::StagedBackground => "background.staged.png",
            SidecarKind::Export => "arena.json",
        }
    }
}

/// Path of a sidecar: the video's extension is replaced, so `X.mp4` maps to
/// `X.preproc.json`.
pub fn sidecar_path(video: &Path, kind: SidecarKind) -> PathBuf {
    video.with_extension(kind.extension())
}

/// Byte storage for sidecars.
pub trait SidecarBackend: Send + Sync {
    fn read(&self, video: &Path, kind: SidecarKind) -> Result<Option<Vec<u8>>>;
    fn write(&self, video: &Path, kind: SidecarKind, bytes: &[u8]) -> Result<()>;
    fn exists(&self, video: &Path, kind: SidecarKind) -> bool;

    /// Replaces sidecar `to` with sidecar `from`, atomically where the storage
    /// allows it.
    fn promote(&self, video: &Path, from: SidecarKind, to: SidecarKind) -> Result<()>;

    /// Reads a background by the reference stored in the document.
    fn read_reference(&self, video: &Path, reference: &str) -> Result<Option<Vec<u8>>>;
}

/// Sidecars as real files next to the video.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSidecars;

impl SidecarBackend for FileSidecars {
    fn read(&self, video: &Path, kind: SidecarKind) -> Result<Option<Vec<u8>>> {
        match std::fs::read(sidecar_path(video, kind)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, video: &Path, kind: SidecarKind, bytes: &[u8]) -> Result<()> {
        let path = sidecar_path(video, kind);
        // Write-then-rename so readers never observe a half-written document.
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, bytes)
            .and_then(|_| std::fs::rename(&staging, &path))
            .map_err(|e| PrepError::PersistFailure(format!("{}: {e}", path.display())))
    }

    fn exists(&self, video: &Path, kind: SidecarKind) -> bool {
        sidecar_path(video, kind).is_file()
    }

    fn promote(&self, video: &Path, from: SidecarKind, to: SidecarKind) -> Result<()> {
        let target = sidecar_path(video, to);
        std::fs::rename(sidecar_path(video, from), &target)
            .map_err(|e| PrepError::PersistFailure(format!("{}: {e}", target.display())))
    }

    fn read_reference(&self, video: &Path, reference: &str) -> Result<Option<Vec<u8>>> {
        let referenced = Path::new(reference);
        let path = if referenced.is_absolute() {
            referenced.to_path_buf()
        } else {
            video.parent().unwrap_or(Path::new("")).join(referenced)
        };
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory sidecars, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySidecars {
    files: Mutex<HashMap<(PathBuf, SidecarKind), Vec<u8>>>,
    failing: Mutex<Vec<(PathBuf, Option<SidecarKind>)>>,
    writes: Mutex<usize>,
}

impl MemorySidecars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write for `video` fail with `PersistFailure`.
    pub fn fail_writes_for(&self, video: &Path) {
        self.failing.lock().push((video.to_path_buf(), None));
    }

    /// Makes writes of one sidecar kind of `video` fail.
    pub fn fail_writes_of(&self, video: &Path, kind: SidecarKind) {
        self.failing.lock().push((video.to_path_buf(), Some(kind)));
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    fn rejects(&self, video: &Path, kind: SidecarKind) -> Result<()> {
        let rejected = self
            .failing
            .lock()
            .iter()
            .any(|(failing, only)| failing == video && only.is_none_or(|k| k == kind));
        if rejected {
            return Err(PrepError::PersistFailure(format!("write rejected for {}", video.display())));
        }
        Ok(())
    }

    /// Seeds raw bytes, e.g. a hand-written legacy document.
    pub fn insert(&self, video: &Path, kind: SidecarKind, bytes: Vec<u8>) {
        self.files.lock().insert((video.to_path_buf(), kind), bytes);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

impl SidecarBackend for MemorySidecars {
    fn read(&self, video: &Path, kind: SidecarKind) -> Result<Option<Vec<u8>>> {
        Ok(self.files.lock().get(&(video.to_path_buf(), kind)).cloned())
    }

    fn write(&self, video: &Path, kind: SidecarKind, bytes: &[u8]) -> Result<()> {
        self.rejects(video, kind)?;
        self.files.lock().insert((video.to_path_buf(), kind), bytes.to_vec());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn exists(&self, video: &Path, kind: SidecarKind) -> bool {
        self.files.lock().contains_key(&(video.to_path_buf(), kind))
    }

    fn promote(&self, video: &Path, from: SidecarKind, to: SidecarKind) -> Result<()> {
        self.rejects(video, to)?;
        let mut files = self.files.lock();
        let bytes = files
            .remove(&(video.to_path_buf(), from))
            .ok_or_else(|| PrepError::PersistFailure(format!("nothing staged for {}", video.display())))?;
        files.insert((video.to_path_buf(), to), bytes);
        Ok(())
    }

    fn read_reference(&self, video: &Path, _reference: &str) -> Result<Option<Vec<u8>>> {
        self.read(video, SidecarKind::Background)
    }
}

/// Sections to merge into a video's stored state. `None` leaves a section as is.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub arena: Option<ArenaBox>,
    pub timing: Option<TimingWindow>,
    pub bg_params: Option<BackgroundParams>,
    pub background: Option<BackgroundImage>,
    pub regions: Option<RegionStore>,
    /// Frames to insert or replace, keyed by frame key.
    pub frames: Option<FrameMarks>,
    pub ready: Option<bool>,
}

impl StatePatch {
    pub fn arena(arena: ArenaBox) -> Self {
        Self {
            arena: Some(arena),
            ..Self::default()
        }
    }

    pub fn timing(timing: TimingWindow) -> Self {
        Self {
            timing: Some(timing),
            ..Self::default()
        }
    }

    pub fn background(background: BackgroundImage) -> Self {
        Self {
            background: Some(background),
            ..Self::default()
        }
    }

    pub fn regions(regions: RegionStore) -> Self {
        Self {
            regions: Some(regions),
            ..Self::default()
        }
    }

    pub fn frame(key: String, frame: FrameMark) -> Self {
        Self {
            frames: Some(FrameMarks::from([(key, frame)])),
            ..Self::default()
        }
    }
}

pub struct PerVideoStateStore {
    backend: Arc<dyn SidecarBackend>,
    catalog: Option<Arc<SetupCatalog>>,
    facility: Option<String>,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PerVideoStateStore {
    pub fn new(backend: Arc<dyn SidecarBackend>) -> Self {
        Self {
            backend,
            catalog: None,
            facility: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds new videos from the active setup of `facility`.
    pub fn with_catalog(mut self, catalog: Arc<SetupCatalog>, facility: impl Into<String>) -> Self {
        self.catalog = Some(catalog);
        self.facility = Some(facility.into());
        self
    }

    pub fn backend(&self) -> &dyn SidecarBackend {
        self.backend.as_ref()
    }

    fn lock_for(&self, video: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        // Entries only the map still references belong to idle videos.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(video.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// State for a video that has none yet.
    pub fn defaults(&self) -> VideoState {
        let mut state = VideoState {
            facility: self.facility.clone(),
            ..VideoState::default()
        };
        let setup = match (&self.catalog, &self.facility) {
            (Some(catalog), Some(facility)) => catalog.active_setup(facility),
            _ => None,
        };
        if let Some(setup) = setup {
            state.setup = Some(setup.name.clone());
            state.bg_params = setup.background_params();
            state.regions = RegionStore::from_regions(setup.regions.clone());
            state.arena = setup.arena.clone().map(|mut arena| {
                setup.apply_to_arena(&mut arena);
                arena
            });
        }
        state
    }

    pub fn load(&self, video: &Path) -> Result<VideoState> {
        let lock = self.lock_for(video);
        let _guard = lock.lock();
        self.load_unlocked(video)
    }

    fn load_unlocked(&self, video: &Path) -> Result<VideoState> {
        let Some(bytes) = self.backend.read(video, SidecarKind::State)? else {
            return Ok(self.defaults());
        };
        match sidecar::decode(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(video = %video.display(), error = %e, "Corrupt sidecar, falling back to defaults");
                Ok(self.defaults())
            }
        }
    }

    /// Merges `patch` into the stored state and returns the result.
    pub fn save(&self, video: &Path, patch: StatePatch) -> Result<VideoState> {
        if let Some(arena) = &patch.arena {
            arena.validate()?;
        }
        if let Some(timing) = &patch.timing {
            timing.validate()?;
        }
        if let Some(params) = &patch.bg_params {
            params.validate()?;
        }

        let lock = self.lock_for(video);
        let _guard = lock.lock();
        let mut state = self.load_unlocked(video)?;
        let mut derived_changed = false;

        if let Some(arena) = patch.arena {
            derived_changed |= state.arena.as_ref() != Some(&arena);
            state.arena = Some(arena);
        }
        if let Some(timing) = patch.timing {
            if state.timing != Some(timing) {
                derived_changed = true;
                if let Some(background) = state.background.as_mut() {
                    background.stale = true;
                }
            }
            state.timing = Some(timing);
        }
        if let Some(params) = patch.bg_params {
            state.bg_params = params;
        }
        let staged = patch.background.is_some();
        if let Some(background) = patch.background {
            let png = image_helper::encode_png(&background.raster)?;
            self.backend.write(video, SidecarKind::StagedBackground, &png)?;
            state.bg_params = background.params;
            state.background = Some(BackgroundRecord {
                reference: BackgroundRef::File(file_name(&sidecar_path(video, SidecarKind::Background))),
                n_frames: background.params.n_frames,
                frames_used: background.frames_used,
                quantile: background.params.quantile,
                stale: false,
            });
            derived_changed = true;
        }
        if let Some(regions) = patch.regions {
            derived_changed |= state.regions != regions;
            state.regions = regions;
        }
        if let Some(frames) = patch.frames {
            state.frames.extend(frames);
        }
        if derived_changed {
            state.ready = false;
        }
        if let Some(ready) = patch.ready {
            state.ready = ready;
        }

        self.backend.write(video, SidecarKind::State, &sidecar::encode(&state)?)?;
        if staged {
            self.backend
                .promote(video, SidecarKind::StagedBackground, SidecarKind::Background)
                .inspect_err(|e| {
                    tracing::error!(video = %video.display(), error = %e, "Background raster not committed after state write");
                })?;
        }
        tracing::debug!(video = %video.display(), ready = state.ready, "State saved");
        Ok(state)
    }

    /// Marks the video ready and writes the export. Requires a valid arena, a
    /// timing window and a fresh background.
    pub fn finalize(&self, video: &Path) -> Result<VideoState> {
        let lock = self.lock_for(video);
        let _guard = lock.lock();
        let mut state = self.load_unlocked(video)?;
        if !state.has_valid_arena() {
            return Err(PrepError::InvalidParameter("cannot finalize without a valid arena".into()));
        }
        if state.timing.is_none() {
            return Err(PrepError::InvalidParameter("cannot finalize without a timing window".into()));
        }
        if !state.has_fresh_background() {
            return Err(PrepError::InvalidParameter("cannot finalize without a fresh background".into()));
        }
        state.ready = true;
        self.backend
            .write(video, SidecarKind::Export, &sidecar::encode_export(&state)?)?;
        self.backend.write(video, SidecarKind::State, &sidecar::encode(&state)?)?;
        tracing::info!(video = %video.display(), "Video finalized");
        Ok(state)
    }

    /// Decodes the stored background raster, if there is one.
    pub fn load_background(&self, video: &Path, state: &VideoState) -> Result<Option<RgbaImage>> {
        let Some(record) = &state.background else {
            return Ok(None);
        };
        let bytes = match &record.reference {
            BackgroundRef::Inline(url) => Some(image_helper::decode_data_url(url)?),
            BackgroundRef::File(reference) => self.backend.read_reference(video, reference)?,
        };
        bytes.map(|bytes| image_helper::decode_png(&bytes)).transpose()
    }

    /// Whether the working document, export and background exist for `video`.
    pub fn presence(&self, video: &Path) -> (bool, bool, bool) {
        (
            self.backend.exists(video, SidecarKind::State),
            self.backend.exists(video, SidecarKind::Export),
            self.backend.exists(video, SidecarKind::Background),
        )
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::geometry::{Cell, PixelPoint};
    use crate::core_modules::labeling::LabelMatrix;
    use assert_matches::assert_matches;
    use image::Rgba;

    fn arena() -> ArenaBox {
        ArenaBox::new(PixelPoint::new(10.0, 10.0), PixelPoint::new(110.0, 90.0))
    }

    fn background() -> BackgroundImage {
        BackgroundImage {
            raster: RgbaImage::from_pixel(4, 3, Rgba([90, 90, 90, 255])),
            params: BackgroundParams {
                n_frames: 12,
                quantile: 0.5,
            },
            frames_used: 12,
            sample_times: Vec::new(),
        }
    }

    fn memory_store() -> (Arc<MemorySidecars>, PerVideoStateStore) {
        let backend = Arc::new(MemorySidecars::new());
        let store = PerVideoStateStore::new(backend.clone());
        (backend, store)
    }

    #[test]
    fn sidecar_paths_replace_the_video_extension() {
        let video = Path::new("/data/g.exp0001.day02.cam01.mp4");
        assert_eq!(
            sidecar_path(video, SidecarKind::State),
            PathBuf::from("/data/g.exp0001.day02.cam01.preproc.json")
        );
        assert_eq!(
            sidecar_path(video, SidecarKind::Export),
            PathBuf::from("/data/g.exp0001.day02.cam01.arena.json")
        );
    }

    #[test]
    fn sections_not_in_a_patch_are_kept() {
        let (_, store) = memory_store();
        let video = Path::new("v.mp4");
        store.save(video, StatePatch::arena(arena())).unwrap();
        store
            .save(video, StatePatch::timing(TimingWindow::new(1.0, 5.0).unwrap()))
            .unwrap();
        let state = store.load(video).unwrap();
        assert_eq!(state.arena, Some(arena()));
        assert_eq!(state.timing.map(|t| t.end_time), Some(5.0));
    }

    #[test]
    fn invalid_patches_write_nothing() {
        let (backend, store) = memory_store();
        let video = Path::new("v.mp4");
        let tiny = ArenaBox::new(PixelPoint::new(0.0, 0.0), PixelPoint::new(5.0, 5.0));
        assert_matches!(store.save(video, StatePatch::arena(tiny)), Err(PrepError::InvalidArena { .. }));
        let bad_window = TimingWindow {
            start_time: 4.0,
            end_time: 2.0,
        };
        assert_matches!(
            store.save(video, StatePatch::timing(bad_window)),
            Err(PrepError::InvalidWindow { .. })
        );
        assert_eq!(backend.write_count(), 0);
    }

    #[test]
    fn timing_change_marks_background_stale() {
        let (_, store) = memory_store();
        let video = Path::new("v.mp4");
        store
            .save(video, StatePatch::timing(TimingWindow::new(0.0, 5.0).unwrap()))
            .unwrap();
        let state = store.save(video, StatePatch::background(background())).unwrap();
        assert!(state.has_fresh_background());

        let same = store
            .save(video, StatePatch::timing(TimingWindow::new(0.0, 5.0).unwrap()))
            .unwrap();
        assert!(same.has_fresh_background());

        let moved = store
            .save(video, StatePatch::timing(TimingWindow::new(1.0, 5.0).unwrap()))
            .unwrap();
        assert!(moved.background.is_some());
        assert!(!moved.has_fresh_background());
    }

    #[test]
    fn background_is_persisted_and_reloadable() {
        let (_, store) = memory_store();
        let video = Path::new("/videos/cage.mp4");
        let state = store.save(video, StatePatch::background(background())).unwrap();
        assert_eq!(
            state.background.as_ref().map(|b| b.reference.clone()),
            Some(BackgroundRef::File("cage.background.png".into()))
        );
        let raster = store.load_background(video, &state).unwrap().unwrap();
        assert_eq!(raster, background().raster);
    }

    #[test]
    fn corrupt_sidecar_loads_defaults() {
        let (backend, store) = memory_store();
        let video = Path::new("v.mp4");
        backend.insert(video, SidecarKind::State, b"{ not json".to_vec());
        let state = store.load(video).unwrap();
        assert_eq!(state, store.defaults());
    }

    #[test]
    fn defaults_come_from_the_active_setup() {
        let catalog = SetupCatalog::from_json(
            r#"{"facilities": {"lab": {"setups": {"default": {
                "preproc": {"bg_frames": 33, "bg_quantile": 0.7, "grid_cols": 6, "grid_rows": 4},
                "arena": {"tl": {"x": 0, "y": 0}, "br": {"x": 60, "y": 40}},
                "items": [{"name": "food", "cells": [[1, 1]]}]
            }}}}}"#,
        )
        .unwrap();
        let store = PerVideoStateStore::new(Arc::new(MemorySidecars::new())).with_catalog(Arc::new(catalog), "lab");
        let state = store.load(Path::new("new.mp4")).unwrap();
        assert_eq!(state.bg_params, BackgroundParams { n_frames: 33, quantile: 0.7 });
        assert_eq!(state.arena.and_then(|a| a.grid()).map(|g| (g.cols, g.rows)), Some((6, 4)));
        assert!(state.regions.get("food").unwrap().cells.contains(&Cell::new(1, 1)));
        assert_eq!(state.setup.as_deref(), Some("default"));
    }

    #[test]
    fn finalize_requires_prerequisites_and_writes_export() {
        let (backend, store) = memory_store();
        let video = Path::new("v.mp4");
        assert_matches!(store.finalize(video), Err(PrepError::InvalidParameter(_)));

        store.save(video, StatePatch::arena(arena())).unwrap();
        store
            .save(video, StatePatch::timing(TimingWindow::new(0.0, 5.0).unwrap()))
            .unwrap();
        store.save(video, StatePatch::background(background())).unwrap();
        let state = store.finalize(video).unwrap();
        assert!(state.ready);
        assert!(backend.exists(video, SidecarKind::Export));

        let edited = store.save(video, StatePatch::regions(RegionStore::new())).unwrap();
        assert!(edited.ready, "unchanged regions keep readiness");
        let mut regions = RegionStore::new();
        regions.add("Nest").unwrap();
        assert!(!store.save(video, StatePatch::regions(regions)).unwrap().ready);
    }

    #[test]
    fn frames_merge_per_key() {
        let (_, store) = memory_store();
        let video = Path::new("v.mp4");
        let frame = FrameMark::new(LabelMatrix::new(2, 2));
        store.save(video, StatePatch::frame("1.000".into(), frame.clone())).unwrap();
        store.save(video, StatePatch::frame("2.000".into(), frame)).unwrap();
        assert_eq!(store.load(video).unwrap().frames.len(), 2);
    }

    #[test]
    fn rejected_writes_surface_as_persist_failures() {
        let (backend, store) = memory_store();
        let video = Path::new("v.mp4");
        backend.fail_writes_for(video);
        assert_matches!(store.save(video, StatePatch::arena(arena())), Err(PrepError::PersistFailure(_)));
    }

    #[test]
    fn failed_state_write_keeps_the_previous_background() {
        let (backend, store) = memory_store();
        let video = Path::new("v.mp4");
        store.save(video, StatePatch::background(background())).unwrap();

        backend.fail_writes_of(video, SidecarKind::State);
        let replacement = BackgroundImage {
            raster: RgbaImage::from_pixel(4, 3, Rgba([200, 10, 10, 255])),
            params: BackgroundParams {
                n_frames: 40,
                quantile: 0.9,
            },
            frames_used: 40,
            sample_times: Vec::new(),
        };
        assert_matches!(
            store.save(video, StatePatch::background(replacement)),
            Err(PrepError::PersistFailure(_))
        );

        let state = store.load(video).unwrap();
        assert_eq!(state.background.as_ref().map(|b| b.n_frames), Some(12));
        assert_eq!(store.load_background(video, &state).unwrap().unwrap(), background().raster);
    }

    #[test]
    fn failed_export_leaves_the_video_unready() {
        let (backend, store) = memory_store();
        let video = Path::new("v.mp4");
        store.save(video, StatePatch::arena(arena())).unwrap();
        store
            .save(video, StatePatch::timing(TimingWindow::new(0.0, 5.0).unwrap()))
            .unwrap();
        store.save(video, StatePatch::background(background())).unwrap();

        backend.fail_writes_of(video, SidecarKind::Export);
        assert_matches!(store.finalize(video), Err(PrepError::PersistFailure(_)));
        assert!(!store.load(video).unwrap().ready);

        backend.clear_failures();
        assert!(store.finalize(video).unwrap().ready);
        assert!(backend.exists(video, SidecarKind::Export));
    }

    #[test]
    fn stale_background_blocks_finalize() {
        let (_, store) = memory_store();
        let video = Path::new("v.mp4");
        store.save(video, StatePatch::arena(arena())).unwrap();
        store
            .save(video, StatePatch::timing(TimingWindow::new(0.0, 5.0).unwrap()))
            .unwrap();
        store.save(video, StatePatch::background(background())).unwrap();
        store
            .save(video, StatePatch::timing(TimingWindow::new(0.5, 5.0).unwrap()))
            .unwrap();
        assert_matches!(store.finalize(video), Err(PrepError::InvalidParameter(_)));
    }

    #[test]
    fn concurrent_timing_edits_never_leave_a_stale_video_ready() {
        let (_, store) = memory_store();
        let store = Arc::new(store);
        let video = Path::new("v.mp4");
        store.save(video, StatePatch::arena(arena())).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for round in 0..20 {
                        let video = Path::new("v.mp4");
                        if i % 2 == 0 {
                            let start = (i * 20 + round) as f64 * 0.01;
                            let _ = store.save(video, StatePatch::timing(TimingWindow::new(start, 5.0).unwrap()));
                            let _ = store.save(video, StatePatch::background(background()));
                        } else {
                            let _ = store.finalize(video);
                        }
                        let state = store.load(video).unwrap();
                        assert!(!state.ready || state.has_fresh_background());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn idle_video_locks_are_released() {
        let (_, store) = memory_store();
        for day in 0..50 {
            store.load(Path::new(&format!("cage.day{day}.mp4"))).unwrap();
        }
        assert!(store.locks.lock().len() <= 1);
    }

    #[test]
    fn file_backend_writes_next_to_the_video() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("cage.day01.mp4");
        let store = PerVideoStateStore::new(Arc::new(FileSidecars));
        store.save(&video, StatePatch::background(background())).unwrap();
        assert!(dir.path().join("cage.day01.preproc.json").is_file());
        assert!(dir.path().join("cage.day01.background.png").is_file());
        assert!(!dir.path().join("cage.day01.background.staged.png").exists());
        assert_eq!(store.presence(&video), (true, false, true));
        let state = store.load(&video).unwrap();
        assert_eq!(store.load_background(&video, &state).unwrap().unwrap().dimensions(), (4, 3));
    }
}
