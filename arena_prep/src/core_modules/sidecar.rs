// THEORY:
// The sidecar adapter is the only place that knows what a persisted document
// looks like. Everything above it works on `VideoState`, the canonical
// in-memory model; everything below it moves opaque bytes.
//
// Writing always produces the current (version 2) layout. Reading accepts the
// current layout and the historical drift seen in older files, normalizing it
// once:
// - `regions` instead of `roi`
// - `roi` as a bare list, as `{items: [...]}`, or as a name -> region map
// - cells as `[row, col]` pairs or `{"r": row, "c": col}` objects
// - `background` as an object, a bare path string, or a data-URL
// - timing under `meta`, under `timing`, or at the top level
// - a missing region `type`, which is inferred from the name
// - `bg_quantile` written as a percent (50) rather than a fraction (0.5)
// Unknown keys are ignored. A section that is present but unusable is dropped
// with a warning; a document that is not a JSON object is corrupt.

use crate::core_modules::background::{BackgroundParams, TimingWindow};
use crate::core_modules::geometry::{ArenaBox, Cell};
use crate::core_modules::image_helper::image_helper;
use crate::core_modules::marks::{FrameMark, FrameMarks};
use crate::core_modules::regions::{infer_region_type, Region, RegionStore, RegionType};
use crate::error::{PrepError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub const SIDECAR_VERSION: u32 = 2;

/// Where a background raster lives.
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundRef {
    /// A file name next to the video (or an absolute path).
    File(String),
    /// A `data:image/png;base64,...` URL embedded in the document.
    Inline(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundRecord {
    pub reference: BackgroundRef,
    pub n_frames: u32,
    pub frames_used: usize,
    pub quantile: f64,
    /// Set when the timing window changed after estimation.
    pub stale: bool,
}

/// The canonical per-video state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VideoState {
    pub arena: Option<ArenaBox>,
    pub timing: Option<TimingWindow>,
    pub bg_params: BackgroundParams,
    pub background: Option<BackgroundRecord>,
    pub regions: RegionStore,
    pub frames: FrameMarks,
    pub ready: bool,
    pub facility: Option<String>,
    pub setup: Option<String>,
}

impl VideoState {
    pub fn has_valid_arena(&self) -> bool {
        self.arena.as_ref().is_some_and(ArenaBox::is_valid)
    }

    pub fn has_fresh_background(&self) -> bool {
        self.background.as_ref().is_some_and(|b| !b.stale)
    }
}

#[derive(Serialize)]
struct Document<'a> {
    version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    arena: Option<&'a ArenaBox>,
    meta: Meta<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    background: Option<BackgroundSection<'a>>,
    roi: RoiSection<'a>,
    colors: ColorsSection<'a>,
}

#[derive(Serialize)]
struct Meta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<f64>,
    bg_frames: u32,
    bg_quantile: f64,
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    facility: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<&'a str>,
}

#[derive(Serialize)]
struct BackgroundSection<'a> {
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    reference: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline: Option<&'a str>,
    n_frames: u32,
    frames_used: usize,
    quantile: f64,
    stale: bool,
}

#[derive(Serialize)]
struct RoiSection<'a> {
    items: &'a RegionStore,
}

#[derive(Serialize)]
struct ColorsSection<'a> {
    frames: &'a FrameMarks,
}

fn meta(state: &VideoState) -> Meta<'_> {
    Meta {
        start_time: state.timing.map(|t| t.start_time),
        end_time: state.timing.map(|t| t.end_time),
        bg_frames: state.bg_params.n_frames,
        bg_quantile: state.bg_params.quantile,
        ready: state.ready,
        facility: state.facility.as_deref(),
        setup: state.setup.as_deref(),
    }
}

/// Serializes the working document.
pub fn encode(state: &VideoState) -> Result<Vec<u8>> {
    let background = state.background.as_ref().map(|b| {
        let (reference, inline) = match &b.reference {
            BackgroundRef::File(path) => (Some(path.as_str()), None),
            BackgroundRef::Inline(url) => (None, Some(url.as_str())),
        };
        BackgroundSection {
            reference,
            inline,
            n_frames: b.n_frames,
            frames_used: b.frames_used,
            quantile: b.quantile,
            stale: b.stale,
        }
    });
    let document = Document {
        version: SIDECAR_VERSION,
        arena: state.arena.as_ref(),
        meta: meta(state),
        background,
        roi: RoiSection { items: &state.regions },
        colors: ColorsSection { frames: &state.frames },
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

/// Serializes the finalized export written next to the video.
pub fn encode_export(state: &VideoState) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Export<'a> {
        version: u32,
        arena: Option<&'a ArenaBox>,
        roi: RoiSection<'a>,
        meta: Meta<'a>,
    }
    Ok(serde_json::to_vec_pretty(&Export {
        version: SIDECAR_VERSION,
        arena: state.arena.as_ref(),
        roi: RoiSection { items: &state.regions },
        meta: meta(state),
    })?)
}

pub fn decode(bytes: &[u8]) -> Result<VideoState> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| PrepError::CorruptSidecar(format!("not valid JSON: {e}")))?;
    decode_value(&value)
}

/// Normalizes any supported document shape into a `VideoState`.
pub fn decode_value(value: &Value) -> Result<VideoState> {
    let root = value
        .as_object()
        .ok_or_else(|| PrepError::CorruptSidecar("document is not a JSON object".into()))?;
    let meta = root.get("meta").and_then(Value::as_object);
    let mut state = VideoState::default();

    if let Some(arena) = root.get("arena").filter(|v| !v.is_null()) {
        match serde_json::from_value::<ArenaBox>(arena.clone()) {
            Ok(arena) => state.arena = Some(arena),
            Err(e) => tracing::warn!(error = %e, "Dropping unreadable arena section"),
        }
    }

    state.timing = read_timing(root, meta);

    let background = root.get("background");
    let bg_object = background.and_then(Value::as_object);
    let n_frames = meta
        .and_then(|m| m.get("bg_frames"))
        .or_else(|| bg_object.and_then(|b| b.get("n_frames")))
        .and_then(as_u32)
        .filter(|&n| n > 0);
    let quantile = meta
        .and_then(|m| m.get("bg_quantile"))
        .or_else(|| bg_object.and_then(|b| b.get("quantile")))
        .and_then(as_f64)
        .and_then(normalize_quantile);
    let defaults = BackgroundParams::default();
    state.bg_params = BackgroundParams {
        n_frames: n_frames.unwrap_or(defaults.n_frames),
        quantile: quantile.unwrap_or(defaults.quantile),
    };
    state.background = background.and_then(|b| read_background(b, &state.bg_params));

    let roi = root.get("roi").or_else(|| root.get("regions"));
    if let Some(roi) = roi {
        state.regions = RegionStore::from_regions(read_regions(roi));
    }

    let colors = root.get("colors").and_then(Value::as_object);
    if let Some(frames) = colors.and_then(|c| c.get("frames")).and_then(Value::as_object) {
        for (key, frame) in frames {
            match serde_json::from_value::<FrameMark>(frame.clone()) {
                Ok(frame) => {
                    state.frames.insert(key.clone(), frame);
                }
                Err(e) => tracing::warn!(frame = %key, error = %e, "Dropping unreadable frame marks"),
            }
        }
    }
    // Flat per-subject color samples (`colors.marks` + `colors.mice`) carry no
    // label matrix and cannot be placed on a frame.
    let samples = colors
        .and_then(|c| c.get("marks"))
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    if samples > 0 {
        let subjects = colors
            .and_then(|c| c.get("mice"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        tracing::warn!(samples, subjects, "Skipping legacy color samples without label matrices");
    }

    state.ready = meta
        .and_then(|m| m.get("ready"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    state.facility = meta.and_then(|m| m.get("facility")).and_then(as_string);
    state.setup = meta.and_then(|m| m.get("setup")).and_then(as_string);
    Ok(state)
}

fn read_timing(root: &Map<String, Value>, meta: Option<&Map<String, Value>>) -> Option<TimingWindow> {
    let pick = |object: &Map<String, Value>| {
        let start = object.get("start_time").or_else(|| object.get("start")).and_then(as_f64)?;
        let end = object.get("end_time").or_else(|| object.get("end")).and_then(as_f64)?;
        Some((start, end))
    };
    let (start, end) = meta
        .and_then(pick)
        .or_else(|| root.get("timing").and_then(Value::as_object).and_then(pick))
        .or_else(|| pick(root))?;
    match TimingWindow::new(start, end) {
        Ok(window) => Some(window),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping unusable timing window");
            None
        }
    }
}

fn read_background(value: &Value, params: &BackgroundParams) -> Option<BackgroundRecord> {
    let reference_from = |text: &str| {
        if image_helper::is_data_url(text) {
            BackgroundRef::Inline(text.to_string())
        } else {
            BackgroundRef::File(text.to_string())
        }
    };
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(BackgroundRecord {
            reference: reference_from(text),
            n_frames: params.n_frames,
            frames_used: params.n_frames as usize,
            quantile: params.quantile,
            stale: false,
        }),
        Value::Object(object) => {
            let reference = object
                .get("inline")
                .and_then(Value::as_str)
                .map(|url| BackgroundRef::Inline(url.to_string()))
                .or_else(|| {
                    object
                        .get("ref")
                        .or_else(|| object.get("path"))
                        .and_then(Value::as_str)
                        .map(reference_from)
                })?;
            Some(BackgroundRecord {
                reference,
                n_frames: object
                    .get("n_frames")
                    .and_then(as_u32)
                    .filter(|&n| n > 0)
                    .unwrap_or(params.n_frames),
                frames_used: object
                    .get("frames_used")
                    .and_then(as_u32)
                    .map_or(params.n_frames as usize, |n| n as usize),
                quantile: object
                    .get("quantile")
                    .and_then(as_f64)
                    .and_then(normalize_quantile)
                    .unwrap_or(params.quantile),
                stale: object.get("stale").and_then(Value::as_bool).unwrap_or(false),
            })
        }
        _ => None,
    }
}

fn read_regions(value: &Value) -> Vec<Region> {
    match value {
        Value::Array(items) => items.iter().filter_map(|item| region_from_value(item, None)).collect(),
        Value::Object(object) => match object.get("items") {
            Some(items) => read_regions(items),
            None => object
                .iter()
                .filter_map(|(name, item)| region_from_value(item, Some(name)))
                .collect(),
        },
        _ => Vec::new(),
    }
}

/// Lenient region parser shared with the setup catalog.
pub(crate) fn region_from_value(value: &Value, fallback_name: Option<&str>) -> Option<Region> {
    let object = value.as_object()?;
    let name = object
        .get("name")
        .and_then(Value::as_str)
        .or(fallback_name)?
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }
    let explicit_type = object
        .get("type")
        .and_then(|t| serde_json::from_value::<RegionType>(Value::String(t.as_str()?.to_lowercase())).ok());
    let cells: BTreeSet<Cell> = object
        .get("cells")
        .and_then(Value::as_array)
        .map(|cells| cells.iter().filter_map(cell_from_value).collect())
        .unwrap_or_default();
    Some(Region {
        kind: explicit_type.unwrap_or_else(|| infer_region_type(&name)),
        type_locked: object.get("type_locked").and_then(Value::as_bool).unwrap_or(false),
        enabled: object.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        sheltered: object.get("sheltered").and_then(Value::as_bool).unwrap_or(false),
        name,
        cells,
    })
}

fn cell_from_value(value: &Value) -> Option<Cell> {
    match value {
        Value::Array(pair) if pair.len() >= 2 => Some(Cell::new(as_i32(&pair[0])?, as_i32(&pair[1])?)),
        Value::Object(object) => Some(Cell::new(
            as_i32(object.get("r").or_else(|| object.get("row"))?)?,
            as_i32(object.get("c").or_else(|| object.get("col"))?)?,
        )),
        _ => None,
    }
}

/// A quantile written as a percent (e.g. 50) becomes a fraction.
pub(crate) fn normalize_quantile(value: f64) -> Option<f64> {
    match value {
        v if (0.0..=1.0).contains(&v) => Some(v),
        v if v > 1.0 && v <= 100.0 => Some(v / 100.0),
        _ => None,
    }
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_u32(value: &Value) -> Option<u32> {
    as_f64(value).filter(|v| *v >= 0.0 && *v <= u32::MAX as f64).map(|v| v.round() as u32)
}

fn as_i32(value: &Value) -> Option<i32> {
    as_f64(value).filter(|v| v.is_finite()).map(|v| v as i32)
}

pub(crate) fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::geometry::PixelPoint;
    use crate::core_modules::labeling::{Centroid, LabelMatrix};
    use crate::core_modules::marks::{frame_key, Mark};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sample_state() -> VideoState {
        let mut regions = RegionStore::new();
        regions.add("Nest").unwrap();
        regions.toggle_cell("Nest", Cell::new(1, 2)).unwrap();
        let mut frame = FrameMark::new(LabelMatrix::from_raw(2, 2, vec![0, 1, 1, 0]).unwrap());
        frame.marks.push(Mark {
            subject: "R".into(),
            label: 1,
            centroid: Centroid { row: 0.5, col: 0.5 },
        });
        let mut frames = FrameMarks::new();
        frames.insert(frame_key(3.25), frame);

        let mut arena = ArenaBox::new(PixelPoint::new(10.0, 20.0), PixelPoint::new(210.0, 170.0));
        arena.grid_cols = Some(8);
        arena.grid_rows = Some(6);
        VideoState {
            arena: Some(arena),
            timing: Some(TimingWindow::new(1.0, 9.5).unwrap()),
            bg_params: BackgroundParams {
                n_frames: 30,
                quantile: 0.6,
            },
            background: Some(BackgroundRecord {
                reference: BackgroundRef::File("cage.day01.background.png".into()),
                n_frames: 30,
                frames_used: 29,
                quantile: 0.6,
                stale: false,
            }),
            regions,
            frames,
            ready: true,
            facility: Some("lab".into()),
            setup: Some("default".into()),
        }
    }

    #[test]
    fn canonical_document_has_the_documented_layout() {
        let value: Value = serde_json::from_slice(&encode(&sample_state()).unwrap()).unwrap();
        assert_eq!(value["version"], json!(2));
        assert_eq!(value["meta"]["start_time"], json!(1.0));
        assert_eq!(value["meta"]["bg_quantile"], json!(0.6));
        assert_eq!(value["background"]["ref"], json!("cage.day01.background.png"));
        assert_eq!(value["roi"]["items"][0]["cells"], json!([[1, 2]]));
        assert_eq!(value["colors"]["frames"]["3.250"]["marks"][0]["subject"], json!("R"));
        assert_eq!(value["colors"]["frames"]["3.250"]["labels"]["runs"], json!([[0, 1], [1, 2], [0, 1]]));
    }

    #[test]
    fn canonical_document_decodes_to_the_same_state() {
        let state = sample_state();
        assert_eq!(decode(&encode(&state).unwrap()).unwrap(), state);
    }

    #[test]
    fn legacy_shapes_are_normalized() {
        let legacy = json!({
            "arena": {"tl": {"x": 0, "y": 0}, "br": {"x": 100, "y": 80}},
            "start_time": 2.0,
            "end_time": 8.0,
            "background": "data:image/png;base64,AAAA",
            "regions": {
                "Water bottle": {"enabled": false, "cells": [{"r": 0, "c": 1}, [2, 3]]},
                "Corner": {"type": "Wall", "cells": []}
            },
            "meta": {"bg_frames": "25", "bg_quantile": 50},
            "extra": "ignored"
        });
        let state = decode_value(&legacy).unwrap();
        assert_eq!(state.timing, Some(TimingWindow::new(2.0, 8.0).unwrap()));
        assert_eq!(state.bg_params, BackgroundParams { n_frames: 25, quantile: 0.5 });
        assert_matches!(state.background.unwrap().reference, BackgroundRef::Inline(_));
        let water = state.regions.get("water bottle").unwrap();
        assert_eq!(water.kind, RegionType::Water);
        assert!(!water.enabled);
        assert_eq!(water.cells.len(), 2);
        assert_eq!(state.regions.get("Corner").unwrap().kind, RegionType::Wall);
    }

    #[test]
    fn timing_section_and_bare_path_background() {
        let legacy = json!({
            "timing": {"start": 0.5, "end": 4},
            "background": "/data/cage.background.png",
            "roi": [{"name": "food", "cells": [[0, 0]]}]
        });
        let state = decode_value(&legacy).unwrap();
        assert_eq!(state.timing.map(|t| t.end_time), Some(4.0));
        assert_eq!(
            state.background.map(|b| b.reference),
            Some(BackgroundRef::File("/data/cage.background.png".into()))
        );
        assert_eq!(state.regions.get("food").map(|r| r.kind), Some(RegionType::Food));
    }

    #[test]
    fn unusable_sections_are_dropped() {
        let state = decode_value(&json!({
            "arena": "nonsense",
            "meta": {"start_time": 5, "end_time": 1},
            "colors": {"frames": {"1.000": {"labels": 3}}}
        }))
        .unwrap();
        assert!(state.arena.is_none());
        assert!(state.timing.is_none());
        assert!(state.frames.is_empty());
    }

    #[test]
    fn oversized_label_runs_drop_only_that_frame() {
        let mut document: Value = serde_json::from_slice(&encode(&sample_state()).unwrap()).unwrap();
        document["colors"]["frames"]["9.000"] = json!({
            "labels": {"width": 1, "height": 1, "runs": [[0, 1000000000]]},
            "marks": []
        });
        let state = decode(&serde_json::to_vec(&document).unwrap()).unwrap();
        assert_eq!(state.frames.keys().collect::<Vec<_>>(), ["3.250"]);
        assert!(state.arena.is_some());
    }

    #[test]
    fn legacy_color_samples_are_skipped() {
        let state = decode_value(&json!({
            "arena": {"tl": {"x": 0, "y": 0}, "br": {"x": 100, "y": 80}},
            "colors": {
                "mice": ["red", "green"],
                "marks": [{"mouse": 1, "x": 10, "y": 12}, {"mouse": 2, "x": 40, "y": 30}]
            }
        }))
        .unwrap();
        assert!(state.frames.is_empty());
        assert!(state.arena.is_some());
    }

    #[test]
    fn non_object_documents_are_corrupt() {
        assert_matches!(decode(b"[1, 2]"), Err(PrepError::CorruptSidecar(_)));
        assert_matches!(decode(b"{ truncated"), Err(PrepError::CorruptSidecar(_)));
    }

    #[test]
    fn export_carries_arena_roi_and_meta_only() {
        let value: Value = serde_json::from_slice(&encode_export(&sample_state()).unwrap()).unwrap();
        assert!(value.get("arena").is_some());
        assert!(value.get("roi").is_some());
        assert_eq!(value["meta"]["ready"], json!(true));
        assert!(value.get("colors").is_none());
        assert!(value.get("background").is_none());
    }

    #[test]
    fn quantile_percent_normalization() {
        assert_eq!(normalize_quantile(0.25), Some(0.25));
        assert_eq!(normalize_quantile(75.0), Some(0.75));
        assert_eq!(normalize_quantile(250.0), None);
        assert_eq!(normalize_quantile(-1.0), None);
    }
}
