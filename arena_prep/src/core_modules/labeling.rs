// THEORY:
// The `labeling` module is the spatial grouping layer of segmentation. It turns a
// per-pixel class map (0 = background, k = "closest to palette color k") into a
// dense label matrix in which every connected blob carries its own id.
//
// Key architectural principles & algorithm steps:
// 1.  **Speckle suppression first**: each class is cleaned independently with a
//     morphological open (erode, then dilate) followed by a close (dilate, then
//     erode) using a disk of small radius. Isolated noise pixels vanish; thin gaps
//     inside a marker are bridged.
// 2.  **Region growing**: an explicit-stack flood fill grows a component from its
//     first unvisited pixel over same-valued neighbors (4- or 8-connected).
// 3.  **Deterministic ids**: the raster is scanned in row-major order, so the id of
//     a component is fixed by the position of its first pixel. No hash iteration
//     is involved, which keeps label matrices bit-identical across runs.
// 4.  **Area filter**: components smaller than the minimum area are erased back to
//     background and the survivors are renumbered in the same raster order.
// 5.  **Data aggregation**: every surviving component is summarized (area,
//     centroid, bounding box, class) the way a detected blob would be.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Largest label matrix accepted from a document (a 16k x 16k frame).
pub const MAX_ENCODED_PIXELS: u64 = 1 << 28;

/// Pixel adjacency used by the flood fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Four,
    Eight,
}

impl Connectivity {
    fn offsets(&self) -> &'static [(i64, i64)] {
        match self {
            Connectivity::Four => &[(0, 1), (0, -1), (1, 0), (-1, 0)],
            Connectivity::Eight => &[
                (0, 1),
                (0, -1),
                (1, 0),
                (-1, 0),
                (1, 1),
                (1, -1),
                (-1, 1),
                (-1, -1),
            ],
        }
    }
}

/// Mean position of a component's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub row: f64,
    pub col: f64,
}

/// Per-pixel integer labels: 0 is background, every positive value one component.
/// Serialized run-length encoded as `{width, height, runs: [[value, count], ...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EncodedLabels", into = "EncodedLabels")]
pub struct LabelMatrix {
    width: u32,
    height: u32,
    data: Vec<u32>,
}

impl LabelMatrix {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<u32>) -> Option<Self> {
        (data.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    /// Label at (x, y), or `None` outside the matrix. Signed so callers can probe
    /// neighborhoods without bounds arithmetic.
    pub fn get(&self, x: i64, y: i64) -> Option<u32> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(self.data[y as usize * self.width as usize + x as usize])
    }

    pub fn nonzero_count(&self) -> usize {
        self.data.iter().filter(|&&label| label != 0).count()
    }

    pub fn distinct_label_count(&self) -> usize {
        self.data
            .iter()
            .filter(|&&label| label != 0)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn pixel_count(&self, label: u32) -> usize {
        self.data.iter().filter(|&&value| value == label).count()
    }

    /// Mean (row, col) of every pixel carrying `label`.
    pub fn centroid(&self, label: u32) -> Option<Centroid> {
        if label == 0 {
            return None;
        }
        let mut count = 0usize;
        let mut sum_row = 0.0;
        let mut sum_col = 0.0;
        for (index, &value) in self.data.iter().enumerate() {
            if value == label {
                count += 1;
                sum_row += (index / self.width as usize) as f64;
                sum_col += (index % self.width as usize) as f64;
            }
        }
        (count > 0).then(|| Centroid {
            row: sum_row / count as f64,
            col: sum_col / count as f64,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedLabels {
    width: u32,
    height: u32,
    runs: Vec<(u32, u32)>,
}

impl From<LabelMatrix> for EncodedLabels {
    fn from(matrix: LabelMatrix) -> Self {
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for &value in &matrix.data {
            match runs.last_mut() {
                Some((last, count)) if *last == value => *count += 1,
                _ => runs.push((value, 1)),
            }
        }
        Self {
            width: matrix.width,
            height: matrix.height,
            runs,
        }
    }
}

impl TryFrom<EncodedLabels> for LabelMatrix {
    type Error = String;

    fn try_from(encoded: EncodedLabels) -> Result<Self, Self::Error> {
        let uncovered = || {
            format!(
                "label runs do not cover a {}x{} matrix",
                encoded.width, encoded.height
            )
        };
        let pixels = u64::from(encoded.width) * u64::from(encoded.height);
        if pixels > MAX_ENCODED_PIXELS {
            return Err(format!(
                "{}x{} label matrix exceeds {MAX_ENCODED_PIXELS} pixels",
                encoded.width, encoded.height
            ));
        }
        let expected = pixels as usize;
        let mut data = Vec::with_capacity(expected);
        for &(value, count) in &encoded.runs {
            let count = count as usize;
            if count > expected - data.len() {
                return Err(uncovered());
            }
            data.extend(std::iter::repeat_n(value, count));
        }
        LabelMatrix::from_raw(encoded.width, encoded.height, data).ok_or_else(uncovered)
    }
}

/// Summary of one connected component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentInfo {
    pub label: u32,
    /// Class value (palette index, 1-based) the component was grown from.
    pub class: u8,
    pub area: usize,
    pub centroid: Centroid,
    /// `(min_x, min_y, max_x, max_y)`, inclusive.
    pub bounding_box: (u32, u32, u32, u32),
}

/// Offsets of a disk-shaped structuring element.
pub fn disk_offsets(radius: u32) -> Vec<(i64, i64)> {
    let r = radius as i64;
    let mut offsets = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy <= r * r {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

/// Binary erosion. Only in-bounds neighbors are considered, so blobs touching
/// the frame edge are not eaten from outside.
pub fn erode(mask: &[bool], width: u32, height: u32, element: &[(i64, i64)]) -> Vec<bool> {
    morph(mask, width, height, element, true)
}

/// Binary dilation.
pub fn dilate(mask: &[bool], width: u32, height: u32, element: &[(i64, i64)]) -> Vec<bool> {
    morph(mask, width, height, element, false)
}

fn morph(mask: &[bool], width: u32, height: u32, element: &[(i64, i64)], erosion: bool) -> Vec<bool> {
    let (w, h) = (width as i64, height as i64);
    let mut out = vec![false; mask.len()];
    for y in 0..h {
        for x in 0..w {
            let mut hit = erosion;
            for &(dx, dy) in element {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let value = mask[(ny * w + nx) as usize];
                if erosion && !value {
                    hit = false;
                    break;
                }
                if !erosion && value {
                    hit = true;
                    break;
                }
            }
            out[(y * w + x) as usize] = hit;
        }
    }
    out
}

/// Morphological open followed by close.
pub fn open_close(mask: &[bool], width: u32, height: u32, radius: u32) -> Vec<bool> {
    if radius == 0 {
        return mask.to_vec();
    }
    let element = disk_offsets(radius);
    let opened = dilate(&erode(mask, width, height, &element), width, height, &element);
    erode(&dilate(&opened, width, height, &element), width, height, &element)
}

/// Applies `open_close` to every class of a class map independently.
pub fn smooth_classes(classes: &[u8], width: u32, height: u32, radius: u32) -> Vec<u8> {
    let max_class = classes.iter().copied().max().unwrap_or(0);
    let mut out = vec![0u8; classes.len()];
    for class in 1..=max_class {
        let mask: Vec<bool> = classes.iter().map(|&c| c == class).collect();
        if !mask.iter().any(|&m| m) {
            continue;
        }
        let cleaned = open_close(&mask, width, height, radius);
        for (slot, keep) in out.iter_mut().zip(cleaned) {
            // Classes are disjoint before smoothing; after a close they may touch,
            // in which case the lower class keeps the pixel.
            if keep && *slot == 0 {
                *slot = class;
            }
        }
    }
    out
}

/// Labels connected runs of equal, nonzero class values. Components below
/// `min_area` are dropped; survivors get ids 1..=k in raster order of their
/// first pixel.
pub fn label_components(
    classes: &[u8],
    width: u32,
    height: u32,
    connectivity: Connectivity,
    min_area: usize,
) -> (LabelMatrix, Vec<ComponentInfo>) {
    let (w, h) = (width as i64, height as i64);
    let mut labels = vec![0u32; classes.len()];
    let mut components: Vec<ComponentInfo> = Vec::new();
    let mut provisional: u32 = 0;
    let mut stack: Vec<(i64, i64)> = Vec::new();

    for start in 0..classes.len() {
        let class = classes[start];
        if class == 0 || labels[start] != 0 {
            continue;
        }
        provisional += 1;
        labels[start] = provisional;
        stack.push(((start as i64) % w, (start as i64) / w));

        let mut area = 0usize;
        let (mut sum_row, mut sum_col) = (0.0, 0.0);
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);

        while let Some((x, y)) = stack.pop() {
            area += 1;
            sum_row += y as f64;
            sum_col += x as f64;
            min_x = min_x.min(x as u32);
            min_y = min_y.min(y as u32);
            max_x = max_x.max(x as u32);
            max_y = max_y.max(y as u32);

            for &(dx, dy) in connectivity.offsets() {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let index = (ny * w + nx) as usize;
                if labels[index] == 0 && classes[index] == class {
                    labels[index] = provisional;
                    stack.push((nx, ny));
                }
            }
        }

        components.push(ComponentInfo {
            label: provisional,
            class,
            area,
            centroid: Centroid {
                row: sum_row / area as f64,
                col: sum_col / area as f64,
            },
            bounding_box: (min_x, min_y, max_x, max_y),
        });
    }

    // Provisional ids are already in raster order; renumber the survivors.
    let mut remap = vec![0u32; provisional as usize + 1];
    let mut kept = Vec::with_capacity(components.len());
    for mut component in components {
        if component.area < min_area {
            continue;
        }
        let final_id = kept.len() as u32 + 1;
        remap[component.label as usize] = final_id;
        component.label = final_id;
        kept.push(component);
    }
    for label in labels.iter_mut() {
        *label = remap[*label as usize];
    }

    (
        LabelMatrix {
            width,
            height,
            data: labels,
        },
        kept,
    )
}
