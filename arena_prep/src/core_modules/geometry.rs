// THEORY:
// The `geometry` module is the coordinate backbone of the engine. It owns the
// three spaces every other module talks in:
//
// 1.  **Video pixel space**: native frame coordinates, where the operator draws
//     the arena box and clicks on subjects.
// 2.  **Arena space**: the same pixels made relative to the arena's top-left
//     corner. The arena is the only part of the frame the grid covers.
// 3.  **Grid space**: a (row, col) lattice laid over the arena, exactly the way
//     the chunk grid is laid over a frame: `col = floor(dx * cols / width)`.
//
// The mapper is pure math. It never clamps: a click left of the arena yields a
// negative column, and it is the caller that decides whether such a cell is
// acceptable (the interactive editor keeps it, automated pipelines drop it).
// Rendering-space transforms (canvas or widget sizes) do not belong here.

use crate::error::{PrepError, Result};
use serde::{Deserialize, Serialize};

/// Minimum arena width in pixels for the arena to count as calibrated.
pub const MIN_ARENA_WIDTH: f64 = 10.0;
/// Minimum arena height in pixels for the arena to count as calibrated.
pub const MIN_ARENA_HEIGHT: f64 = 10.0;

/// A point in video pixel space. Sub-pixel values are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The operator-defined rectangle delimiting the tracked area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaBox {
    /// Top-left corner in video pixels.
    pub tl: PixelPoint,
    /// Bottom-right corner in video pixels.
    pub br: PixelPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_cols: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_rows: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_in_cm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_in_cm: Option<f64>,
}

impl ArenaBox {
    pub fn new(tl: PixelPoint, br: PixelPoint) -> Self {
        Self {
            tl,
            br,
            grid_cols: None,
            grid_rows: None,
            width_in_cm: None,
            height_in_cm: None,
        }
    }

    pub fn width(&self) -> f64 {
        self.br.x - self.tl.x
    }

    pub fn height(&self) -> f64 {
        self.br.y - self.tl.y
    }

    /// An arena is valid once both sides reach the minimum size. Position does
    /// not matter, and an inverted box always fails because its sides are negative.
    pub fn is_valid(&self) -> bool {
        self.width() >= MIN_ARENA_WIDTH && self.height() >= MIN_ARENA_HEIGHT
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(PrepError::InvalidArena {
                width: self.width(),
                height: self.height(),
                min_width: MIN_ARENA_WIDTH,
                min_height: MIN_ARENA_HEIGHT,
            })
        }
    }

    /// The grid recorded on the arena, if both dimensions are present.
    pub fn grid(&self) -> Option<GridSize> {
        match (self.grid_cols, self.grid_rows) {
            (Some(cols), Some(rows)) => Some(GridSize { cols, rows }),
            _ => None,
        }
    }

    /// Centimeters per pixel along x and y, when a physical size is known.
    pub fn cm_per_pixel(&self) -> Option<(f64, f64)> {
        let width_cm = self.width_in_cm?;
        let height_cm = self.height_in_cm?;
        if !self.is_valid() {
            return None;
        }
        Some((width_cm / self.width(), height_cm / self.height()))
    }
}

/// Number of grid columns and rows laid over the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub cols: u32,
    pub rows: u32,
}

impl GridSize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    pub fn contains(&self, cell: Cell) -> bool {
        cell.row >= 0 && cell.col >= 0 && (cell.row as i64) < self.rows as i64 && (cell.col as i64) < self.cols as i64
    }
}

/// A grid cell. Cells may lie outside the current grid (negative or too large);
/// they are stored as `[row, col]` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct Cell {
    pub row: i32,
    pub col: i32,
}

impl Cell {
    pub fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }
}

impl From<(i32, i32)> for Cell {
    fn from((row, col): (i32, i32)) -> Self {
        Self { row, col }
    }
}

impl From<Cell> for (i32, i32) {
    fn from(cell: Cell) -> Self {
        (cell.row, cell.col)
    }
}

/// An axis-aligned rectangle in video pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Maps between video pixels and grid cells for one arena and grid.
#[derive(Debug, Clone)]
pub struct GeometryMapper {
    arena: ArenaBox,
    grid: GridSize,
}

impl GeometryMapper {
    /// Builds a mapper. The arena must be valid and the grid non-empty, which
    /// keeps the per-call mapping free of division checks.
    pub fn new(arena: &ArenaBox, grid: GridSize) -> Result<Self> {
        arena.validate()?;
        if grid.cols == 0 || grid.rows == 0 {
            return Err(PrepError::InvalidParameter(format!(
                "grid must have at least one column and row, got {}x{}",
                grid.cols, grid.rows
            )));
        }
        Ok(Self {
            arena: arena.clone(),
            grid,
        })
    }

    pub fn arena(&self) -> &ArenaBox {
        &self.arena
    }

    pub fn grid(&self) -> GridSize {
        self.grid
    }

    /// Video pixel to grid cell. Points outside the arena map to out-of-range cells.
    pub fn pixel_to_cell(&self, px: f64, py: f64) -> Cell {
        let col = ((px - self.arena.tl.x) * self.grid.cols as f64 / self.arena.width()).floor();
        let row = ((py - self.arena.tl.y) * self.grid.rows as f64 / self.arena.height()).floor();
        Cell {
            row: row as i32,
            col: col as i32,
        }
    }

    /// Grid cell back to the pixel rectangle it covers. Used for rendering only.
    pub fn cell_to_rect(&self, cell: Cell) -> PixelRect {
        let cell_width = self.arena.width() / self.grid.cols as f64;
        let cell_height = self.arena.height() / self.grid.rows as f64;
        PixelRect {
            x: self.arena.tl.x + cell.col as f64 * cell_width,
            y: self.arena.tl.y + cell.row as f64 * cell_height,
            width: cell_width,
            height: cell_height,
        }
    }

    /// Strict variant for automated pipelines: rejects cells outside the grid.
    pub fn pixel_to_cell_in_grid(&self, px: f64, py: f64) -> Option<Cell> {
        let cell = self.pixel_to_cell(px, py);
        self.grid.contains(cell).then_some(cell)
    }
}

/// Rescales a point between two raster resolutions of the same frame, e.g. from
/// native video pixels into a reduced-resolution label matrix.
pub fn resample_point(point: PixelPoint, from: (u32, u32), to: (u32, u32)) -> PixelPoint {
    if from.0 == 0 || from.1 == 0 {
        return point;
    }
    PixelPoint {
        x: point.x * to.0 as f64 / from.0 as f64,
        y: point.y * to.1 as f64 / from.1 as f64,
    }
}
