// THEORY:
// A region of interest is a named set of grid cells with a few semantic flags.
// Cells are stored in grid space (row, col), never in pixels, so a region
// survives any change of the arena rectangle untouched. Changing the grid size
// keeps out-of-range cells as well; they are only dropped when a caller asks
// for it explicitly through `prune_outside`.
//
// Names are the identity of a region and are unique case-insensitively. Every
// mutation validates first and mutates second, so a rejected call leaves the
// store exactly as it was.

use crate::core_modules::geometry::{Cell, GridSize};
use crate::error::{PrepError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Semantic type of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionType {
    #[default]
    Open,
    Food,
    Water,
    Nest,
    Ramp,
    Wall,
    Enrichment,
}

const TYPE_KEYWORDS: &[(&[&str], RegionType)] = &[
    (&["food", "feed"], RegionType::Food),
    (&["water", "drink", "bottle"], RegionType::Water),
    (&["nest", "home", "house", "shelter"], RegionType::Nest),
    (&["ramp"], RegionType::Ramp),
    (&["wall", "edge", "border"], RegionType::Wall),
    (&["enrich", "toy", "wheel"], RegionType::Enrichment),
];

/// Infers a type from the leading keyword of a region name.
pub fn infer_region_type(name: &str) -> RegionType {
    let lowered = name.trim().to_lowercase();
    TYPE_KEYWORDS
        .iter()
        .find(|(prefixes, _)| prefixes.iter().any(|prefix| lowered.starts_with(prefix)))
        .map(|(_, kind)| *kind)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub enabled: bool,
    pub sheltered: bool,
    #[serde(rename = "type")]
    pub kind: RegionType,
    pub cells: BTreeSet<Cell>,
    /// Set once the type was chosen explicitly; renames no longer re-infer it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub type_locked: bool,
}

impl Region {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            sheltered: false,
            kind: infer_region_type(name),
            cells: BTreeSet::new(),
            type_locked: false,
        }
    }

    /// The cells an automated pipeline may use under `grid`.
    pub fn cells_in_grid(&self, grid: GridSize) -> Vec<Cell> {
        self.cells.iter().copied().filter(|cell| grid.contains(*cell)).collect()
    }
}

/// Ordered, name-unique collection of regions for one video.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionStore {
    regions: Vec<Region>,
}

impl RegionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from loaded regions, suffixing duplicate names.
    pub fn from_regions(regions: Vec<Region>) -> Self {
        let mut store = Self::new();
        for mut region in regions {
            let base = if region.name.trim().is_empty() {
                "Region".to_string()
            } else {
                region.name.trim().to_string()
            };
            region.name = store.unique_name(&base);
            store.regions.push(region);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Region> {
        self.position(name).map(|index| &self.regions[index])
    }

    fn position(&self, name: &str) -> Option<usize> {
        let wanted = name.trim().to_lowercase();
        self.regions.iter().position(|r| r.name.to_lowercase() == wanted)
    }

    fn region_mut(&mut self, name: &str) -> Result<&mut Region> {
        match self.position(name) {
            Some(index) => Ok(&mut self.regions[index]),
            None => Err(PrepError::UnknownRegion(name.to_string())),
        }
    }

    fn unique_name(&self, base: &str) -> String {
        if self.position(base).is_none() {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base} {n}"))
            .find(|candidate| self.position(candidate).is_none())
            .unwrap_or_else(|| base.to_string())
    }

    /// Adds a region and returns the name it was stored under, which carries a
    /// numeric suffix when `name` was already taken.
    pub fn add(&mut self, name: &str) -> Result<String> {
        self.add_typed(name, None)
    }

    /// Adds a region with an explicit type, which locks it.
    pub fn add_typed(&mut self, name: &str, kind: Option<RegionType>) -> Result<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(PrepError::InvalidParameter("region name must not be empty".into()));
        }
        let stored = self.unique_name(trimmed);
        let mut region = Region::new(&stored);
        if let Some(kind) = kind {
            region.kind = kind;
            region.type_locked = true;
        }
        self.regions.push(region);
        Ok(stored)
    }

    /// Renames a region. Fails if another region already uses `new_name` in any
    /// letter case. Renaming only the case of a region's own name is allowed.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let index = self
            .position(old_name)
            .ok_or_else(|| PrepError::UnknownRegion(old_name.to_string()))?;
        let trimmed = new_name.trim();
        if trimmed.is_empty() {
            return Err(PrepError::InvalidParameter("region name must not be empty".into()));
        }
        if let Some(other) = self.position(trimmed)
            && other != index
        {
            return Err(PrepError::NameCollision(trimmed.to_string()));
        }
        let region = &mut self.regions[index];
        region.name = trimmed.to_string();
        if !region.type_locked {
            region.kind = infer_region_type(trimmed);
        }
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<Region> {
        let index = self
            .position(name)
            .ok_or_else(|| PrepError::UnknownRegion(name.to_string()))?;
        Ok(self.regions.remove(index))
    }

    /// Flips membership of `cell`. Returns whether the cell is now part of the region.
    pub fn toggle_cell(&mut self, name: &str, cell: Cell) -> Result<bool> {
        let region = self.region_mut(name)?;
        if region.cells.remove(&cell) {
            Ok(false)
        } else {
            region.cells.insert(cell);
            Ok(true)
        }
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        self.region_mut(name)?.enabled = enabled;
        Ok(())
    }

    pub fn set_sheltered(&mut self, name: &str, sheltered: bool) -> Result<()> {
        self.region_mut(name)?.sheltered = sheltered;
        Ok(())
    }

    pub fn set_type(&mut self, name: &str, kind: RegionType) -> Result<()> {
        let region = self.region_mut(name)?;
        region.kind = kind;
        region.type_locked = true;
        Ok(())
    }

    /// Drops every cell outside `grid`. Returns how many cells were removed.
    pub fn prune_outside(&mut self, grid: GridSize) -> usize {
        let mut removed = 0;
        for region in &mut self.regions {
            let before = region.cells.len();
            region.cells.retain(|cell| grid.contains(*cell));
            removed += before - region.cells.len();
        }
        removed
    }
}
