// THEORY:
// A Setup is a named, facility-scoped preset that seeds a video that has no
// state yet: grid size, physical arena size, background sampling parameters,
// optionally an arena rectangle, and a starting set of regions. The catalog
// is read-only configuration, loaded once from a JSON file.
//
// Catalog files have drifted over time. Facilities may list `setups` as a
// name-keyed map (current) or as a list of named entries (legacy), and very
// old files only carry facility-level `roi_sets`. All three normalize into the
// same `Facility { setups }` shape at load time. Facilities may live at the top
// level (`facilities`) or under `importer.facilities`.

use crate::core_modules::background::BackgroundParams;
use crate::core_modules::geometry::ArenaBox;
use crate::core_modules::regions::Region;
use crate::core_modules::sidecar::{as_f64, as_string, as_u32, normalize_quantile, region_from_value};
use crate::error::{PrepError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Environment variable naming the catalog file.
pub const CONFIG_ENV: &str = "ARENA_PREP_CONFIG";
/// Environment variable naming the active facility.
pub const FACILITY_ENV: &str = "ARENA_PREP_FACILITY";

const DEFAULT_SETUP: &str = "default";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Setup {
    pub name: String,
    pub grid_cols: Option<u32>,
    pub grid_rows: Option<u32>,
    pub arena_width_cm: Option<f64>,
    pub arena_height_cm: Option<f64>,
    pub bg_frames: Option<u32>,
    /// Always a fraction in [0, 1] once loaded.
    pub bg_quantile: Option<f64>,
    pub arena: Option<ArenaBox>,
    pub regions: Vec<Region>,
}

impl Setup {
    pub fn background_params(&self) -> BackgroundParams {
        let defaults = BackgroundParams::default();
        BackgroundParams {
            n_frames: self.bg_frames.filter(|&n| n > 0).unwrap_or(defaults.n_frames),
            quantile: self.bg_quantile.unwrap_or(defaults.quantile),
        }
    }

    /// Copies grid and physical size onto `arena` where the arena leaves them unset.
    pub fn apply_to_arena(&self, arena: &mut ArenaBox) {
        arena.grid_cols = arena.grid_cols.or(self.grid_cols);
        arena.grid_rows = arena.grid_rows.or(self.grid_rows);
        arena.width_in_cm = arena.width_in_cm.or(self.arena_width_cm);
        arena.height_in_cm = arena.height_in_cm.or(self.arena_height_cm);
    }

    fn from_value(name: &str, value: &Value) -> Self {
        let empty = Map::new();
        let object = value.as_object().unwrap_or(&empty);
        let preproc = object.get("preproc").and_then(Value::as_object).unwrap_or(object);
        let number = |key: &str| preproc.get(key).and_then(as_f64);
        let whole = |key: &str| preproc.get(key).and_then(as_u32);

        let arena = object
            .get("arena")
            .or_else(|| preproc.get("arena"))
            .and_then(|a| serde_json::from_value::<ArenaBox>(a.clone()).ok());

        Setup {
            name: name.to_string(),
            grid_cols: whole("grid_cols").filter(|&n| n > 0),
            grid_rows: whole("grid_rows").filter(|&n| n > 0),
            arena_width_cm: number("arena_width_cm"),
            arena_height_cm: number("arena_height_cm"),
            bg_frames: whole("bg_frames"),
            bg_quantile: number("bg_quantile").and_then(normalize_quantile),
            arena,
            regions: regions_of(object),
        }
    }
}

/// Region items of a setup: `items`, `regions`, or the items of its first ROI set.
fn regions_of(object: &Map<String, Value>) -> Vec<Region> {
    let list = object
        .get("items")
        .or_else(|| object.get("regions"))
        .and_then(Value::as_array)
        .or_else(|| {
            object
                .get("roi_sets")
                .and_then(Value::as_array)
                .and_then(|sets| sets.first())
                .and_then(|set| set.get("items"))
                .and_then(Value::as_array)
        });
    list.map(|items| items.iter().filter_map(|item| region_from_value(item, None)).collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Facility {
    pub name: String,
    pub setups: BTreeMap<String, Setup>,
    /// Preferred setup for new videos; falls back to "default", then the first.
    pub active_setup: Option<String>,
}

impl Facility {
    fn from_value(name: &str, value: &Value) -> Self {
        let mut setups = BTreeMap::new();
        match value.get("setups") {
            Some(Value::Object(map)) => {
                for (setup_name, setup) in map {
                    setups.insert(setup_name.clone(), Setup::from_value(setup_name, setup));
                }
            }
            Some(Value::Array(list)) => {
                for setup in list {
                    let setup_name = setup.get("name").and_then(as_string).unwrap_or_else(|| DEFAULT_SETUP.into());
                    setups.insert(setup_name.clone(), Setup::from_value(&setup_name, setup));
                }
            }
            _ => {}
        }
        // Facility-level ROI sets are setups saved by older tools.
        if let Some(roi_sets) = value.get("roi_sets").and_then(Value::as_array) {
            for set in roi_sets {
                let set_name = set.get("name").and_then(as_string).unwrap_or_else(|| DEFAULT_SETUP.into());
                setups
                    .entry(set_name.clone())
                    .or_insert_with(|| Setup::from_value(&set_name, set));
            }
        }
        Facility {
            name: name.to_string(),
            setups,
            active_setup: value.get("active_setup").and_then(as_string),
        }
    }

    pub fn active(&self) -> Option<&Setup> {
        self.active_setup
            .as_deref()
            .and_then(|name| self.setups.get(name))
            .or_else(|| self.setups.get(DEFAULT_SETUP))
            .or_else(|| self.setups.values().next())
    }
}

/// Read-only facility/setup lookup.
#[derive(Debug, Clone, Default)]
pub struct SetupCatalog {
    facilities: BTreeMap<String, Facility>,
}

impl SetupCatalog {
    pub fn from_value(value: &Value) -> Result<Self> {
        let facilities = value
            .get("facilities")
            .or_else(|| value.get("importer").and_then(|i| i.get("facilities")))
            .and_then(Value::as_object)
            .ok_or_else(|| PrepError::InvalidParameter("catalog has no `facilities` object".into()))?;
        let facilities = facilities
            .iter()
            .map(|(name, facility)| {
                let key = name.trim().to_lowercase();
                (key.clone(), Facility::from_value(&key, facility))
            })
            .collect();
        Ok(Self { facilities })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(&serde_json::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let catalog = Self::from_json(&std::fs::read_to_string(path)?)?;
        tracing::info!(path = %path.display(), facilities = catalog.facilities.len(), "Setup catalog loaded");
        Ok(catalog)
    }

    /// Loads the catalog named by `ARENA_PREP_CONFIG`, if set.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(Path::new(&path)).map(Some),
            None => Ok(None),
        }
    }

    pub fn facility(&self, facility: &str) -> Option<&Facility> {
        self.facilities.get(&facility.trim().to_lowercase())
    }

    pub fn facility_names(&self) -> impl Iterator<Item = &str> {
        self.facilities.keys().map(String::as_str)
    }

    pub fn get_setup(&self, facility: &str, name: &str) -> Result<&Setup> {
        self.facility(facility)
            .and_then(|f| f.setups.get(name))
            .ok_or_else(|| PrepError::UnknownSetup {
                facility: facility.to_string(),
                name: name.to_string(),
            })
    }

    pub fn active_setup(&self, facility: &str) -> Option<&Setup> {
        self.facility(facility).and_then(Facility::active)
    }
}
