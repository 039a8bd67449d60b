//! Level of Detail (LOD) system for progressive disclosure
//!
//! Five cumulative levels decide which objects enter a bundle and how many
//! bytes it may take. An object admitted at a level is admitted at every
//! higher level, so moving up only ever adds objects.
//!
//! - LOD 0: Building outline, major structure only - 2KB
//! - LOD 1: Room layout plus primary MEP - 6KB
//! - LOD 2: Detailed components, no finishes - 12KB
//! - LOD 3: Conflict zones, everything - 14KB
//! - LOD 4: Full detail - unbounded

use serde::{Deserialize, Serialize};

use crate::core::Error;
use crate::core::types::Result;
use crate::object::SpatialObject;
use crate::streaming::budget::BundleBudget;

/// Detail level, ordered from coarsest to finest
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LodLevel {
    BuildingOutline = 0,
    RoomLayout = 1,
    DetailedComponents = 2,
    ConflictZones = 3,
    FullDetail = 4,
}

/// Maximum LOD level
pub const MAX_LOD: LodLevel = LodLevel::FullDetail;

/// Byte budget per level; `None` is unbounded
pub const LOD_BUDGETS: [Option<usize>; 5] = [Some(2048), Some(6144), Some(12288), Some(14336), None];

/// Highest `system_priority` admitted per level
pub const PRIORITY_THRESHOLDS: [u8; 5] = [1, 3, 4, 5, 5];

impl LodLevel {
    pub const ALL: [LodLevel; 5] = [
        LodLevel::BuildingOutline,
        LodLevel::RoomLayout,
        LodLevel::DetailedComponents,
        LodLevel::ConflictZones,
        LodLevel::FullDetail,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Next coarser level, if any
    pub fn coarser(self) -> Option<Self> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    pub fn name(self) -> &'static str {
        match self {
            LodLevel::BuildingOutline => "building_outline",
            LodLevel::RoomLayout => "room_layout",
            LodLevel::DetailedComponents => "detailed_components",
            LodLevel::ConflictZones => "conflict_zones",
            LodLevel::FullDetail => "full_detail",
        }
    }
}

/// Admission rule for one level
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodFilter {
    /// Highest acceptable `system_priority`
    pub priority_threshold: u8,
    /// Allowed system types; `None` admits all
    pub system_types: Option<Vec<String>>,
    /// Require at least `LodConfig::major_volume_threshold` cubic meters
    pub major_objects_only: bool,
    /// MEP objects must be one of `LodConfig::primary_mep_types`
    pub primary_mep_only: bool,
    /// Reject finish objects
    pub exclude_finishes: bool,
}

impl Default for LodFilter {
    fn default() -> Self {
        Self {
            priority_threshold: 5,
            system_types: None,
            major_objects_only: false,
            primary_mep_only: false,
            exclude_finishes: false,
        }
    }
}

/// Budget and filter for one level
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelSpec {
    pub max_bytes: Option<usize>,
    pub filter: LodFilter,
}

/// Configuration for LOD behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// One entry per [`LodLevel`], coarsest first
    pub levels: [LevelSpec; 5],
    /// Viewport areas below which LOD 3, 2 and 1 apply
    pub area_thresholds: [f64; 3],
    /// Cubic meters for an object to count as major
    pub major_volume_threshold: f64,
    pub mep_systems: Vec<String>,
    pub primary_mep_types: Vec<String>,
    pub finish_types: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for LodConfig {
    fn default() -> Self {
        let level = |i: usize, filter: LodFilter| LevelSpec {
            max_bytes: LOD_BUDGETS[i],
            filter: LodFilter {
                priority_threshold: PRIORITY_THRESHOLDS[i],
                ..filter
            },
        };

        Self {
            levels: [
                level(
                    0,
                    LodFilter {
                        system_types: Some(strings(&["structural", "architectural"])),
                        major_objects_only: true,
                        ..Default::default()
                    },
                ),
                level(
                    1,
                    LodFilter {
                        system_types: Some(strings(&[
                            "structural",
                            "architectural",
                            "electrical",
                            "hvac",
                            "plumbing",
                            "fire_protection",
                        ])),
                        primary_mep_only: true,
                        ..Default::default()
                    },
                ),
                level(
                    2,
                    LodFilter {
                        exclude_finishes: true,
                        ..Default::default()
                    },
                ),
                level(3, LodFilter::default()),
                level(4, LodFilter::default()),
            ],
            area_thresholds: [100.0, 1000.0, 10000.0],
            major_volume_threshold: 1.0,
            mep_systems: strings(&["electrical", "hvac", "plumbing", "fire_protection", "mechanical"]),
            primary_mep_types: strings(&[
                "electrical_panel",
                "transformer",
                "switchgear",
                "air_handler",
                "main_duct",
                "chiller",
                "boiler",
                "main_pipe",
                "water_heater",
                "riser",
                "fire_pump",
                "sprinkler_main",
            ]),
            finish_types: strings(&["paint", "trim", "wall_finish", "floor_finish", "ceiling_tile", "finish"]),
        }
    }
}

impl LodConfig {
    pub fn validate(&self) -> Result<()> {
        let [a, b, c] = self.area_thresholds;
        if !(a > 0.0 && a < b && b < c) {
            return Err(Error::Config(format!(
                "LOD area thresholds must be positive and ascending, got {:?}",
                self.area_thresholds
            )));
        }
        for pair in self.levels.windows(2) {
            let (lo, hi) = (pair[0].max_bytes, pair[1].max_bytes);
            let ascending = match (lo, hi) {
                (Some(lo), Some(hi)) => lo <= hi,
                (_, None) => true,
                (None, Some(_)) => false,
            };
            if !ascending {
                return Err(Error::Config("LOD budgets must not shrink with detail".into()));
            }
        }
        Ok(())
    }
}

/// Size of a level's object set against its budget
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SizeEstimate {
    pub level: LodLevel,
    pub object_count: usize,
    pub estimated_bytes: usize,
    pub budget_bytes: Option<usize>,
    /// estimated_bytes / budget_bytes (0.0 when unbounded)
    pub utilization: f64,
    pub fits_budget: bool,
}

impl SizeEstimate {
    fn new(level: LodLevel, object_count: usize, estimated_bytes: usize, budget_bytes: Option<usize>) -> Self {
        let mut budget = BundleBudget::new(budget_bytes);
        let fits_budget = budget.fits(estimated_bytes);
        budget.add(estimated_bytes);
        Self {
            level,
            object_count,
            estimated_bytes,
            budget_bytes,
            utilization: budget.pressure(),
            fits_budget,
        }
    }
}

/// Decides per level which objects enter a bundle
#[derive(Clone, Debug, Default)]
pub struct ProgressiveDisclosure {
    config: LodConfig,
}

impl ProgressiveDisclosure {
    pub fn new(config: LodConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LodConfig {
        &self.config
    }

    pub fn level_budget(&self, level: LodLevel) -> Option<usize> {
        self.config.levels[level.index()].max_bytes
    }

    /// LOD for a viewport area; smaller viewports get more detail
    pub fn viewport_lod(&self, area: f64) -> LodLevel {
        let [conflict, detailed, rooms] = self.config.area_thresholds;
        if area < conflict {
            LodLevel::ConflictZones
        } else if area < detailed {
            LodLevel::DetailedComponents
        } else if area < rooms {
            LodLevel::RoomLayout
        } else {
            LodLevel::BuildingOutline
        }
    }

    fn matches(&self, filter: &LodFilter, object: &SpatialObject) -> bool {
        if object.system_priority > filter.priority_threshold {
            return false;
        }
        if let Some(systems) = &filter.system_types {
            if !systems.iter().any(|s| *s == object.system_type) {
                return false;
            }
        }
        if filter.major_objects_only && object.volume() < self.config.major_volume_threshold {
            return false;
        }
        if filter.primary_mep_only
            && self.config.mep_systems.contains(&object.system_type)
            && !self.config.primary_mep_types.contains(&object.object_type)
        {
            return false;
        }
        if filter.exclude_finishes
            && (object.system_type == "finishes" || self.config.finish_types.contains(&object.object_type))
        {
            return false;
        }
        true
    }

    /// True if the object is shown at `level`.
    ///
    /// Admission is cumulative: passing any coarser level's filter admits.
    pub fn admits(&self, object: &SpatialObject, level: LodLevel) -> bool {
        self.config.levels[..=level.index()]
            .iter()
            .any(|spec| self.matches(&spec.filter, object))
    }

    pub fn filter_for_level<'a>(&self, objects: &'a [SpatialObject], level: LodLevel) -> Vec<&'a SpatialObject> {
        objects.iter().filter(|o| self.admits(o, level)).collect()
    }

    pub fn estimate_size(&self, objects: &[SpatialObject], level: LodLevel) -> SizeEstimate {
        let admitted = self.filter_for_level(objects, level);
        let bytes = admitted.iter().map(|o| o.estimated_size()).sum();
        SizeEstimate::new(level, admitted.len(), bytes, self.level_budget(level))
    }

    /// Highest level at or below `requested` whose objects fit both the
    /// level budget and the role budget.
    ///
    /// Levels whose own budget exceeds the role budget are skipped. If no
    /// level fits, the building outline is returned with `fits_budget`
    /// reporting the overrun.
    pub fn select_level(
        &self,
        objects: &[SpatialObject],
        requested: LodLevel,
        role_budget: Option<usize>,
    ) -> SizeEstimate {
        for level in LodLevel::ALL[..=requested.index()].iter().rev() {
            let level_budget = self.level_budget(*level);
            let within_role = match (level_budget, role_budget) {
                (_, None) => true,
                (Some(level_max), Some(role_max)) => level_max <= role_max,
                (None, Some(_)) => false,
            };
            if !within_role {
                continue;
            }

            let estimate = self.estimate_size(objects, *level);
            if estimate.fits_budget {
                return estimate;
            }
            log::debug!(
                "LOD {} needs {} bytes over budget {:?}, stepping down",
                level.index(),
                estimate.estimated_bytes,
                level_budget
            );
        }

        let estimate = self.estimate_size(objects, LodLevel::BuildingOutline);
        if !estimate.fits_budget {
            log::warn!(
                "Building outline still needs {} bytes ({:.0}% of budget)",
                estimate.estimated_bytes,
                estimate.utilization * 100.0
            );
        }
        estimate
    }
}
