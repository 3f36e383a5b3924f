//! Geospatial engine boundary.
//!
//! Spatial joins, zonal statistics, erase/intersect/dissolve and area calculation
//! are delegated to an external GIS. The pipeline only sees the tabular results
//! through the `GeoEngine` trait, so tests can substitute an in-memory engine.

pub mod exports;

use std::collections::BTreeMap;

use crate::config::{BoundaryConfig, MatchOption, MergeRule};
use crate::error::EngineError;

pub use exports::ExportDirEngine;

/// Square meters in one acre.
pub const SQ_METERS_PER_ACRE: f64 = 4046.856_422_4;

/// One feature of the boundary layer.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundaryRecord {
    pub unit_id: String,
    pub land_area: Option<f64>,
    pub water_area: Option<f64>,
}

/// Attributes attached to one boundary feature by a spatial join.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct JoinedRecord {
    pub unit_id: String,
    pub fields: BTreeMap<String, String>,
}

/// A per-zone statistic (zonal mean, inundated area).
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneStat {
    pub unit_id: String,
    pub value: f64,
}

/// Cells outside this range are nodata and excluded from zonal statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Unit for geometry area calculation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaUnit {
    Acres,
    SquareMeters,
}

impl AreaUnit {
    /// Convert a value expressed in `from` into this unit.
    pub fn convert(self, value: f64, from: AreaUnit) -> f64 {
        match (from, self) {
            (AreaUnit::Acres, AreaUnit::SquareMeters) => value * SQ_METERS_PER_ACRE,
            (AreaUnit::SquareMeters, AreaUnit::Acres) => value / SQ_METERS_PER_ACRE,
            _ => value,
        }
    }
}

/// Spatial join of a join layer onto the boundary layer.
#[derive(Clone, Debug)]
pub struct SpatialJoinRequest<'a> {
    pub target: &'a str,
    pub join: &'a str,
    pub id_field: &'a str,
    pub match_option: MatchOption,
    pub merge_rule: &'a MergeRule,
    pub fields: &'a [String],
}

/// An inundation layer, optionally with a lower depth layer erased from it
/// so that adjacent bands do not overlap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepthBand {
    pub layer: String,
    pub erase: Option<String>,
}

impl DepthBand {
    /// The non-overlapping band for `depth_ft`: that depth minus the next lower one.
    pub fn non_overlapping(prefix: &str, depth_ft: u32) -> Self {
        Self {
            layer: depth_layer(prefix, depth_ft),
            erase: depth_ft.checked_sub(1).map(|lower| depth_layer(prefix, lower)),
        }
    }
}

/// Name of the inundation layer for a whole-foot depth.
pub fn depth_layer(prefix: &str, depth_ft: u32) -> String {
    format!("{}_{}ft", prefix, depth_ft)
}

/// Operations the pipeline needs from a geospatial engine.
pub trait GeoEngine {
    /// Identifier and land/water areas of every boundary feature.
    fn boundary(&self, boundary: &BoundaryConfig) -> Result<Vec<BoundaryRecord>, EngineError>;

    /// Attach `request.fields` from the join layer to each boundary feature.
    fn spatial_join(&self, request: &SpatialJoinRequest<'_>) -> Result<Vec<JoinedRecord>, EngineError>;

    /// Mean raster value per zone, ignoring cells outside `range`.
    fn zonal_mean(
        &self,
        zones: &str,
        id_field: &str,
        raster: &str,
        range: ValueRange,
    ) -> Result<Vec<ZoneStat>, EngineError>;

    /// Area of `band` intersected with each zone, dissolved to one value per zone.
    /// Zones with no overlap are absent from the result.
    fn inundation_area(
        &self,
        zones: &str,
        id_field: &str,
        band: &DepthBand,
        unit: AreaUnit,
    ) -> Result<Vec<ZoneStat>, EngineError>;
}
