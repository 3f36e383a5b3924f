//! Sea-level rise: share of a unit's land inundated at a target rise.
//!
//! Depth layers exist only for whole feet, so a fractional target is interpolated
//! from the two bracketing non-overlapping bands.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::{IngestContext, NormalizedTable};
use crate::config::{JoinKey, SeaLevelSource, SourceConfig};
use crate::engine::{AreaUnit, DepthBand};
use crate::error::IngestError;
use crate::keyspace::numeric_key;

/// Bands to query for a target depth and the weight of each.
pub fn band_weights(prefix: &str, target_depth_ft: f64) -> Vec<(DepthBand, f64)> {
    let floor = target_depth_ft.floor();
    let fraction = target_depth_ft - floor;
    let floor = floor as u32;
    let mut bands = vec![(DepthBand::non_overlapping(prefix, floor), 1.0)];
    if fraction > 0.0 {
        bands.push((DepthBand::non_overlapping(prefix, floor + 1), fraction));
    }
    bands
}

/// Inundated fraction of land. `None` when the unit has no land.
pub fn inundated_fraction(inundated_area: f64, land_area: f64) -> Option<f64> {
    (land_area > 0.0).then(|| inundated_area / land_area)
}

pub fn ingest(
    ctx: &IngestContext<'_>,
    source: &SourceConfig,
    spec: &SeaLevelSource,
) -> Result<NormalizedTable, IngestError> {
    let boundary = &ctx.config.boundary;
    let mut inundated: HashMap<u64, f64> = HashMap::new();

    for (band, weight) in band_weights(&spec.layer_prefix, spec.target_depth_ft) {
        debug!(layer = %band.layer, erase = ?band.erase, weight, "inundation band");
        let areas = ctx
            .engine
            .inundation_area(&boundary.layer, &boundary.id_field, &band, AreaUnit::SquareMeters)?;
        for stat in areas {
            if let Some(key) = numeric_key(&stat.unit_id) {
                *inundated.entry(key).or_insert(0.0) += weight * stat.value;
            }
        }
    }

    let mut table = NormalizedTable::new(&source.name, JoinKey::Unit, vec![spec.indicator.name.clone()]);
    let mut no_land = 0usize;
    for unit in ctx.keyspace.units() {
        // A unit absent from every band has no inundation.
        let area = inundated.get(&unit.id.key()).copied().unwrap_or(0.0);
        let value = inundated_fraction(area, unit.land_area);
        if value.is_none() {
            no_land += 1;
        }
        table.insert(unit.id.key(), vec![value])?;
    }

    if no_land > 0 {
        warn!(source = %source.name, units = no_land, "units with no land area scored as null");
    }
    Ok(table)
}
