//! Raster percentage cover (tree canopy, imperviousness).
//!
//! The zonal mean covers the whole unit, water included, so it is rescaled to a
//! 0..1 fraction and discounted by the unit's land share.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::{IngestContext, NormalizedTable};
use crate::config::{JoinKey, RasterSource, SourceConfig};
use crate::engine::ValueRange;
use crate::error::IngestError;
use crate::keyspace::{numeric_key, GeoUnit};

/// `(mean / 100) × land / (land + water)`. `None` when the unit has no area.
pub fn land_weighted_cover(mean: f64, unit: &GeoUnit) -> Option<f64> {
    unit.land_fraction().map(|fraction| mean / 100.0 * fraction)
}

pub fn ingest(
    ctx: &IngestContext<'_>,
    source: &SourceConfig,
    spec: &RasterSource,
) -> Result<NormalizedTable, IngestError> {
    let boundary = &ctx.config.boundary;
    let range = ValueRange {
        min: spec.valid_min,
        max: spec.valid_max,
    };
    debug!(raster = %spec.raster, ?range, "zonal mean");
    let stats = ctx
        .engine
        .zonal_mean(&boundary.layer, &boundary.id_field, &spec.raster, range)?;

    let mut means: HashMap<u64, f64> = HashMap::with_capacity(stats.len());
    let mut duplicates = 0usize;
    for stat in stats {
        let Some(key) = numeric_key(&stat.unit_id) else {
            continue;
        };
        if means.contains_key(&key) {
            duplicates += 1;
            continue;
        }
        means.insert(key, stat.value);
    }
    if duplicates > 0 {
        warn!(source = %source.name, duplicates, "duplicate keys; kept the first row");
    }

    let mut table = NormalizedTable::new(&source.name, JoinKey::Unit, vec![spec.indicator.name.clone()]);
    let mut no_area = 0usize;
    for unit in ctx.keyspace.units() {
        let Some(&mean) = means.get(&unit.id.key()) else {
            continue;
        };
        let value = land_weighted_cover(mean, unit);
        if value.is_none() {
            no_area += 1;
        }
        table.insert(unit.id.key(), vec![value])?;
    }

    if no_area > 0 {
        warn!(source = %source.name, units = no_area, "units with no land or water area scored as null");
    }
    let unmatched = ctx.keyspace.len() - table.len();
    if unmatched > 0 {
        debug!(source = %source.name, unmatched, "units without a zonal statistic");
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Adapter, IndicatorSpec, Orientation, PipelineConfig, DEFAULT_CONFIG};
    use crate::engine::mock::MockEngine;
    use crate::keyspace::{Keyspace, UnitId};

    fn unit(id: &str, land: f64, water: f64) -> GeoUnit {
        GeoUnit::new(UnitId::parse(id, 12).unwrap(), "Rhode Island", "Bristol", "x", land, water)
    }

    #[test]
    fn test_land_weighted_cover() {
        let value = land_weighted_cover(80.0, &unit("440010301001", 75.0, 25.0)).unwrap();
        assert!((value - 0.6).abs() < 1e-12);
        assert_eq!(land_weighted_cover(80.0, &unit("440010301001", 0.0, 0.0)), None);
    }

    fn tree_source() -> (SourceConfig, RasterSource) {
        let spec = RasterSource {
            raster: "nlcd_2016_treecanopy".to_string(),
            valid_min: 0.0,
            valid_max: 100.0,
            indicator: IndicatorSpec::new("TREE", Orientation::Descending),
        };
        let source = SourceConfig {
            name: "nlcd_tree".to_string(),
            data_source: "NLCD".to_string(),
            source_year: "2016".to_string(),
            adapter: Adapter::Raster(spec.clone()),
        };
        (source, spec)
    }

    #[test]
    fn test_duplicate_zonal_rows_keep_first() {
        let keyspace = Keyspace::from_units(vec![unit("090010301001", 100.0, 0.0)]).unwrap();
        // Same numeric key, with and without the leading zero.
        let engine = MockEngine::default()
            .zonal("nlcd_2016_treecanopy", "090010301001", 80.0)
            .zonal("nlcd_2016_treecanopy", "90010301001", 20.0);
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let ctx = IngestContext {
            config: &config,
            keyspace: &keyspace,
            engine: &engine,
            base_dir: std::path::Path::new("."),
        };
        let (source, spec) = tree_source();

        let table = ingest(&ctx, &source, &spec).unwrap();
        assert_eq!(table.len(), 1);
        assert!((table.value(90010301001, "TREE").unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_ingest_tree_canopy() {
        let keyspace = Keyspace::from_units(vec![
            unit("440010301001", 75.0, 25.0),
            unit("440010301002", 0.0, 0.0),
            unit("440010301003", 100.0, 0.0),
            unit("440010301004", 100.0, 0.0),
        ])
        .unwrap();
        let engine = MockEngine::default()
            .zonal("nlcd_2016_treecanopy", "440010301001", 80.0)
            .zonal("nlcd_2016_treecanopy", "440010301002", 50.0)
            .zonal("nlcd_2016_treecanopy", "440010301003", 255.0);
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let ctx = IngestContext {
            config: &config,
            keyspace: &keyspace,
            engine: &engine,
            base_dir: std::path::Path::new("."),
        };
        let (source, spec) = tree_source();

        let table = ingest(&ctx, &source, &spec).unwrap();
        assert!((table.value(440010301001, "TREE").unwrap() - 0.6).abs() < 1e-12);
        assert_eq!(table.value(440010301002, "TREE"), None);
        // Nodata cell filtered out by the value range: no row at all.
        assert!(!table.rows.contains_key(&440010301003));
        assert!(!table.rows.contains_key(&440010301004));
    }
}
