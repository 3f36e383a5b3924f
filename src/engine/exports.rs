//! Engine backed by tables exported from a desktop GIS.
//!
//! The operator runs the geometric steps in their GIS and exports each result as
//! CSV into one directory. File names are derived from the request:
//!
//! - boundary layer: `<layer>.csv`
//! - spatial join: `join_<target>_<join>.csv` (one row per overlapping feature,
//!   optional `overlap_area` column)
//! - zonal mean: `zonal_<raster>.csv` with a `MEAN` column
//! - inundation band: `slr_<layer>.csv` or `slr_<layer>_minus_<erase>.csv` with an
//!   `AREA_SQM` or `AREA_ACRES` column (rows per zone are summed, i.e. dissolved)

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{
    AreaUnit, BoundaryRecord, DepthBand, GeoEngine, JoinedRecord, SpatialJoinRequest, ValueRange,
    ZoneStat,
};
use crate::config::{BoundaryConfig, MatchOption, MergeRule};
use crate::error::EngineError;
use crate::table::{parse_number, RawTable};

const OVERLAP_COLUMN: &str = "overlap_area";
const MEAN_COLUMN: &str = "MEAN";
const AREA_SQM_COLUMN: &str = "AREA_SQM";
const AREA_ACRES_COLUMN: &str = "AREA_ACRES";

/// Reads engine results from an exports directory.
pub struct ExportDirEngine {
    dir: PathBuf,
}

impl ExportDirEngine {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn open(&self, file: &str) -> Result<RawTable, EngineError> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Err(EngineError::MissingExport(path));
        }
        debug!(path = %path.display(), "reading engine export");
        RawTable::read(&path).map_err(|e| EngineError::Read {
            path: path.clone(),
            message: e.to_string(),
        })
    }
}

fn require(table: &RawTable, column: &str) -> Result<usize, EngineError> {
    table.column(column).ok_or_else(|| EngineError::MissingColumn {
        path: table.path.clone(),
        column: column.to_string(),
    })
}

/// Pick or merge the candidate rows for one unit according to the join rules.
fn resolve_join(
    candidates: &[(f64, BTreeMap<String, String>)],
    match_option: MatchOption,
    merge_rule: &MergeRule,
    fields: &[String],
) -> BTreeMap<String, String> {
    match merge_rule {
        MergeRule::Join { delimiter } => {
            let mut merged = BTreeMap::new();
            for field in fields {
                let mut values: Vec<&str> = Vec::new();
                for (_, row) in candidates {
                    if let Some(v) = row.get(field) {
                        if !v.is_empty() && !values.contains(&v.as_str()) {
                            values.push(v);
                        }
                    }
                }
                if !values.is_empty() {
                    merged.insert(field.clone(), values.join(delimiter));
                }
            }
            merged
        }
        MergeRule::First => {
            let chosen = match match_option {
                MatchOption::FirstIntersect => candidates.first(),
                // Ties keep the earlier row.
                MatchOption::LargestOverlap => candidates
                    .iter()
                    .fold(None, |best: Option<&(f64, BTreeMap<String, String>)>, c| match best {
                        Some(b) if b.0 >= c.0 => Some(b),
                        _ => Some(c),
                    }),
            };
            chosen.map(|(_, row)| row.clone()).unwrap_or_default()
        }
    }
}

impl GeoEngine for ExportDirEngine {
    fn boundary(&self, boundary: &BoundaryConfig) -> Result<Vec<BoundaryRecord>, EngineError> {
        let table = self.open(&format!("{}.csv", boundary.layer))?;
        let id = require(&table, &boundary.id_field)?;
        let land = require(&table, &boundary.land_field)?;
        let water = require(&table, &boundary.water_field)?;

        Ok(table
            .rows
            .iter()
            .map(|row| BoundaryRecord {
                unit_id: row.get(id).unwrap_or("").trim().to_string(),
                land_area: row.get(land).and_then(parse_number),
                water_area: row.get(water).and_then(parse_number),
            })
            .collect())
    }

    fn spatial_join(&self, request: &SpatialJoinRequest<'_>) -> Result<Vec<JoinedRecord>, EngineError> {
        let table = self.open(&format!("join_{}_{}.csv", request.target, request.join))?;
        let id = require(&table, request.id_field)?;
        let field_idx = request
            .fields
            .iter()
            .map(|f| require(&table, f).map(|i| (f.clone(), i)))
            .collect::<Result<Vec<_>, _>>()?;
        let overlap = table.column(OVERLAP_COLUMN);
        if overlap.is_none() && request.match_option == MatchOption::LargestOverlap {
            debug!(join = request.join, "no overlap column, largest overlap falls back to first row");
        }

        // Keep first-seen order of units.
        let mut order: Vec<String> = Vec::new();
        let mut candidates: HashMap<String, Vec<(f64, BTreeMap<String, String>)>> = HashMap::new();
        for row in &table.rows {
            let unit = row.get(id).unwrap_or("").trim().to_string();
            if unit.is_empty() {
                continue;
            }
            let area = overlap
                .and_then(|i| row.get(i))
                .and_then(parse_number)
                .unwrap_or(0.0);
            let fields = field_idx
                .iter()
                .filter_map(|(name, i)| {
                    let v = row.get(*i)?.trim();
                    (!v.is_empty()).then(|| (name.clone(), v.to_string()))
                })
                .collect();
            let entry = candidates.entry(unit.clone()).or_default();
            if entry.is_empty() {
                order.push(unit);
            }
            entry.push((area, fields));
        }

        Ok(order
            .into_iter()
            .map(|unit| {
                let rows = candidates.remove(&unit).unwrap_or_default();
                JoinedRecord {
                    fields: resolve_join(&rows, request.match_option, request.merge_rule, request.fields),
                    unit_id: unit,
                }
            })
            .collect())
    }

    fn zonal_mean(
        &self,
        _zones: &str,
        id_field: &str,
        raster: &str,
        range: ValueRange,
    ) -> Result<Vec<ZoneStat>, EngineError> {
        let table = self.open(&format!("zonal_{}.csv", raster))?;
        let id = require(&table, id_field)?;
        let mean = require(&table, MEAN_COLUMN)?;

        let mut stats = Vec::with_capacity(table.rows.len());
        let mut out_of_range = 0usize;
        for row in &table.rows {
            let Some(value) = row.get(mean).and_then(parse_number) else {
                continue;
            };
            // A mean outside the valid range means nodata cells leaked into the zone.
            if !range.contains(value) {
                out_of_range += 1;
                continue;
            }
            stats.push(ZoneStat {
                unit_id: row.get(id).unwrap_or("").trim().to_string(),
                value,
            });
        }
        if out_of_range > 0 {
            warn!(raster, out_of_range, "dropped zonal means outside the valid value range");
        }
        Ok(stats)
    }

    fn inundation_area(
        &self,
        _zones: &str,
        id_field: &str,
        band: &DepthBand,
        unit: AreaUnit,
    ) -> Result<Vec<ZoneStat>, EngineError> {
        let file = match &band.erase {
            Some(erase) => format!("slr_{}_minus_{}.csv", band.layer, erase),
            None => format!("slr_{}.csv", band.layer),
        };
        let table = self.open(&file)?;
        let id = require(&table, id_field)?;
        let (area, area_unit) = match (table.column(AREA_SQM_COLUMN), table.column(AREA_ACRES_COLUMN)) {
            (Some(i), _) => (i, AreaUnit::SquareMeters),
            (None, Some(i)) => (i, AreaUnit::Acres),
            (None, None) => {
                return Err(EngineError::MissingColumn {
                    path: table.path.clone(),
                    column: AREA_SQM_COLUMN.to_string(),
                })
            }
        };

        let mut order: Vec<String> = Vec::new();
        let mut totals: HashMap<String, f64> = HashMap::new();
        for row in &table.rows {
            let zone = row.get(id).unwrap_or("").trim().to_string();
            let Some(value) = row.get(area).and_then(parse_number) else {
                continue;
            };
            if zone.is_empty() {
                continue;
            }
            let total = totals.entry(zone.clone()).or_insert_with(|| {
                order.push(zone.clone());
                0.0
            });
            *total += unit.convert(value, area_unit);
        }

        Ok(order
            .into_iter()
            .map(|zone| ZoneStat {
                value: totals[&zone],
                unit_id: zone,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn boundary_config() -> BoundaryConfig {
        BoundaryConfig {
            layer: "block_groups".to_string(),
            id_field: "GEOID".to_string(),
            land_field: "ALAND".to_string(),
            water_field: "AWATER".to_string(),
            state_field: "State".to_string(),
            town_field: "Town".to_string(),
            study_area_field: "Study_Area".to_string(),
            data_source: "Census".to_string(),
            source_year: "2022".to_string(),
        }
    }

    #[test]
    fn test_boundary_keeps_leading_zeros() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("block_groups.csv"),
            "GEOID,ALAND,AWATER\n090010101001,1000,0\n440070001001,500,25\n",
        )
        .unwrap();

        let engine = ExportDirEngine::new(dir.path());
        let records = engine.boundary(&boundary_config()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].unit_id, "090010101001");
        assert_eq!(records[1].water_area, Some(25.0));
    }

    #[test]
    fn test_missing_export_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExportDirEngine::new(dir.path());
        let err = engine.boundary(&boundary_config()).unwrap_err();
        assert!(matches!(err, EngineError::MissingExport(_)));
    }

    #[test]
    fn test_spatial_join_largest_overlap() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("join_block_groups_towns.csv"),
            "GEOID,Town,State,overlap_area\n\
             440070001001,Providence,Rhode Island,10\n\
             440070001001,Cranston,Rhode Island,90\n\
             440070001002,Providence,Rhode Island,5\n",
        )
        .unwrap();

        let engine = ExportDirEngine::new(dir.path());
        let fields = vec!["Town".to_string(), "State".to_string()];
        let rule = MergeRule::First;
        let joined = engine
            .spatial_join(&SpatialJoinRequest {
                target: "block_groups",
                join: "towns",
                id_field: "GEOID",
                match_option: MatchOption::LargestOverlap,
                merge_rule: &rule,
                fields: &fields,
            })
            .unwrap();

        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].fields["Town"], "Cranston");
        assert_eq!(joined[1].fields["Town"], "Providence");
    }

    #[test]
    fn test_spatial_join_field_concatenation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("join_block_groups_watersheds.csv"),
            "GEOID,name\n440070001001,Blackstone\n440070001001,Pawtuxet\n440070001001,Blackstone\n",
        )
        .unwrap();

        let engine = ExportDirEngine::new(dir.path());
        let fields = vec!["name".to_string()];
        let rule = MergeRule::Join { delimiter: "; ".to_string() };
        let joined = engine
            .spatial_join(&SpatialJoinRequest {
                target: "block_groups",
                join: "watersheds",
                id_field: "GEOID",
                match_option: MatchOption::FirstIntersect,
                merge_rule: &rule,
                fields: &fields,
            })
            .unwrap();

        assert_eq!(joined[0].fields["name"], "Blackstone; Pawtuxet");
    }

    #[test]
    fn test_zonal_mean_drops_nodata() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("zonal_nlcd_tree.csv"),
            "GEOID,MEAN\n440070001001,42.5\n440070001002,255\n",
        )
        .unwrap();

        let engine = ExportDirEngine::new(dir.path());
        let stats = engine
            .zonal_mean("block_groups", "GEOID", "nlcd_tree", ValueRange { min: 0.0, max: 100.0 })
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].value, 42.5);
    }

    #[test]
    fn test_inundation_area_dissolves_and_converts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("slr_slr_2ft_minus_slr_1ft.csv"),
            "GEOID,AREA_ACRES\n440070001001,1\n440070001001,2\n440070001002,0.5\n",
        )
        .unwrap();

        let engine = ExportDirEngine::new(dir.path());
        let band = DepthBand::non_overlapping("slr", 2);
        let areas = engine
            .inundation_area("block_groups", "GEOID", &band, AreaUnit::Acres)
            .unwrap();
        assert_eq!(areas.len(), 2);
        assert!((areas[0].value - 3.0).abs() < 1e-9);

        let sqm = engine
            .inundation_area("block_groups", "GEOID", &band, AreaUnit::SquareMeters)
            .unwrap();
        assert!((sqm[1].value - 0.5 * super::super::SQ_METERS_PER_ACRE).abs() < 1e-6);
    }
}
