//! Assembly: left-join every normalized source onto the keyspace, then lay out
//! the wide output table.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::config::{JoinKey, MissingValue, PipelineConfig};
use crate::error::ExportError;
use crate::ingest::NormalizedTable;
use crate::keyspace::{GeoUnit, Keyspace};
use crate::percentile::{IndicatorColumns, SchemeColumns};
use crate::table::{Cell, Table};

/// Numeric columns aligned with the keyspace, in merge order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Merged {
    order: Vec<String>,
    columns: HashMap<String, Vec<Option<f64>>>,
}

impl Merged {
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    fn push(&mut self, name: String, values: Vec<Option<f64>>) {
        if !self.columns.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.columns.insert(name, values);
    }
}

impl IndicatorColumns for Merged {
    fn indicator(&self, name: &str) -> Option<&[Option<f64>]> {
        self.get(name)
    }
}

fn join_key(unit: &GeoUnit, key: JoinKey) -> u64 {
    match key {
        JoinKey::Unit => unit.id.key(),
        JoinKey::Parent => unit.parent.0,
    }
}

/// Left-join each table onto the keyspace by its declared key.
///
/// Units with no row in a source stay null, except for indicators declared
/// `missing = "zero"`, which are filled once every table is merged. A null the
/// adapter produced itself (no land area, no properties) is kept.
pub fn merge(config: &PipelineConfig, keyspace: &Keyspace, tables: &[NormalizedTable]) -> Merged {
    let mut merged = Merged::default();
    let mut absent: HashMap<String, Vec<bool>> = HashMap::new();

    for table in tables {
        let mut matched = 0usize;
        let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(keyspace.len()); table.columns.len()];
        let mut missing_rows = Vec::with_capacity(keyspace.len());
        for unit in keyspace.units() {
            let row = table.rows.get(&join_key(unit, table.key));
            if row.is_some() {
                matched += 1;
            }
            missing_rows.push(row.is_none());
            for (idx, column) in columns.iter_mut().enumerate() {
                column.push(row.and_then(|values| values.get(idx).copied().flatten()));
            }
        }
        debug!(source = %table.source, matched, units = keyspace.len(), "merged");
        for (name, values) in table.columns.iter().zip(columns) {
            absent.insert(name.clone(), missing_rows.clone());
            merged.push(name.clone(), values);
        }
    }

    for (_, indicator) in config.indicators() {
        if indicator.missing != MissingValue::Zero {
            continue;
        }
        let (Some(values), Some(rows)) = (merged.columns.get_mut(&indicator.name), absent.get(&indicator.name)) else {
            continue;
        };
        let mut filled = 0usize;
        for (value, &missing) in values.iter_mut().zip(rows) {
            if missing && value.is_none() {
                *value = Some(0.0);
                filled += 1;
            }
        }
        debug!(indicator = %indicator.name, filled, "zero-filled absent rows");
    }
    merged
}

/// `DataSource` and `SourceYear` text: each distinct citation once, in declaration order.
pub fn citations(config: &PipelineConfig) -> (String, String) {
    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    let mut years = Vec::new();
    let declared = config
        .sources
        .iter()
        .map(|s| (s.data_source.as_str(), s.source_year.as_str()))
        .chain(config.joins.iter().map(|j| (j.data_source.as_str(), j.source_year.as_str())));
    for (source, year) in declared {
        if seen.insert((source, year)) {
            sources.push(source);
            years.push(year);
        }
    }
    let output = &config.output;
    (
        output.data_source.clone().unwrap_or_else(|| sources.join("; ")),
        output.source_year.clone().unwrap_or_else(|| years.join("; ")),
    )
}

/// Output column names in export order.
pub fn column_layout(config: &PipelineConfig, percentiles: &[SchemeColumns]) -> Vec<String> {
    let mut columns = vec!["ID".to_string(), "State".to_string(), "Town".to_string()];
    columns.extend(config.output.attribute_columns.iter().cloned());
    for source in &config.sources {
        columns.extend(source.keep_columns().iter().cloned());
    }
    columns.extend(config.indicators().into_iter().map(|(_, i)| i.name.clone()));
    for scheme in percentiles {
        columns.extend(scheme.columns.iter().map(|(name, _)| name.clone()));
    }
    columns.extend([
        "Study_Area".to_string(),
        "DataSource".to_string(),
        "SourceYear".to_string(),
        config.output.year_column.clone(),
    ]);
    columns
}

/// Build the region table: one row per keyspace unit.
pub fn region_table(
    config: &PipelineConfig,
    keyspace: &Keyspace,
    merged: &Merged,
    percentiles: &[SchemeColumns],
) -> Result<Table, ExportError> {
    let (data_source, source_year) = citations(config);
    let numeric: Vec<&[Option<f64>]> = config
        .sources
        .iter()
        .flat_map(|s| s.keep_columns().iter().map(String::as_str))
        .chain(config.indicators().into_iter().map(|(_, i)| i.name.as_str()))
        .map(|name| merged.get(name).unwrap_or(&[]))
        .chain(percentiles.iter().flat_map(|s| s.columns.iter().map(|(_, v)| v.as_slice())))
        .collect();

    let mut table = Table::new(column_layout(config, percentiles));
    for (idx, unit) in keyspace.units().iter().enumerate() {
        let mut row = Vec::with_capacity(table.columns().len());
        row.push(Cell::Text(unit.id.to_string()));
        row.push(Cell::Text(unit.state.clone()));
        row.push(Cell::Text(unit.town.clone()));
        for attribute in &config.output.attribute_columns {
            row.push(
                unit.attributes
                    .get(attribute)
                    .map_or(Cell::Null, |v| Cell::Text(v.clone())),
            );
        }
        for column in &numeric {
            row.push(Cell::from_option(column.get(idx).copied().flatten()));
        }
        row.push(Cell::Text(unit.study_area.clone()));
        row.push(Cell::Text(data_source.clone()));
        row.push(Cell::Text(source_year.clone()));
        row.push(Cell::Integer(i64::from(config.output.reporting_year)));
        table.push_row(row)?;
    }
    info!(rows = table.len(), columns = table.columns().len(), "assembled region table");
    Ok(table)
}

/// Rows of `region` in any town that has at least one unit inside the study area.
pub fn study_area_table(config: &PipelineConfig, keyspace: &Keyspace, region: &Table) -> Table {
    let codes: HashSet<String> = keyspace
        .study_area_towns(&config.study_area)
        .iter()
        .map(|t| t.code())
        .collect();
    let (Some(state), Some(town)) = (region.column("State"), region.column("Town")) else {
        return region.filter(|_| false);
    };
    let subset = region.filter(|row| {
        let code = format!(
            "{}{}",
            row[state].as_text().unwrap_or(""),
            row[town].as_text().unwrap_or("")
        );
        codes.contains(&code)
    });
    info!(towns = codes.len(), rows = subset.len(), "selected study-area towns");
    subset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG;
    use crate::keyspace::UnitId;

    fn keyspace() -> Keyspace {
        let mk = |id: &str, state: &str, town: &str, area: &str| {
            GeoUnit::new(UnitId::parse(id, 12).unwrap(), state, town, area, 100.0, 0.0)
        };
        Keyspace::from_units(vec![
            mk("440070001001", "Rhode Island", "Providence", "Narragansett Bay Watershed"),
            mk("440070001002", "Rhode Island", "Providence", "Outside Study Area"),
            mk("090010101001", "Connecticut", "Greenwich", "Outside Study Area"),
        ])
        .unwrap()
    }

    #[test]
    fn test_merge_by_unit_and_parent() {
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let keyspace = keyspace();

        let mut epa = NormalizedTable::new("epa", JoinKey::Unit, vec!["PM25".to_string()]);
        epa.insert(440070001001, vec![Some(8.0)]).unwrap();
        epa.insert(90010101001, vec![None]).unwrap();
        let mut cdc = NormalizedTable::new("cdc", JoinKey::Parent, vec!["ASTHMA".to_string()]);
        cdc.insert(44007000100, vec![Some(11.5)]).unwrap();
        let mut slr = NormalizedTable::new("noaa_slr", JoinKey::Unit, vec!["SLR".to_string()]);
        slr.insert(440070001001, vec![Some(0.2)]).unwrap();
        slr.insert(440070001002, vec![None]).unwrap();

        let merged = merge(&config, &keyspace, &[epa, cdc, slr]);
        assert_eq!(merged.names(), &["PM25", "ASTHMA", "SLR"]);
        assert_eq!(merged.get("PM25").unwrap(), &[Some(8.0), None, None]);
        // Both block groups of the tract receive the tract value.
        assert_eq!(merged.get("ASTHMA").unwrap(), &[Some(11.5), Some(11.5), None]);
        // Absent row zero-filled, adapter null kept.
        assert_eq!(merged.get("SLR").unwrap(), &[Some(0.2), None, Some(0.0)]);
    }

    #[test]
    fn test_citations_dedupe_in_order() {
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let (sources, years) = citations(&config);
        assert!(sources.starts_with("EPA; CDC; NLCD, USFS; NLCD; NOAA; First Street; MassGIS"));
        assert_eq!(sources.matches("First Street").count(), 1);
        assert!(years.starts_with("2016-2020, 2022; 2019, 2020; 2016; 2019; 2019; 2022"));
    }

    #[test]
    fn test_citation_override() {
        let mut config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        config.output.data_source = Some("EPA; CDC".to_string());
        assert_eq!(citations(&config).0, "EPA; CDC");
    }

    #[test]
    fn test_column_layout() {
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let schemes = vec![
            SchemeColumns { columns: vec![("P_PM25".to_string(), vec![])] },
            SchemeColumns { columns: vec![("N_PM25".to_string(), vec![])] },
        ];
        let columns = column_layout(&config, &schemes);
        assert_eq!(&columns[..4], &["ID", "State", "Town", "ACSTOTPOP"]);
        assert_eq!(columns[4], "MINORPCT");
        let p = columns.iter().position(|c| c == "P_PM25").unwrap();
        let n = columns.iter().position(|c| c == "N_PM25").unwrap();
        assert!(p < n);
        assert_eq!(&columns[columns.len() - 4..], &["Study_Area", "DataSource", "SourceYear", "NBEPYear"]);
    }

    #[test]
    fn test_region_and_study_area_tables() {
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let keyspace = keyspace();
        let mut epa = NormalizedTable::new("epa", JoinKey::Unit, vec!["PM25".to_string()]);
        epa.insert(440070001001, vec![Some(8.0)]).unwrap();
        let merged = merge(&config, &keyspace, &[epa]);

        let region = region_table(&config, &keyspace, &merged, &[]).unwrap();
        assert_eq!(region.len(), 3);
        assert_eq!(region.get(2, "ID"), Some(&Cell::Text("090010101001".to_string())));
        assert_eq!(region.get(0, "PM25"), Some(&Cell::Number(8.0)));
        assert_eq!(region.get(1, "PM25"), Some(&Cell::Null));
        assert_eq!(region.get(0, "NBEPYear"), Some(&Cell::Integer(2023)));

        // Providence has one unit in the study area, so both Providence rows are kept.
        let subset = study_area_table(&config, &keyspace, &region);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.get(1, "Study_Area"), Some(&Cell::Text("Outside Study Area".to_string())));
    }
}
