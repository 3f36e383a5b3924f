//! Tabular sources (EJSCREEN, PLACES): filter to the region's states, rename
//! metric columns, keep the join key.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use super::{IngestContext, NormalizedTable};
use crate::config::{SourceConfig, TableSource};
use crate::error::IngestError;
use crate::keyspace::numeric_key;
use crate::table::{parse_number, RawTable};

pub fn ingest(
    ctx: &IngestContext<'_>,
    source: &SourceConfig,
    spec: &TableSource,
) -> Result<NormalizedTable, IngestError> {
    let path = ctx.resolve(&spec.path);
    let raw = read_source(&source.name, &path)?;

    let column = |name: &str| {
        raw.column(name).ok_or_else(|| IngestError::MissingColumn {
            source_name: source.name.clone(),
            column: name.to_string(),
            path: path.clone(),
        })
    };

    let key_idx = column(&spec.key_column)?;
    let state_idx = spec.state_column.as_deref().map(column).transpose()?;

    // Carried columns come first so they sit ahead of the indicators in the output.
    let mut names = Vec::new();
    let mut indices = Vec::new();
    for kept in &spec.keep_columns {
        indices.push(column(kept)?);
        names.push(kept.clone());
    }
    for indicator in &spec.indicators {
        indices.push(column(indicator.source_column())?);
        if indicator.column.is_some() {
            debug!(from = indicator.source_column(), to = %indicator.name, "renaming column");
        }
        names.push(indicator.name.clone());
    }

    let states: HashSet<&str> = ctx.config.region.states.iter().map(String::as_str).collect();
    let mut table = NormalizedTable::new(&source.name, spec.key, names);
    let mut bad_keys = 0usize;
    let mut duplicates = 0usize;

    for record in &raw.rows {
        if let Some(idx) = state_idx {
            let state = record.get(idx).unwrap_or("").trim();
            if !states.contains(state) {
                continue;
            }
        }
        let Some(id) = record.get(key_idx).and_then(numeric_key) else {
            bad_keys += 1;
            continue;
        };
        let values = indices
            .iter()
            .map(|&idx| record.get(idx).and_then(parse_number))
            .collect();
        if !table.insert(id, values)? {
            duplicates += 1;
        }
    }

    if bad_keys > 0 {
        warn!(source = %source.name, bad_keys, "rows with non-numeric keys were skipped");
    }
    if duplicates > 0 {
        warn!(source = %source.name, duplicates, "duplicate keys; kept the first row");
    }
    Ok(table)
}

/// Read a source CSV, mapping a missing file to a configuration error.
pub(crate) fn read_source(name: &str, path: &Path) -> Result<RawTable, IngestError> {
    if !path.exists() {
        return Err(IngestError::MissingFile {
            source_name: name.to_string(),
            path: path.to_path_buf(),
        });
    }
    RawTable::read(path).map_err(|e| IngestError::Read {
        source_name: name.to_string(),
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Adapter, IndicatorSpec, JoinKey, Orientation, PipelineConfig, DEFAULT_CONFIG};
    use crate::engine::mock::MockEngine;
    use crate::keyspace::Keyspace;
    use std::fs;

    fn epa_source(path: &str) -> SourceConfig {
        let mut lowinc = IndicatorSpec::new("LWINCPCT", Orientation::Ascending);
        lowinc.column = Some("LOWINCPCT".to_string());
        SourceConfig {
            name: "epa".to_string(),
            data_source: "EPA".to_string(),
            source_year: "2022".to_string(),
            adapter: Adapter::Table(TableSource {
                path: path.into(),
                key_column: "ID".to_string(),
                key: JoinKey::Unit,
                state_column: Some("STATE_NAME".to_string()),
                keep_columns: vec!["ACSTOTPOP".to_string()],
                indicators: vec![IndicatorSpec::new("PM25", Orientation::Ascending), lowinc],
            }),
        }
    }

    fn run(dir: &Path, source: &SourceConfig) -> Result<NormalizedTable, IngestError> {
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let keyspace = Keyspace::default();
        let engine = MockEngine::default();
        let ctx = IngestContext {
            config: &config,
            keyspace: &keyspace,
            engine: &engine,
            base_dir: dir,
        };
        match &source.adapter {
            Adapter::Table(spec) => ingest(&ctx, source, spec),
            _ => panic!("not a table source"),
        }
    }

    #[test]
    fn test_filters_states_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("epa.csv"),
            "ID,STATE_NAME,ACSTOTPOP,PM25,LOWINCPCT\n\
             440070001001,Rhode Island,1200,8.1,0.42\n\
             90010101001,Connecticut,900,7.2,\n\
             360010001001,New York,500,9.9,0.1\n\
             n/a,Rhode Island,1,1,1\n\
             440070001001,Rhode Island,1,1,1\n",
        )
        .unwrap();

        let table = run(dir.path(), &epa_source("epa.csv")).unwrap();
        assert_eq!(table.columns, vec!["ACSTOTPOP", "PM25", "LWINCPCT"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.value(440070001001, "PM25"), Some(8.1));
        assert_eq!(table.value(440070001001, "ACSTOTPOP"), Some(1200.0));
        assert_eq!(table.value(90010101001, "LWINCPCT"), None);
        assert!(!table.rows.contains_key(&360010001001));
    }

    #[test]
    fn test_missing_column_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("epa.csv"), "ID,STATE_NAME,ACSTOTPOP,PM25\n1,Rhode Island,1,1\n").unwrap();
        let err = run(dir.path(), &epa_source("epa.csv")).unwrap_err();
        assert!(matches!(err, IngestError::MissingColumn { ref column, .. } if column == "LOWINCPCT"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(dir.path(), &epa_source("absent.csv")).unwrap_err();
        assert!(matches!(err, IngestError::MissingFile { .. }));
    }
}
