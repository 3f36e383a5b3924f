//! Export targets: write the assembled tables in each configured format.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{ExportFormat, ExportScope, ExportTarget, PipelineConfig};
use crate::error::ExportError;
use crate::keyspace::StudyAreaTown;
use crate::metadata;
use crate::table::{Cell, Table};

/// A file written by the run.
#[derive(Clone, Debug, PartialEq)]
pub struct Written {
    pub path: PathBuf,
    pub rows: usize,
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `table` to `path` in `format`, nulls rendered as `null_sentinel`.
pub fn write_table(
    table: &Table,
    path: &Path,
    format: ExportFormat,
    null_sentinel: Option<&str>,
) -> Result<(), ExportError> {
    match format {
        ExportFormat::Csv => table.write_delimited(path, b',', null_sentinel),
        ExportFormat::Tsv => table.write_delimited(path, b'\t', null_sentinel),
        ExportFormat::Json => table.write_json(path, null_sentinel),
    }
}

/// Write every configured target, overwriting existing files.
pub fn write_targets(
    config: &PipelineConfig,
    out_dir: &Path,
    region: &Table,
    study_area: &Table,
) -> Result<Vec<Written>, ExportError> {
    fs::create_dir_all(out_dir).map_err(io_error(out_dir))?;

    let mut written = Vec::new();
    for target in &config.output.targets {
        let table = scoped(target, region, study_area);
        let path = out_dir.join(&target.file);
        write_table(table, &path, target.format, target.null_sentinel.as_deref())?;
        info!(file = %path.display(), rows = table.len(), format = ?target.format, "wrote");
        written.push(Written {
            path: path.clone(),
            rows: table.len(),
        });

        if config.output.metadata_sidecar {
            let sidecar = metadata::sidecar_path(&path);
            metadata::write(&metadata::build(config, &target.file, table), &sidecar)?;
            written.push(Written {
                path: sidecar,
                rows: 0,
            });
        }
    }
    Ok(written)
}

fn scoped<'a>(target: &ExportTarget, region: &'a Table, study_area: &'a Table) -> &'a Table {
    match target.scope {
        ExportScope::Region => region,
        ExportScope::StudyArea => study_area,
    }
}

/// Table of study-area towns: `Town_Code`, `State`, `Town`.
pub fn town_table(towns: &[StudyAreaTown]) -> Result<Table, ExportError> {
    let mut table = Table::new(vec!["Town_Code".to_string(), "State".to_string(), "Town".to_string()]);
    for town in towns {
        table.push_row(vec![
            Cell::Text(town.code()),
            Cell::Text(town.state.clone()),
            Cell::Text(town.town.clone()),
        ])?;
    }
    Ok(table)
}

pub fn write_town_list(towns: &[StudyAreaTown], path: &Path) -> Result<Written, ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let table = town_table(towns)?;
    table.write_delimited(path, b',', None)?;
    info!(file = %path.display(), towns = table.len(), "wrote town list");
    Ok(Written {
        path: path.to_path_buf(),
        rows: table.len(),
    })
}
