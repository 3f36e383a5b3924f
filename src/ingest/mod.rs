//! Indicator ingestion.
//!
//! Each adapter turns one declared source into a `NormalizedTable`: a join key
//! plus one numeric column per indicator (and any carried columns). Adapters never
//! see each other's output; assembly merges them onto the keyspace afterwards.

pub mod raster;
pub mod risk;
pub mod sea_level;
pub mod tabular;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{Adapter, JoinKey, PipelineConfig, SourceConfig};
use crate::engine::GeoEngine;
use crate::error::IngestError;
use crate::keyspace::Keyspace;

/// Values of one source, keyed by unit or parent id.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedTable {
    pub source: String,
    pub key: JoinKey,
    /// Output column names, in order.
    pub columns: Vec<String>,
    /// One value per column for each key. `None` is a null cell.
    pub rows: HashMap<u64, Vec<Option<f64>>>,
}

impl NormalizedTable {
    pub fn new(source: &str, key: JoinKey, columns: Vec<String>) -> Self {
        Self {
            source: source.to_string(),
            key,
            columns,
            rows: HashMap::new(),
        }
    }

    /// Insert a row unless the key is already present. Returns false on a duplicate.
    ///
    /// A row whose width differs from the column list is rejected.
    pub fn insert(&mut self, key: u64, values: Vec<Option<f64>>) -> Result<bool, IngestError> {
        if values.len() != self.columns.len() {
            return Err(IngestError::RowWidth {
                source_name: self.source.clone(),
                key,
                expected: self.columns.len(),
                actual: values.len(),
            });
        }
        if self.rows.contains_key(&key) {
            return Ok(false);
        }
        self.rows.insert(key, values);
        Ok(true)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of `column` for `key`; `None` for an absent row or a null cell.
    pub fn value(&self, key: u64, column: &str) -> Option<f64> {
        let idx = self.column_index(column)?;
        self.rows.get(&key).and_then(|row| row[idx])
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Everything an adapter may read.
pub struct IngestContext<'a> {
    pub config: &'a PipelineConfig,
    pub keyspace: &'a Keyspace,
    pub engine: &'a dyn GeoEngine,
    /// Relative source paths are resolved against this directory.
    pub base_dir: &'a Path,
}

impl IngestContext<'_> {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// Run the adapter declared for `source`.
pub fn ingest_source(
    ctx: &IngestContext<'_>,
    source: &SourceConfig,
) -> Result<NormalizedTable, IngestError> {
    info!(source = %source.name, "ingesting");
    let table = match &source.adapter {
        Adapter::Table(spec) => tabular::ingest(ctx, source, spec)?,
        Adapter::RiskFactor(spec) => risk::ingest(ctx, source, spec)?,
        Adapter::Raster(spec) => raster::ingest(ctx, source, spec)?,
        Adapter::SeaLevel(spec) => sea_level::ingest(ctx, source, spec)?,
    };
    info!(source = %source.name, rows = table.len(), columns = table.columns.len(), "ingested");
    Ok(table)
}

/// Ingest every declared source in order.
pub fn ingest_all(ctx: &IngestContext<'_>) -> Result<Vec<NormalizedTable>, IngestError> {
    ctx.config
        .sources
        .iter()
        .map(|source| ingest_source(ctx, source))
        .collect()
}
