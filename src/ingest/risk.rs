//! Risk-factor aggregation (First Street flood and heat).
//!
//! Each row counts properties in risk buckets 1..=10. The score is the
//! property-weighted mean bucket: `Σ i·count_i / count_property`.

use std::collections::HashSet;

use tracing::warn;

use super::tabular::read_source;
use super::{IngestContext, NormalizedTable};
use crate::config::{RiskFactorSource, SourceConfig};
use crate::error::IngestError;
use crate::keyspace::numeric_key;
use crate::table::parse_number;

/// Number of risk buckets in a First Street summary.
pub const RISK_FACTORS: usize = 10;

/// Mean risk bucket. `None` when there are no properties to average over.
///
/// Null bucket counts contribute nothing.
pub fn risk_score(counts: &[Option<f64>], property_count: Option<f64>) -> Option<f64> {
    let properties = property_count?;
    if properties <= 0.0 {
        return None;
    }
    let weighted: f64 = counts
        .iter()
        .enumerate()
        .map(|(i, count)| (i + 1) as f64 * count.unwrap_or(0.0))
        .sum();
    Some(weighted / properties)
}

pub fn ingest(
    ctx: &IngestContext<'_>,
    source: &SourceConfig,
    spec: &RiskFactorSource,
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

    let metric = spec.metric.to_lowercase();
    let key_idx = column(&spec.key_column)?;
    let property_idx = column("count_property")?;
    let state_idx = spec.state_column.as_deref().map(column).transpose()?;
    let factor_idx = (1..=RISK_FACTORS)
        .map(|i| column(&format!("count_{}factor{}", metric, i)))
        .collect::<Result<Vec<_>, _>>()?;

    let states: HashSet<&str> = ctx.config.region.states.iter().map(String::as_str).collect();
    let mut table = NormalizedTable::new(&source.name, spec.key, vec![spec.indicator.name.clone()]);
    let mut no_properties = 0usize;
    let mut bad_keys = 0usize;
    let mut duplicates = 0usize;

    for record in &raw.rows {
        if let Some(idx) = state_idx {
            if !states.contains(record.get(idx).unwrap_or("").trim()) {
                continue;
            }
        }
        let Some(id) = record.get(key_idx).and_then(numeric_key) else {
            bad_keys += 1;
            continue;
        };
        let counts: Vec<Option<f64>> = factor_idx
            .iter()
            .map(|&idx| record.get(idx).and_then(parse_number))
            .collect();
        let score = risk_score(&counts, record.get(property_idx).and_then(parse_number));
        if score.is_none() {
            no_properties += 1;
        }
        if !table.insert(id, vec![score])? {
            duplicates += 1;
        }
    }

    if no_properties > 0 {
        warn!(source = %source.name, rows = no_properties, "rows with no property count scored as null");
    }
    if bad_keys > 0 {
        warn!(source = %source.name, bad_keys, "rows with non-numeric keys were skipped");
    }
    if duplicates > 0 {
        warn!(source = %source.name, duplicates, "duplicate keys; kept the first row");
    }
    Ok(table)
}
