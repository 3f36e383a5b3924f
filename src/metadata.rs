//! Metadata sidecar written next to each exported table.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::assemble::citations;
use crate::config::PipelineConfig;
use crate::error::ExportError;
use crate::table::{Cell, Table};

/// Text fields shorter than this get the minimum width.
const MIN_TEXT_WIDTH: usize = 30;

/// Legacy text-field width: 30, or the content length plus 5 when longer.
pub fn text_field_width(longest: usize) -> usize {
    if longest > MIN_TEXT_WIDTH {
        longest + 5
    } else {
        MIN_TEXT_WIDTH
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputMetadata {
    pub title: String,
    pub file: String,
    pub summary: String,
    pub description: String,
    pub credits: String,
    pub access_constraints: String,
    pub tags: Vec<String>,
    pub data_source: String,
    pub source_year: String,
    pub row_count: usize,
    pub lineage: Vec<LineageStep>,
    pub fields: Vec<FieldInfo>,
    pub generated: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LineageStep {
    pub source: String,
    pub data_source: String,
    pub source_year: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Present for text fields only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Double,
    Integer,
}

/// `<prefix>_<indicator year>_<program><reporting year>`, e.g. `EJMETRICS_2023_NBEP2023`.
pub fn title(config: &PipelineConfig) -> String {
    let md = &config.metadata;
    format!(
        "{}_{}_{}{}",
        md.title_prefix, md.indicator_year, md.program, config.output.reporting_year
    )
}

/// Describe each column by the cells it holds.
pub fn describe_fields(table: &Table) -> Vec<FieldInfo> {
    table
        .columns()
        .iter()
        .enumerate()
        .map(|(col, name)| {
            let cells = table.rows().iter().map(|row| &row[col]);
            let mut field_type = FieldType::Double;
            let mut longest = 0usize;
            for cell in cells {
                match cell {
                    Cell::Text(s) => {
                        field_type = FieldType::Text;
                        longest = longest.max(s.chars().count());
                    }
                    Cell::Integer(_) if field_type == FieldType::Double => field_type = FieldType::Integer,
                    _ => {}
                }
            }
            FieldInfo {
                name: name.clone(),
                field_type,
                width: (field_type == FieldType::Text).then(|| text_field_width(longest)),
            }
        })
        .collect()
}

pub fn build(config: &PipelineConfig, file: &str, table: &Table) -> OutputMetadata {
    let md = &config.metadata;
    let (data_source, source_year) = citations(config);
    let lineage = std::iter::once(LineageStep {
        source: config.boundary.layer.clone(),
        data_source: config.boundary.data_source.clone(),
        source_year: config.boundary.source_year.clone(),
    })
    .chain(config.joins.iter().map(|j| LineageStep {
        source: j.layer.clone(),
        data_source: j.data_source.clone(),
        source_year: j.source_year.clone(),
    }))
    .chain(config.sources.iter().map(|s| LineageStep {
        source: s.name.clone(),
        data_source: s.data_source.clone(),
        source_year: s.source_year.clone(),
    }))
    .collect();

    OutputMetadata {
        title: title(config),
        file: file.to_string(),
        summary: md.summary.clone(),
        description: md.description.clone(),
        credits: md.credits.clone(),
        access_constraints: md.access_constraints.clone(),
        tags: md.tags.clone(),
        data_source,
        source_year,
        row_count: table.len(),
        lineage,
        fields: describe_fields(table),
        generated: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

/// Sidecar path: `<output>.metadata.json`.
pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".metadata.json");
    output.with_file_name(name)
}

pub fn write(metadata: &OutputMetadata, path: &Path) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, metadata).map_err(|e| ExportError::Serialization {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    writer.flush().map_err(io_err)
}
