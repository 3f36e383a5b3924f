//! Tabular I/O.
//!
//! `RawTable` is a thin wrapper over a CSV file used by the engine and the
//! ingestion adapters. `Table` is the assembled output: ordered columns, typed
//! cells, and an explicit null that is only turned into a sentinel at write time.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::error::ExportError;

/// Parse a numeric cell. Blank, non-numeric and non-finite text is `None`.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// A CSV file read fully into memory, cells kept as text.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub path: PathBuf,
    pub headers: Vec<String>,
    pub rows: Vec<csv::StringRecord>,
}

impl RawTable {
    pub fn read(path: &Path) -> Result<Self, csv::Error> {
        Self::read_with_delimiter(path, b',')
    }

    pub fn read_with_delimiter(path: &Path, delimiter: u8) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_path(path)?;
        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();
        let rows = reader.records().collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            path: path.to_path_buf(),
            headers,
            rows,
        })
    }

    /// Index of a header, if present.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// One value in the output table.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Integer(i64),
    Null,
}

impl Cell {
    pub fn from_option(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => Cell::Number(v),
            _ => Cell::Null,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(v) => Some(*v),
            Cell::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Text form used by delimited writers.
    fn render(&self, null_sentinel: Option<&str>) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(v) => format_number(*v),
            Cell::Integer(v) => v.to_string(),
            Cell::Null => null_sentinel.unwrap_or("").to_string(),
        }
    }
}

/// Floats always carry a decimal point (`57.0`, `0.38`), matching what the
/// historical outputs contain.
fn format_number(v: f64) -> String {
    format!("{:?}", v)
}

/// Ordered, typed output table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), ExportError> {
        if row.len() != self.columns.len() {
            return Err(ExportError::RaggedRow {
                row: self.rows.len(),
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Cell by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Cell> {
        let col = self.column(column)?;
        self.rows.get(row).and_then(|r| r.get(col))
    }

    /// Copy of the rows for which `keep` returns true.
    pub fn filter<F: Fn(&[Cell]) -> bool>(&self, keep: F) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    /// Write as delimited text, replacing nulls with `null_sentinel` (empty if `None`).
    pub fn write_delimited(
        &self,
        path: &Path,
        delimiter: u8,
        null_sentinel: Option<&str>,
    ) -> Result<(), ExportError> {
        let csv_err = |e: csv::Error| ExportError::Csv {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(path)
            .map_err(csv_err)?;
        writer.write_record(&self.columns).map_err(csv_err)?;
        for row in &self.rows {
            writer
                .write_record(row.iter().map(|c| c.render(null_sentinel)))
                .map_err(csv_err)?;
        }
        writer.flush().map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write as a JSON array of records. Nulls become JSON `null` unless a sentinel is given;
    /// a numeric sentinel such as `999999` is written as a number, anything else as a string.
    pub fn write_json(&self, path: &Path, null_sentinel: Option<&str>) -> Result<(), ExportError> {
        let file = File::create(path).map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        let records = JsonRecords {
            table: self,
            null_sentinel,
        };
        serde_json::to_writer_pretty(&mut writer, &records).map_err(|e| {
            ExportError::Serialization {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        writer.flush().map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a delimited file written by `write_delimited`.
    ///
    /// Columns named in `text_columns` are never parsed as numbers, which keeps
    /// identifiers like `090010101001` intact.
    pub fn read_delimited(
        path: &Path,
        delimiter: u8,
        null_sentinel: Option<&str>,
        text_columns: &[&str],
    ) -> Result<Table, ExportError> {
        let raw = RawTable::read_with_delimiter(path, delimiter).map_err(|e| ExportError::Csv {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let is_text: Vec<bool> = raw
            .headers
            .iter()
            .map(|h| text_columns.contains(&h.as_str()))
            .collect();

        let mut table = Table::new(raw.headers.clone());
        for record in &raw.rows {
            let row = record
                .iter()
                .zip(&is_text)
                .map(|(field, &text)| parse_cell(field, text, null_sentinel))
                .collect();
            table.push_row(row)?;
        }
        Ok(table)
    }
}

fn parse_cell(field: &str, text: bool, null_sentinel: Option<&str>) -> Cell {
    if field.is_empty() || null_sentinel == Some(field) {
        return Cell::Null;
    }
    if text {
        return Cell::Text(field.to_string());
    }
    if let Ok(v) = field.parse::<i64>() {
        return Cell::Integer(v);
    }
    match parse_number(field) {
        Some(v) => Cell::Number(v),
        None => Cell::Text(field.to_string()),
    }
}

struct JsonRecords<'a> {
    table: &'a Table,
    null_sentinel: Option<&'a str>,
}

struct JsonRecord<'a> {
    columns: &'a [String],
    cells: &'a [Cell],
    null_sentinel: Option<&'a str>,
}

impl Serialize for JsonRecords<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.table.rows.len()))?;
        for cells in &self.table.rows {
            seq.serialize_element(&JsonRecord {
                columns: &self.table.columns,
                cells,
                null_sentinel: self.null_sentinel,
            })?;
        }
        seq.end()
    }
}

enum JsonSentinel<'a> {
    Integer(i64),
    Number(f64),
    Text(&'a str),
}

impl<'a> JsonSentinel<'a> {
    fn parse(raw: &'a str) -> Self {
        let trimmed = raw.trim();
        if let Ok(v) = trimmed.parse::<i64>() {
            return JsonSentinel::Integer(v);
        }
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => JsonSentinel::Number(v),
            _ => JsonSentinel::Text(raw),
        }
    }
}

impl Serialize for JsonRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, cell) in self.columns.iter().zip(self.cells) {
            match cell {
                Cell::Text(s) => map.serialize_entry(column, s)?,
                Cell::Number(v) => map.serialize_entry(column, v)?,
                Cell::Integer(v) => map.serialize_entry(column, v)?,
                Cell::Null => match self.null_sentinel {
                    Some(s) => match JsonSentinel::parse(s) {
                        JsonSentinel::Integer(v) => map.serialize_entry(column, &v)?,
                        JsonSentinel::Number(v) => map.serialize_entry(column, &v)?,
                        JsonSentinel::Text(t) => map.serialize_entry(column, t)?,
                    },
                    None => map.serialize_entry(column, &Option::<f64>::None)?,
                },
            }
        }
        map.end()
    }
}
