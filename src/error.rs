//! Error types for every pipeline stage.
//!
//! Each layer owns its own enum; `PipelineError` rolls them up for the binary.

use std::path::PathBuf;

/// Problems with the declared configuration. Always fatal, raised before any output is written.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to write config: {0}")]
    Write(String),

    #[error("Indicator name '{0}' is longer than 8 characters")]
    NameTooLong(String),

    #[error("Indicator name '{0}' is declared more than once")]
    DuplicateIndicator(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Problems building the unit keyspace from the boundary layer.
#[derive(Debug, thiserror::Error)]
pub enum KeyspaceError {
    #[error("Unit id '{id}' is not a {width}-digit numeric string")]
    InvalidUnitId { id: String, width: usize },

    #[error("Unit id '{0}' appears more than once in the boundary layer")]
    DuplicateUnit(String),

    #[error("Boundary layer produced no units")]
    Empty,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failures reported by the geospatial engine. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine export not found: {0}")]
    MissingExport(PathBuf),

    #[error("Engine export {path} is missing column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("Engine operation '{operation}' failed: {message}")]
    Operation { operation: String, message: String },

    #[error("Failed to read engine export {path}: {message}")]
    Read { path: PathBuf, message: String },
}

/// Problems reading or normalizing a source dataset.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Source '{source_name}': input file not found: {path}")]
    MissingFile { source_name: String, path: PathBuf },

    #[error("Source '{source_name}': column '{column}' not found in {path}")]
    MissingColumn {
        source_name: String,
        column: String,
        path: PathBuf,
    },

    #[error("Source '{source_name}': failed to read {path}: {message}")]
    Read {
        source_name: String,
        path: PathBuf,
        message: String,
    },

    #[error("Source '{source_name}': row for key {key} has {actual} values for {expected} columns")]
    RowWidth {
        source_name: String,
        key: u64,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Problems computing percentile columns.
#[derive(Debug, thiserror::Error)]
pub enum PercentileError {
    #[error("Indicator '{0}' was declared but never ingested")]
    MissingIndicator(String),

    #[error("Indicator '{name}' has {actual} values for {expected} units")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Problems writing or re-reading output tables.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on {path}: {message}")]
    Csv { path: PathBuf, message: String },

    #[error("Serialization error on {path}: {message}")]
    Serialization { path: PathBuf, message: String },

    #[error("Row {row} has {actual} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        actual: usize,
    },
}

/// Anything that can abort a run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Keyspace(#[from] KeyspaceError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Percentile(#[from] PercentileError),

    #[error(transparent)]
    Export(#[from] ExportError),
}
