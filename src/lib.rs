//! Environmental-justice indicator preparation library
//!
//! Re-exports modules for use by binaries and tools.

pub mod assemble;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod ingest;
pub mod keyspace;
pub mod metadata;
pub mod percentile;
pub mod pipeline;
pub mod table;
