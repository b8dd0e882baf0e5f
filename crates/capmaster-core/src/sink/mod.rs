//! Result sinks.
//!
//! The text/JSON report surface lives in [`crate::report`]; this module owns
//! the optional database write-through used by `compare`.

pub mod db;

pub use db::{CompareSink, DbConfig, StreamExtraRow};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("schema mismatch on table {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },
    #[error("invalid case id `{0}`: must be alphanumeric")]
    InvalidCaseId(String),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
}
