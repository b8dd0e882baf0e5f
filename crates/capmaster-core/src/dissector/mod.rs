//! External packet dissector integration.
//!
//! CapMaster never parses PCAP payloads itself: an external tshark process
//! does the dissection and streams one tab-separated row per TCP frame on
//! stdout. This module owns that boundary — the pinned field list and argv
//! shape, the child-process driver with its timeout, and the row-to-record
//! parser. Blank fields are absent values, never zero; the distinction
//! matters for IP-ID and TCP-option handling downstream.

pub mod driver;
pub mod fields;
pub mod record;

pub use driver::{DissectorConfig, DissectorStream, probe_version, spawn_dissector};
pub use record::PacketRecord;

use thiserror::Error;

/// Errors produced while invoking or consuming the external dissector.
#[derive(Debug, Error)]
pub enum DissectorError {
    #[error("dissector binary `{binary}` not found on PATH")]
    NotFound { binary: String },
    #[error("failed to invoke dissector: {message}")]
    Invocation { message: String },
    #[error("dissector timed out after {seconds}s and was terminated")]
    Timeout { seconds: u64 },
    #[error("malformed dissector row (line {line}): {message}")]
    Protocol { line: u64, message: String },
    #[error("dissector exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
