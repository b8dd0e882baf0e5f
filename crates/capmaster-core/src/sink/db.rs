//! Per-case stream-extra table write-through.
//!
//! `compare` persists one row per matched stream per capture into
//! `kase_{case_id}_tcp_stream_extra`. The table is created on first use; a
//! pre-existing table with a different shape is a hard error rather than a
//! silent best-effort insert. All rows of one compare invocation go through
//! a single transaction — a failed batch leaves nothing behind.

use rusqlite::{Connection, params};

use super::SinkError;

/// Database sink configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite database path (created when absent).
    pub path: String,
    /// Case identifier embedded in the table name.
    pub case_id: String,
    /// `pcap_id` values for capture A and capture B.
    pub pcap_ids: (i64, i64),
}

/// One row of the stream-extra table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamExtraRow {
    pub pcap_id: i64,
    pub flow_hash: i64,
    /// Nanoseconds, full precision.
    pub first_time: i64,
    pub last_time: i64,
    pub tcp_flags_different_cnt: i64,
    /// Dominant change pattern, e.g. `0x0002->0x0010`.
    pub tcp_flags_different_type: String,
    /// All flag changes, semicolon-separated.
    pub tcp_flags_different_text: String,
    pub seq_num_different_cnt: i64,
    pub seq_num_different_text: String,
}

/// Column names in table order; the `id` autoincrement key comes last.
const COLUMNS: [&str; 10] = [
    "pcap_id",
    "flow_hash",
    "first_time",
    "last_time",
    "tcp_flags_different_cnt",
    "tcp_flags_different_type",
    "tcp_flags_different_text",
    "seq_num_different_cnt",
    "seq_num_different_text",
    "id",
];

/// Open database handle bound to one case table.
pub struct CompareSink {
    connection: Connection,
    table: String,
}

impl std::fmt::Debug for CompareSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompareSink")
            .field("table", &self.table)
            .finish()
    }
}

impl CompareSink {
    /// Opens (or creates) the database and ensures the case table exists
    /// with the expected shape.
    pub fn open(config: &DbConfig) -> Result<Self, SinkError> {
        if config.case_id.is_empty()
            || !config
                .case_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(SinkError::InvalidCaseId(config.case_id.clone()));
        }
        let connection = Connection::open(&config.path)
            .map_err(|err| SinkError::Unavailable(err.to_string()))?;
        let table = format!("kase_{}_tcp_stream_extra", config.case_id);
        let sink = CompareSink { connection, table };
        sink.ensure_table()?;
        Ok(sink)
    }

    fn ensure_table(&self) -> Result<(), SinkError> {
        self.connection.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    pcap_id INTEGER,
                    flow_hash BIGINT,
                    first_time BIGINT,
                    last_time BIGINT,
                    tcp_flags_different_cnt BIGINT,
                    tcp_flags_different_type TEXT,
                    tcp_flags_different_text TEXT,
                    seq_num_different_cnt BIGINT,
                    seq_num_different_text TEXT,
                    id INTEGER PRIMARY KEY AUTOINCREMENT
                )",
                self.table
            ),
            [],
        )?;
        self.verify_shape()
    }

    /// A table left behind by another tool must not be silently reused.
    fn verify_shape(&self) -> Result<(), SinkError> {
        let mut statement = self
            .connection
            .prepare(&format!("PRAGMA table_info({})", self.table))?;
        let names: Vec<String> = statement
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        if names != COLUMNS {
            return Err(SinkError::SchemaMismatch {
                table: self.table.clone(),
                detail: format!("found columns [{}]", names.join(", ")),
            });
        }
        Ok(())
    }

    /// Writes all rows of one compare invocation in a single transaction.
    pub fn write_rows(&mut self, rows: &[StreamExtraRow]) -> Result<(), SinkError> {
        let tx = self.connection.transaction()?;
        {
            let mut statement = tx.prepare(&format!(
                "INSERT INTO {} (pcap_id, flow_hash, first_time, last_time,
                    tcp_flags_different_cnt, tcp_flags_different_type,
                    tcp_flags_different_text, seq_num_different_cnt,
                    seq_num_different_text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                self.table
            ))?;
            for row in rows {
                statement.execute(params![
                    row.pcap_id,
                    row.flow_hash,
                    row.first_time,
                    row.last_time,
                    row.tcp_flags_different_cnt,
                    row.tcp_flags_different_type,
                    row.tcp_flags_different_text,
                    row.seq_num_different_cnt,
                    row.seq_num_different_text,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Reads rows back in insertion order (tests and tooling).
    pub fn read_rows(&self) -> Result<Vec<StreamExtraRow>, SinkError> {
        let mut statement = self.connection.prepare(&format!(
            "SELECT pcap_id, flow_hash, first_time, last_time,
                tcp_flags_different_cnt, tcp_flags_different_type,
                tcp_flags_different_text, seq_num_different_cnt,
                seq_num_different_text
             FROM {} ORDER BY id",
            self.table
        ))?;
        let rows = statement
            .query_map([], |row| {
                Ok(StreamExtraRow {
                    pcap_id: row.get(0)?,
                    flow_hash: row.get(1)?,
                    first_time: row.get(2)?,
                    last_time: row.get(3)?,
                    tcp_flags_different_cnt: row.get(4)?,
                    tcp_flags_different_type: row.get(5)?,
                    tcp_flags_different_text: row.get(6)?,
                    seq_num_different_cnt: row.get(7)?,
                    seq_num_different_text: row.get(8)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}
