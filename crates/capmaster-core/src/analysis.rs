//! Pipeline orchestration.
//!
//! One capture flows dissector → record stream → connection builder →
//! (optional) sampler → role detector; the two captures of a pair run in
//! parallel. The pair then flows bucketer → scorer → matcher → flow hasher →
//! (compare mode) packet differ → endpoint aggregator → report/sink. All
//! stage outputs are deterministic, so re-running a pair reproduces the
//! report byte for byte.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::aggregate::aggregate_endpoints;
use crate::capture::{CaptureError, validate_capture_file};
use crate::config::{ConfigError, IpidGate, MatchConfig};
use crate::connection::builder::{StreamIndex, build_connections, stream_records};
use crate::connection::sampler::{derive_seed, sample_connections};
use crate::connection::server_role::{EndpointTables, ServerInfo, detect_server};
use crate::connection::TcpConnection;
use crate::diff::{StreamDiff, diff_streams};
use crate::dissector::driver::MIN_MAJOR_VERSION;
use crate::dissector::{DissectorConfig, DissectorError, PacketRecord, probe_version,
    spawn_dissector};
use crate::flowhash::flow_hash;
use crate::matching::{choose_strategy, match_connections};
use crate::report::{InputInfo, MatchEntry, MatchReport, REPORT_VERSION, ToolInfo};
use crate::sink::{CompareSink, DbConfig, SinkError, StreamExtraRow};
use crate::timestamp::{epoch_str_to_nanos, seconds_to_rfc3339};

/// Timestamp used when a capture pair contains no packets.
pub const DEFAULT_GENERATED_AT: &str = "1970-01-01T00:00:00Z";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Dissector(#[from] DissectorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the orchestrator needs for one run.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub match_config: MatchConfig,
    pub dissector: DissectorConfig,
    /// `true` adds the per-match packet diff (compare mode).
    pub compare: bool,
    /// Optional write-through sink, compare mode only.
    pub db: Option<DbConfig>,
}

/// One dissected capture, ready for matching.
struct CaptureView {
    path: PathBuf,
    bytes: u64,
    records: Vec<PacketRecord>,
    index: StreamIndex,
    /// Connections surviving the sampler, sorted by stream id.
    connections: Vec<TcpConnection>,
    total_connections: usize,
    /// Role verdicts aligned with `connections`.
    roles: Vec<ServerInfo>,
}

/// Runs the full match/compare pipeline over one capture pair.
pub fn analyze_capture_pair(
    input_a: &Path,
    input_b: &Path,
    options: &AnalysisOptions,
) -> Result<MatchReport, AnalysisError> {
    options.match_config.validate()?;
    validate_capture_file(input_a)?;
    validate_capture_file(input_b)?;

    match probe_version(&options.dissector.binary)? {
        Some((major, minor)) if major < MIN_MAJOR_VERSION => {
            log::warn!(
                "dissector version {major}.{minor} is below the validated floor {MIN_MAJOR_VERSION}.x; continuing"
            );
        }
        Some(_) => {}
        None => log::warn!("could not determine dissector version; continuing"),
    }

    let seed = options
        .match_config
        .sample
        .as_ref()
        .and_then(|s| s.seed)
        .unwrap_or_else(|| derive_seed(input_a, input_b));

    // The two captures are independent units of work; dissect both at once.
    let (view_a, view_b) = std::thread::scope(|scope| {
        let handle_a = scope.spawn(|| load_capture(input_a, options, seed));
        let handle_b = scope.spawn(|| load_capture(input_b, options, seed));
        (
            handle_a.join().expect("capture loader panicked"),
            handle_b.join().expect("capture loader panicked"),
        )
    });
    let view_a = view_a?;
    let view_b = view_b?;

    enforce_ipid_policy(&view_a, &view_b, &options.match_config)?;

    let strategy = choose_strategy(
        options.match_config.bucket,
        &view_a.connections,
        &view_b.connections,
    );
    let (matches, stats) = match_connections(
        &view_a.connections,
        &view_b.connections,
        strategy,
        &options.match_config,
    );
    log::info!(
        "{} matches across {} x {} connections",
        stats.total,
        view_a.connections.len(),
        view_b.connections.len()
    );

    let mut entries = Vec::with_capacity(matches.len());
    let mut db_rows = Vec::new();
    for (position, m) in matches.iter().enumerate() {
        let conn_a = &view_a.connections[m.a_index];
        let conn_b = &view_b.connections[m.b_index];
        let (hash, side) = flow_hash(
            conn_a.client_ip,
            conn_a.client_port,
            conn_a.server_ip,
            conn_a.server_port,
            6,
        );

        let diff = options.compare.then(|| {
            diff_streams(
                conn_a,
                &stream_records(&view_a.index, &view_a.records, conn_a.stream_id),
                conn_b,
                &stream_records(&view_b.index, &view_b.records, conn_b.stream_id),
            )
        });

        if let (true, Some(db), Some(diff)) = (options.compare, options.db.as_ref(), diff.as_ref())
        {
            push_db_rows(&mut db_rows, db, conn_a, conn_b, hash, diff);
        }

        entries.push(MatchEntry {
            index: position,
            stream_a: conn_a.stream_id,
            stream_b: conn_b.stream_id,
            client_a: conn_a.client_endpoint(),
            server_a: conn_a.server_endpoint(),
            client_b: conn_b.client_endpoint(),
            server_b: conn_b.server_endpoint(),
            raw_score: m.score.raw,
            available_weight: m.score.available_weight,
            normalized_score: m.score.normalized,
            evidence: m.score.evidence.iter().map(|tag| tag.to_string()).collect(),
            flow_hash: hash,
            flow_side: side.tag().to_string(),
            diff,
        });
    }

    let endpoints = aggregate_endpoints(
        &matches,
        &view_a.connections,
        &view_a.roles,
        &view_b.connections,
        &view_b.roles,
    );

    if let Some(db) = &options.db {
        if options.compare {
            let mut sink = CompareSink::open(db)?;
            sink.write_rows(&db_rows)?;
            log::info!("wrote {} rows to {}", db_rows.len(), db.path);
        }
    }

    let generated_at = view_a
        .connections
        .iter()
        .chain(&view_b.connections)
        .map(|c| c.last_packet_time)
        .fold(None, |acc: Option<f64>, ts| Some(acc.map_or(ts, |a| a.max(ts))))
        .and_then(seconds_to_rfc3339)
        .unwrap_or_else(|| DEFAULT_GENERATED_AT.to_string());

    Ok(MatchReport {
        report_version: REPORT_VERSION,
        tool: ToolInfo::current(),
        generated_at,
        inputs: vec![input_info(&view_a), input_info(&view_b)],
        strategy,
        mode: options.match_config.mode,
        threshold: options.match_config.threshold,
        stats,
        matches: entries,
        endpoints,
    })
}

fn load_capture(
    path: &Path,
    options: &AnalysisOptions,
    seed: u64,
) -> Result<CaptureView, AnalysisError> {
    let bytes = std::fs::metadata(path)?.len();
    let stream = spawn_dissector(path, &options.dissector)?;
    let records = stream.collect_records()?;
    log::debug!("{}: {} TCP frames", path.display(), records.len());

    let (index, connections) =
        build_connections(&records, options.match_config.length_signature_len);
    let total_connections = connections.len();

    // Role tables cover the whole file even when the sampler trims the
    // connection list afterwards.
    let tables = EndpointTables::build(&connections);
    let connections = match &options.match_config.sample {
        Some(sample) => sample_connections(connections, sample, seed),
        None => connections,
    };
    let roles = connections
        .iter()
        .map(|conn| detect_server(conn, &tables))
        .collect();

    Ok(CaptureView {
        path: path.to_path_buf(),
        bytes,
        records,
        index,
        connections,
        total_connections,
        roles,
    })
}

/// Under the strict gate, a side whose connections carry no IP-IDs at all
/// (IPv6-only capture) can never match anything; fail fast with a hint
/// instead of reporting a misleading "no matches".
fn enforce_ipid_policy(
    view_a: &CaptureView,
    view_b: &CaptureView,
    config: &MatchConfig,
) -> Result<(), AnalysisError> {
    if config.ipid_gate != IpidGate::Strict {
        return Ok(());
    }
    for view in [view_a, view_b] {
        let no_ipids = !view.connections.is_empty()
            && view.connections.iter().all(|c| c.ipid_set.is_empty());
        if no_ipids {
            return Err(AnalysisError::Config(ConfigError::Invalid(format!(
                "{}: no connection carries an IP-ID (IPv6-only capture?); \
                 rerun with the IP-ID gate disabled",
                view.path.display()
            ))));
        }
    }
    Ok(())
}

fn push_db_rows(
    rows: &mut Vec<StreamExtraRow>,
    db: &DbConfig,
    conn_a: &TcpConnection,
    conn_b: &TcpConnection,
    hash: i64,
    diff: &StreamDiff,
) {
    let dominant = diff
        .flag_changes
        .first()
        .map(|c| c.pattern.clone())
        .unwrap_or_default();
    let flags_text = diff
        .flag_changes
        .iter()
        .map(|c| format!("{}({})", c.pattern, c.count))
        .collect::<Vec<_>>()
        .join(";");
    let seq_text = diff
        .diffs
        .iter()
        .filter_map(|d| match d {
            crate::diff::PacketDiff::SeqMismatch { seq_a, seq_b, .. } => {
                Some(format!("{seq_a}->{seq_b}"))
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(";");

    for (pcap_id, conn) in [(db.pcap_ids.0, conn_a), (db.pcap_ids.1, conn_b)] {
        rows.push(StreamExtraRow {
            pcap_id,
            flow_hash: hash,
            first_time: epoch_str_to_nanos(&conn.first_time_raw).unwrap_or_default(),
            last_time: epoch_str_to_nanos(&conn.last_time_raw).unwrap_or_default(),
            tcp_flags_different_cnt: diff.flag_mismatches as i64,
            tcp_flags_different_type: dominant.clone(),
            tcp_flags_different_text: flags_text.clone(),
            seq_num_different_cnt: diff.seq_mismatches as i64,
            seq_num_different_text: seq_text.clone(),
        });
    }
}

fn input_info(view: &CaptureView) -> InputInfo {
    InputInfo {
        path: view.path.display().to_string(),
        bytes: view.bytes,
        packets: view.records.len() as u64,
        connections: view.total_connections,
        connections_analyzed: view.connections.len(),
    }
}
