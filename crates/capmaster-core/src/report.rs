//! Report model and text rendering.
//!
//! The JSON model is the single source of truth; the text renderer walks the
//! same structure. Output ordering is deterministic: matches keep the
//! matcher's stable order, endpoint groups the aggregator's.

use serde::{Deserialize, Serialize};

use crate::aggregate::EndpointGroup;
use crate::config::{BucketStrategy, MatchMode};
use crate::diff::StreamDiff;
use crate::matching::MatchStats;

/// Current report schema version.
pub const REPORT_VERSION: u32 = 1;

/// Tool metadata embedded in reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

impl ToolInfo {
    pub fn current() -> Self {
        ToolInfo {
            name: "capmaster".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Input capture metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputInfo {
    pub path: String,
    pub bytes: u64,
    pub packets: u64,
    pub connections: usize,
    /// Connections surviving the sampler (equal to `connections` when
    /// sampling did not run).
    pub connections_analyzed: usize,
}

/// One matched stream pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEntry {
    pub index: usize,
    pub stream_a: u32,
    pub stream_b: u32,
    pub client_a: String,
    pub server_a: String,
    pub client_b: String,
    pub server_b: String,
    pub raw_score: f64,
    pub available_weight: f64,
    pub normalized_score: f64,
    pub evidence: Vec<String>,
    pub flow_hash: i64,
    pub flow_side: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<StreamDiff>,
}

/// Complete match/compare report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchReport {
    pub report_version: u32,
    pub tool: ToolInfo,
    pub generated_at: String,
    pub inputs: Vec<InputInfo>,
    pub strategy: BucketStrategy,
    pub mode: MatchMode,
    pub threshold: f64,
    pub stats: MatchStats,
    pub matches: Vec<MatchEntry>,
    pub endpoints: Vec<EndpointGroup>,
}

/// Renders the paginated text report.
pub fn render_text(report: &MatchReport) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} — {} matches (threshold {:.2}, {:?} buckets, {:?})",
        report.tool.name,
        report.tool.version,
        report.stats.total,
        report.threshold,
        report.strategy,
        report.mode,
    );
    for input in &report.inputs {
        let _ = writeln!(
            out,
            "  input {} — {} packets, {} connections ({} analyzed)",
            input.path, input.packets, input.connections, input.connections_analyzed
        );
    }

    for entry in &report.matches {
        let _ = writeln!(out, "\n[{}] stream {} <-> stream {}", entry.index, entry.stream_a, entry.stream_b);
        let _ = writeln!(
            out,
            "    A {} -> {}   B {} -> {}",
            entry.client_a, entry.server_a, entry.client_b, entry.server_b
        );
        let _ = writeln!(
            out,
            "    score {:.3} (raw {:.3} of {:.3} available)",
            entry.normalized_score, entry.raw_score, entry.available_weight
        );
        let _ = writeln!(out, "    evidence: {}", entry.evidence.join(", "));
        let _ = writeln!(
            out,
            "    flow hash {} ({})",
            entry.flow_hash, entry.flow_side
        );
        if let Some(diff) = &entry.diff {
            let _ = writeln!(
                out,
                "    diff: {} only-in-A, {} only-in-B, {} count, {} flag, {} seq",
                diff.only_in_a,
                diff.only_in_b,
                diff.count_mismatches,
                diff.flag_mismatches,
                diff.seq_mismatches
            );
            for change in &diff.flag_changes {
                let _ = writeln!(
                    out,
                    "      flags {} x{} (frames {}<->{})",
                    change.pattern, change.count, change.example_frame_a, change.example_frame_b
                );
            }
        }
    }

    if !report.endpoints.is_empty() {
        let _ = writeln!(out, "\nEndpoint groups:");
        for group in &report.endpoints {
            let _ = writeln!(
                out,
                "  {}{} -> {}:{} | {} -> {}:{}  matches {}  confidence {} ({:.2})",
                if group.reversed { "[reversed] " } else { "" },
                group.tuple_a.client_ip,
                group.tuple_a.server_ip,
                group.tuple_a.server_port,
                group.tuple_b.client_ip,
                group.tuple_b.server_ip,
                group.tuple_b.server_port,
                group.match_count,
                group.confidence.label(),
                group.mean_confidence,
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{MatchEntry, MatchReport, REPORT_VERSION, ToolInfo, render_text};
    use crate::config::{BucketStrategy, MatchMode};
    use crate::matching::MatchStats;

    fn report() -> MatchReport {
        MatchReport {
            report_version: REPORT_VERSION,
            tool: ToolInfo::current(),
            generated_at: "1970-01-01T00:00:00Z".to_string(),
            inputs: Vec::new(),
            strategy: BucketStrategy::Server,
            mode: MatchMode::OneToOne,
            threshold: 0.6,
            stats: MatchStats {
                total: 1,
                mean_normalized: 0.9,
                unique_a: 1,
                unique_b: 1,
                max_fanout: 1,
                mean_fanout: 1.0,
            },
            matches: vec![MatchEntry {
                index: 0,
                stream_a: 3,
                stream_b: 7,
                client_a: "10.0.0.1:50000".to_string(),
                server_a: "10.0.0.2:443".to_string(),
                client_b: "10.0.0.1:50000".to_string(),
                server_b: "10.0.0.2:443".to_string(),
                raw_score: 0.9,
                available_weight: 1.0,
                normalized_score: 0.9,
                evidence: vec!["syn-options".to_string()],
                flow_hash: -42,
                flow_side: "lhs>=rhs".to_string(),
                diff: None,
            }],
            endpoints: Vec::new(),
        }
    }

    #[test]
    fn text_report_mentions_every_match() {
        let text = render_text(&report());
        assert!(text.contains("stream 3 <-> stream 7"));
        assert!(text.contains("flow hash -42 (lhs>=rhs)"));
        assert!(text.contains("syn-options"));
    }

    #[test]
    fn report_round_trips_through_json() {
        let report = report();
        let json = serde_json::to_string(&report).expect("serialize");
        let back: MatchReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.matches.len(), 1);
        assert_eq!(back.matches[0].flow_hash, -42);
    }
}
