//! Multi-signal similarity scoring with hard gates.
//!
//! Two connections are compared feature by feature; each feature carries a
//! fixed weight and contributes only when both sides (or, for TCP
//! timestamps, either side) actually observed it. The score is normalised
//! against the weight that was available, so a header-only capture competes
//! on equal footing with a full one.
//!
//! Two hard gates run before any feature work. IP-ID intersection is
//! deliberately flexible — a long stream on one side may be carved into
//! segments on the other, so any shared captured IP-ID counts, never just
//! the first. Streams whose observation windows are disjoint cannot be the
//! same connection regardless of fingerprints.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::{IpidGate, MatchConfig};
use crate::connection::TcpConnection;

/// Feature weights; the full table sums to 1.00.
pub const WEIGHT_SYN_OPTIONS: f64 = 0.25;
pub const WEIGHT_ISN_CLIENT: f64 = 0.12;
pub const WEIGHT_ISN_SERVER: f64 = 0.06;
pub const WEIGHT_TCP_TIMESTAMP: f64 = 0.10;
pub const WEIGHT_PAYLOAD_CLIENT: f64 = 0.15;
pub const WEIGHT_PAYLOAD_SERVER: f64 = 0.08;
pub const WEIGHT_LENGTH_SIGNATURE: f64 = 0.08;
pub const WEIGHT_IPID: f64 = 0.16;

/// Minimum Jaccard similarity for the length signature to count as a match.
pub const LENGTH_SIGNATURE_JACCARD_MIN: f64 = 0.6;

/// Sentinel evidence emitted on hard-gate rejection.
pub const EVIDENCE_NO_IPID: &str = "no-ipid";
pub const EVIDENCE_NO_TIME_OVERLAP: &str = "no-time-overlap";

/// Scoring outcome for one candidate pair.
#[derive(Debug, Clone, Serialize)]
pub struct MatchScore {
    /// Sum of matched feature weights.
    pub raw: f64,
    /// Sum of feature weights that could have matched.
    pub available_weight: f64,
    /// `raw / available_weight`, or 0 with an empty denominator.
    pub normalized: f64,
    /// Matched signal tags in weight order, or a gate sentinel.
    pub evidence: Vec<&'static str>,
}

impl MatchScore {
    fn rejected(sentinel: &'static str) -> Self {
        MatchScore {
            raw: 0.0,
            available_weight: 0.0,
            normalized: 0.0,
            evidence: vec![sentinel],
        }
    }

    /// True when a hard gate rejected the pair.
    pub fn gate_rejected(&self) -> bool {
        self.evidence
            .iter()
            .any(|tag| *tag == EVIDENCE_NO_IPID || *tag == EVIDENCE_NO_TIME_OVERLAP)
    }
}

/// Scores one candidate pair. Gate failures short-circuit with a zero score
/// and a sentinel evidence tag; no feature work is done for them.
pub fn score_pair(a: &TcpConnection, b: &TcpConnection, config: &MatchConfig) -> MatchScore {
    if config.ipid_gate == IpidGate::Strict && !a.shares_ipid(b) {
        return MatchScore::rejected(EVIDENCE_NO_IPID);
    }
    if !a.overlaps_in_time(b) {
        return MatchScore::rejected(EVIDENCE_NO_TIME_OVERLAP);
    }

    let mut raw = 0.0;
    let mut available = 0.0;
    let mut evidence = Vec::new();
    let mut feature = |weight: f64, is_available: bool, matched: bool, tag: &'static str| {
        if !is_available {
            return;
        }
        available += weight;
        if matched {
            raw += weight;
            evidence.push(tag);
        }
    };

    feature(
        WEIGHT_SYN_OPTIONS,
        a.syn_options.is_some() && b.syn_options.is_some(),
        a.syn_options == b.syn_options && a.syn_options.is_some(),
        "syn-options",
    );
    feature(
        WEIGHT_ISN_CLIENT,
        a.isn_client.is_some() && b.isn_client.is_some(),
        a.isn_client == b.isn_client && a.isn_client.is_some(),
        "isn-client",
    );
    feature(
        WEIGHT_ISN_SERVER,
        a.isn_server.is_some() && b.isn_server.is_some(),
        a.isn_server == b.isn_server && a.isn_server.is_some(),
        "isn-server",
    );

    // SYN segments carry tsecr=0 on both sides of unrelated connections; a
    // zero tsecr therefore proves nothing and must not match.
    let has_tcp_ts = |c: &TcpConnection| c.ts_val_first.is_some() || c.ts_ecr_first.is_some();
    let tsval_match = a.ts_val_first.is_some() && a.ts_val_first == b.ts_val_first;
    let tsecr_match = matches!((a.ts_ecr_first, b.ts_ecr_first), (Some(x), Some(y)) if x == y && x != 0);
    feature(
        WEIGHT_TCP_TIMESTAMP,
        has_tcp_ts(a) || has_tcp_ts(b),
        tsval_match || tsecr_match,
        "tcp-timestamp",
    );

    // Payload digests only participate when both captures actually kept
    // payload bytes; in header-only mode the weights drop out of the
    // denominator too, renormalising the remaining signals.
    let payload_mode = !a.is_header_only && !b.is_header_only;
    feature(
        WEIGHT_PAYLOAD_CLIENT,
        payload_mode
            && a.payload_hash_client_first.is_some()
            && b.payload_hash_client_first.is_some(),
        a.payload_hash_client_first == b.payload_hash_client_first
            && a.payload_hash_client_first.is_some(),
        "payload-client",
    );
    feature(
        WEIGHT_PAYLOAD_SERVER,
        payload_mode
            && a.payload_hash_server_first.is_some()
            && b.payload_hash_server_first.is_some(),
        a.payload_hash_server_first == b.payload_hash_server_first
            && a.payload_hash_server_first.is_some(),
        "payload-server",
    );

    feature(
        WEIGHT_LENGTH_SIGNATURE,
        !a.length_signature.is_empty() && !b.length_signature.is_empty(),
        length_signature_jaccard(a, b) >= LENGTH_SIGNATURE_JACCARD_MIN,
        "length-signature",
    );

    // Under the strict gate the intersection has already been proven; with
    // the gate off the signal is unavailable entirely (IPv6 traffic).
    feature(
        WEIGHT_IPID,
        config.ipid_gate == IpidGate::Strict,
        config.ipid_gate == IpidGate::Strict,
        "ipid-intersection",
    );

    let normalized = if available > 0.0 { raw / available } else { 0.0 };
    assert!(
        (0.0..=1.0 + f64::EPSILON).contains(&normalized),
        "normalized score {normalized} outside [0, 1] for streams {} and {}",
        a.stream_id,
        b.stream_id
    );
    MatchScore {
        raw,
        available_weight: available,
        normalized: normalized.min(1.0),
        evidence,
    }
}

fn length_signature_jaccard(a: &TcpConnection, b: &TcpConnection) -> f64 {
    let set_a: BTreeSet<_> = a.length_signature.iter().collect();
    let set_b: BTreeSet<_> = b.length_signature.iter().collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::net::IpAddr;

    use super::{EVIDENCE_NO_IPID, EVIDENCE_NO_TIME_OVERLAP, score_pair};
    use crate::config::{IpidGate, MatchConfig};
    use crate::connection::{Direction, LengthToken, TcpConnection};

    fn base_conn(stream_id: u32) -> TcpConnection {
        let client_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let server_ip: IpAddr = "10.0.0.2".parse().unwrap();
        TcpConnection {
            stream_id,
            client_ip,
            client_port: 51000,
            server_ip,
            server_port: 443,
            oriented_by_syn: true,
            first_packet_time: 0.0,
            last_packet_time: 100.0,
            first_time_raw: "0.0".to_string(),
            last_time_raw: "100.0".to_string(),
            packet_count: 10,
            syn_options: Some("mss=1460;ws=7;sack=1;ts=1".to_string()),
            isn_client: Some(1000),
            isn_server: Some(2000),
            ts_val_first: Some(3576232891),
            ts_ecr_first: Some(0),
            payload_hash_client_first: Some(1),
            payload_hash_server_first: Some(2),
            length_signature: vec![
                LengthToken { direction: Direction::Client, length: 100 },
                LengthToken { direction: Direction::Server, length: 1448 },
            ],
            ipid_set: BTreeSet::from([0xabcd, 0xabce]),
            ipid_first: Some(0xabcd),
            is_header_only: false,
            client_ttl: Some(64),
            server_ttl: Some(58),
        }
    }

    #[test]
    fn identical_connections_score_one() {
        let config = MatchConfig::default();
        let score = score_pair(&base_conn(0), &base_conn(1), &config);
        assert!((score.normalized - 1.0).abs() < 1e-9);
        assert!((score.available_weight - 1.0).abs() < 1e-9);
        assert!(score.evidence.contains(&"syn-options"));
        assert!(score.evidence.contains(&"ipid-intersection"));
    }

    #[test]
    fn disjoint_ipid_sets_are_gated_out() {
        let config = MatchConfig::default();
        let a = TcpConnection {
            ipid_set: BTreeSet::from([0xaaaa, 0xaaab]),
            ..base_conn(0)
        };
        let b = TcpConnection {
            ipid_set: BTreeSet::from([0xbbbb, 0xbbbc]),
            ..base_conn(1)
        };
        let score = score_pair(&a, &b, &config);
        assert_eq!(score.normalized, 0.0);
        assert_eq!(score.evidence, vec![EVIDENCE_NO_IPID]);
        assert!(score.gate_rejected());
    }

    #[test]
    fn disjoint_time_windows_are_gated_out() {
        let config = MatchConfig::default();
        let a = TcpConnection {
            first_packet_time: 0.0,
            last_packet_time: 100.0,
            ..base_conn(0)
        };
        let b = TcpConnection {
            first_packet_time: 200.0,
            last_packet_time: 300.0,
            ..base_conn(1)
        };
        let score = score_pair(&a, &b, &config);
        assert_eq!(score.normalized, 0.0);
        assert_eq!(score.evidence, vec![EVIDENCE_NO_TIME_OVERLAP]);
    }

    #[test]
    fn zero_tsecr_never_matches() {
        // Unrelated SYNs: different tsval, tsecr 0 on both sides. The tsecr
        // branch must not fire, and with every other signal different the
        // pair stays below any sane threshold.
        let config = MatchConfig::default();
        let a = TcpConnection {
            syn_options: Some("mss=1460;ws=7;sack=1;ts=1".to_string()),
            isn_client: Some(111),
            isn_server: None,
            ts_val_first: Some(3576232891),
            ts_ecr_first: Some(0),
            payload_hash_client_first: None,
            payload_hash_server_first: None,
            length_signature: Vec::new(),
            ..base_conn(0)
        };
        let b = TcpConnection {
            syn_options: Some("mss=1400;ws=8;sack=1;ts=1".to_string()),
            isn_client: Some(222),
            isn_server: None,
            ts_val_first: Some(3575929991),
            ts_ecr_first: Some(0),
            payload_hash_client_first: None,
            payload_hash_server_first: None,
            length_signature: Vec::new(),
            ..base_conn(1)
        };
        let score = score_pair(&a, &b, &config);
        assert!(!score.evidence.contains(&"tcp-timestamp"));
        assert!(score.normalized < config.threshold);
    }

    #[test]
    fn nonzero_tsecr_matches() {
        let config = MatchConfig::default();
        let a = TcpConnection {
            ts_val_first: Some(1),
            ts_ecr_first: Some(777),
            ..base_conn(0)
        };
        let b = TcpConnection {
            ts_val_first: Some(2),
            ts_ecr_first: Some(777),
            ..base_conn(1)
        };
        let score = score_pair(&a, &b, &config);
        assert!(score.evidence.contains(&"tcp-timestamp"));
    }

    #[test]
    fn header_only_drops_payload_weights_from_denominator() {
        let config = MatchConfig::default();
        let a = TcpConnection {
            is_header_only: true,
            payload_hash_client_first: None,
            payload_hash_server_first: None,
            ..base_conn(0)
        };
        let b = base_conn(1);
        let score = score_pair(&a, &b, &config);
        // 1.00 minus the two payload weights.
        assert!((score.available_weight - 0.77).abs() < 1e-9);
        // All remaining signals match, so normalisation restores 1.0.
        assert!((score.normalized - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_feature_on_one_side_lowers_available_weight() {
        let config = MatchConfig::default();
        let a = TcpConnection {
            isn_server: None,
            ..base_conn(0)
        };
        let b = base_conn(1);
        let score = score_pair(&a, &b, &config);
        assert!((score.available_weight - 0.94).abs() < 1e-9);
        assert!(!score.evidence.contains(&"isn-server"));
    }

    #[test]
    fn ipid_gate_off_removes_the_weight() {
        let config = MatchConfig {
            ipid_gate: IpidGate::Off,
            ..MatchConfig::default()
        };
        let a = TcpConnection {
            ipid_set: BTreeSet::new(),
            ipid_first: None,
            ..base_conn(0)
        };
        let b = TcpConnection {
            ipid_set: BTreeSet::new(),
            ipid_first: None,
            ..base_conn(1)
        };
        let score = score_pair(&a, &b, &config);
        assert!((score.available_weight - 0.84).abs() < 1e-9);
        assert!(!score.evidence.contains(&"ipid-intersection"));
        assert!((score.normalized - 1.0).abs() < 1e-9);
    }

    #[test]
    fn gates_ignore_feature_weights() {
        // Whatever the feature situation, gate outcomes depend only on
        // IP-ID sets and time ranges.
        let config = MatchConfig::default();
        let mut a = base_conn(0);
        a.syn_options = None;
        a.isn_client = None;
        a.isn_server = None;
        a.ts_val_first = None;
        a.ts_ecr_first = None;
        a.payload_hash_client_first = None;
        a.payload_hash_server_first = None;
        a.length_signature.clear();
        let b = base_conn(1);
        let score = score_pair(&a, &b, &config);
        assert!(!score.gate_rejected());
    }
}
