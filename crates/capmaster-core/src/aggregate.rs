//! Endpoint-level aggregation of matches.
//!
//! Matches collapse into groups keyed by the unordered pair of endpoint
//! tuples (one per capture). Each group carries the match count, the mean
//! confidence (the weaker of the two per-connection role verdicts), and
//! TTL-derived hop estimates. When the role detector could only fall back
//! to port comparison, the reversed interpretation is emitted as well so
//! downstream tooling can weigh both hypotheses.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::connection::TcpConnection;
use crate::connection::server_role::{Confidence, ServerInfo};
use crate::matching::ConnectionMatch;

/// Standard initial TTLs used for hop inference.
const STANDARD_INITIAL_TTLS: [u8; 3] = [64, 128, 255];

/// Aggregation key: one conversation as seen from one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointTuple {
    pub client_ip: IpAddr,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub protocol: u8,
}

/// One aggregated endpoint group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointGroup {
    pub tuple_a: EndpointTuple,
    pub tuple_b: EndpointTuple,
    pub match_count: u64,
    /// Mean over matches of the weaker per-connection confidence weight.
    pub mean_confidence: f64,
    pub confidence: Confidence,
    /// Estimated hops client→observer and server→observer for capture A.
    pub client_hops_a: Option<u8>,
    pub server_hops_a: Option<u8>,
    pub client_hops_b: Option<u8>,
    pub server_hops_b: Option<u8>,
    /// True for the swapped duplicate emitted on very-low confidence.
    pub reversed: bool,
}

/// Distance from the nearest standard initial TTL: a packet leaving a host
/// with TTL 64 and observed at 57 has crossed about 7 routers.
pub fn ttl_hops(observed: u8) -> u8 {
    let nearest = STANDARD_INITIAL_TTLS
        .iter()
        .copied()
        .min_by_key(|standard| standard.abs_diff(observed))
        .unwrap_or(64);
    nearest.abs_diff(observed)
}

/// Builds the endpoint tuple for a connection, honouring the detector's
/// server verdict even when it disagrees with the builder's orientation.
fn endpoint_tuple(conn: &TcpConnection, role: &ServerInfo) -> EndpointTuple {
    let detector_agrees = role.server_ip == conn.server_ip && role.server_port == conn.server_port;
    let (client_ip, server_ip, server_port) = if detector_agrees {
        (conn.client_ip, conn.server_ip, conn.server_port)
    } else {
        (conn.server_ip, conn.client_ip, conn.client_port)
    };
    EndpointTuple {
        client_ip,
        server_ip,
        server_port,
        protocol: 6,
    }
}

fn reverse_tuple(tuple: &EndpointTuple, client_port_hint: u16) -> EndpointTuple {
    EndpointTuple {
        client_ip: tuple.server_ip,
        server_ip: tuple.client_ip,
        server_port: client_port_hint,
        protocol: tuple.protocol,
    }
}

/// Aggregates matches into endpoint groups, deterministic order.
pub fn aggregate_endpoints(
    matches: &[ConnectionMatch],
    side_a: &[TcpConnection],
    roles_a: &[ServerInfo],
    side_b: &[TcpConnection],
    roles_b: &[ServerInfo],
) -> Vec<EndpointGroup> {
    use std::collections::BTreeMap;

    struct Accumulator {
        count: u64,
        confidence_sum: f64,
        weakest: Confidence,
        sample_a: usize,
        sample_b: usize,
    }

    let mut groups: BTreeMap<(EndpointTuple, EndpointTuple, bool), Accumulator> = BTreeMap::new();

    for m in matches {
        let conn_a = &side_a[m.a_index];
        let conn_b = &side_b[m.b_index];
        let role_a = &roles_a[m.a_index];
        let role_b = &roles_b[m.b_index];
        let weaker = role_a.confidence.min(role_b.confidence);

        let tuple_a = endpoint_tuple(conn_a, role_a);
        let tuple_b = endpoint_tuple(conn_b, role_b);

        let mut add = |tuple_a: EndpointTuple, tuple_b: EndpointTuple, reversed: bool| {
            // Unordered pair: normalise so (a, b) and (b, a) collapse.
            let key = if tuple_a <= tuple_b {
                (tuple_a, tuple_b, reversed)
            } else {
                (tuple_b, tuple_a, reversed)
            };
            let entry = groups.entry(key).or_insert(Accumulator {
                count: 0,
                confidence_sum: 0.0,
                weakest: Confidence::High,
                sample_a: m.a_index,
                sample_b: m.b_index,
            });
            entry.count += 1;
            entry.confidence_sum += weaker.weight();
            entry.weakest = entry.weakest.min(weaker);
        };

        add(tuple_a, tuple_b, false);
        if weaker == Confidence::VeryLow {
            // Both role hypotheses are plausible; surface the swap too.
            add(
                reverse_tuple(&tuple_a, conn_a.client_port),
                reverse_tuple(&tuple_b, conn_b.client_port),
                true,
            );
        }
    }

    groups
        .into_iter()
        .map(|((tuple_a, tuple_b, reversed), acc)| {
            let conn_a = &side_a[acc.sample_a];
            let conn_b = &side_b[acc.sample_b];
            EndpointGroup {
                tuple_a,
                tuple_b,
                match_count: acc.count,
                mean_confidence: acc.confidence_sum / acc.count as f64,
                confidence: acc.weakest,
                client_hops_a: conn_a.client_ttl.map(ttl_hops),
                server_hops_a: conn_a.server_ttl.map(ttl_hops),
                client_hops_b: conn_b.client_ttl.map(ttl_hops),
                server_hops_b: conn_b.server_ttl.map(ttl_hops),
                reversed,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::net::IpAddr;

    use super::{aggregate_endpoints, ttl_hops};
    use crate::connection::TcpConnection;
    use crate::connection::server_role::{Confidence, ServerInfo};
    use crate::matching::score::MatchScore;
    use crate::matching::ConnectionMatch;

    fn conn(stream_id: u32, client: (&str, u16), server: (&str, u16)) -> TcpConnection {
        let client_ip: IpAddr = client.0.parse().unwrap();
        let server_ip: IpAddr = server.0.parse().unwrap();
        TcpConnection {
            stream_id,
            client_ip,
            client_port: client.1,
            server_ip,
            server_port: server.1,
            oriented_by_syn: true,
            first_packet_time: 0.0,
            last_packet_time: 1.0,
            first_time_raw: "0.0".to_string(),
            last_time_raw: "1.0".to_string(),
            packet_count: 4,
            syn_options: None,
            isn_client: None,
            isn_server: None,
            ts_val_first: None,
            ts_ecr_first: None,
            payload_hash_client_first: None,
            payload_hash_server_first: None,
            length_signature: Vec::new(),
            ipid_set: BTreeSet::new(),
            ipid_first: None,
            is_header_only: false,
            client_ttl: Some(57),
            server_ttl: Some(119),
        }
    }

    fn role(conn: &TcpConnection, confidence: Confidence) -> ServerInfo {
        ServerInfo {
            server_ip: conn.server_ip,
            server_port: conn.server_port,
            confidence,
            layer: "test",
        }
    }

    fn score() -> MatchScore {
        MatchScore {
            raw: 0.8,
            available_weight: 1.0,
            normalized: 0.8,
            evidence: vec!["ipid-intersection"],
        }
    }

    #[test]
    fn hop_inference_uses_nearest_standard_ttl() {
        assert_eq!(ttl_hops(57), 7);
        assert_eq!(ttl_hops(64), 0);
        assert_eq!(ttl_hops(119), 9);
        assert_eq!(ttl_hops(250), 5);
        assert_eq!(ttl_hops(128), 0);
    }

    #[test]
    fn matches_with_same_endpoints_collapse() {
        let side_a = vec![
            conn(0, ("10.0.0.1", 50001), ("10.0.0.9", 443)),
            conn(1, ("10.0.0.1", 50002), ("10.0.0.9", 443)),
        ];
        let side_b = vec![
            conn(0, ("10.0.0.1", 50001), ("10.0.0.9", 443)),
            conn(1, ("10.0.0.1", 50002), ("10.0.0.9", 443)),
        ];
        let roles_a: Vec<_> = side_a.iter().map(|c| role(c, Confidence::High)).collect();
        let roles_b: Vec<_> = side_b.iter().map(|c| role(c, Confidence::High)).collect();
        let matches = vec![
            ConnectionMatch { a_index: 0, b_index: 0, score: score() },
            ConnectionMatch { a_index: 1, b_index: 1, score: score() },
        ];
        let groups = aggregate_endpoints(&matches, &side_a, &roles_a, &side_b, &roles_b);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].match_count, 2);
        assert!(!groups[0].reversed);
        assert_eq!(groups[0].client_hops_a, Some(7));
        assert_eq!(groups[0].server_hops_a, Some(9));
    }

    #[test]
    fn very_low_confidence_emits_both_hypotheses() {
        let side_a = vec![conn(0, ("10.0.0.1", 50001), ("10.0.0.9", 40000))];
        let side_b = vec![conn(0, ("10.0.0.1", 50001), ("10.0.0.9", 40000))];
        let roles_a = vec![role(&side_a[0], Confidence::VeryLow)];
        let roles_b = vec![role(&side_b[0], Confidence::VeryLow)];
        let matches = vec![ConnectionMatch { a_index: 0, b_index: 0, score: score() }];
        let groups = aggregate_endpoints(&matches, &side_a, &roles_a, &side_b, &roles_b);
        assert_eq!(groups.len(), 2);
        let forward = groups.iter().find(|g| !g.reversed).expect("forward group");
        let reversed = groups.iter().find(|g| g.reversed).expect("reversed group");
        assert_eq!(forward.match_count, reversed.match_count);
        assert_eq!(forward.tuple_a.server_ip, reversed.tuple_a.client_ip);
    }

    #[test]
    fn weaker_side_decides_group_confidence() {
        let side_a = vec![conn(0, ("10.0.0.1", 50001), ("10.0.0.9", 443))];
        let side_b = vec![conn(0, ("10.0.0.1", 50001), ("10.0.0.9", 443))];
        let roles_a = vec![role(&side_a[0], Confidence::High)];
        let roles_b = vec![role(&side_b[0], Confidence::Medium)];
        let matches = vec![ConnectionMatch { a_index: 0, b_index: 0, score: score() }];
        let groups = aggregate_endpoints(&matches, &side_a, &roles_a, &side_b, &roles_b);
        assert_eq!(groups[0].confidence, Confidence::Medium);
        assert!((groups[0].mean_confidence - 0.6).abs() < 1e-9);
    }
}
