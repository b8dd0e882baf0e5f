//! Server-role inference.
//!
//! Five detection layers run in fixed priority order, each a strategy with
//! the same shape: look at one connection plus frozen whole-file tables,
//! return a server verdict or pass. The first hit wins; the port-comparison
//! fallback always hits, so every connection gets a verdict. The tables are
//! built in a first pass over the file and never mutated afterwards — there
//! is no process-wide state.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::TcpConnection;
use super::builder::endpoint_pair;

/// Detection confidence, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    VeryLow,
    Medium,
    High,
}

impl Confidence {
    /// Numeric weight used when averaging confidences across matches.
    pub fn weight(&self) -> f64 {
        match self {
            Confidence::VeryLow => 0.2,
            Confidence::Medium => 0.6,
            Confidence::High => 1.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Confidence::VeryLow => "very_low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

/// Verdict for one connection: which endpoint serves, and how sure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub confidence: Confidence,
    /// Name of the layer that produced the verdict.
    pub layer: &'static str,
}

/// Database services worth a medium-confidence verdict beyond the IANA
/// well-known range.
const DATABASE_PORTS: [u16; 10] = [
    1433, 1521, 3306, 5000, 5432, 6379, 8086, 9042, 11211, 27017,
];

/// Whole-file endpoint tables, frozen before detection starts.
#[derive(Debug, Default)]
pub struct EndpointTables {
    /// Distinct peer addresses seen per `(ip, port)` endpoint.
    peers: HashMap<(IpAddr, u16), HashSet<IpAddr>>,
    /// Distinct peer ports seen per `(ip, port)` endpoint.
    peer_ports: HashMap<(IpAddr, u16), HashSet<u16>>,
    /// Distinct addresses using each local port.
    ips_by_port: HashMap<u16, HashSet<IpAddr>>,
}

impl EndpointTables {
    /// First pass over the file's connections.
    pub fn build(connections: &[TcpConnection]) -> Self {
        let mut tables = EndpointTables::default();
        for conn in connections {
            let (client, server) = endpoint_pair(conn);
            for (local, remote) in [(client, server), (server, client)] {
                tables.peers.entry(local).or_default().insert(remote.0);
                tables.peer_ports.entry(local).or_default().insert(remote.1);
                tables.ips_by_port.entry(local.1).or_default().insert(local.0);
            }
        }
        tables
    }

    fn peer_count(&self, endpoint: &(IpAddr, u16)) -> usize {
        self.peers.get(endpoint).map_or(0, HashSet::len)
    }

    fn peer_port_count(&self, endpoint: &(IpAddr, u16)) -> usize {
        self.peer_ports.get(endpoint).map_or(0, HashSet::len)
    }

    fn port_user_count(&self, port: u16) -> usize {
        self.ips_by_port.get(&port).map_or(0, HashSet::len)
    }
}

/// The detection layers, in priority order.
#[derive(Debug, Clone, Copy)]
enum RoleSignal {
    SynDirection,
    WellKnownPort,
    Cardinality,
    PortReuse,
    PortStability,
    PortFallback,
}

const LAYERS: [RoleSignal; 6] = [
    RoleSignal::SynDirection,
    RoleSignal::WellKnownPort,
    RoleSignal::Cardinality,
    RoleSignal::PortReuse,
    RoleSignal::PortStability,
    RoleSignal::PortFallback,
];

impl RoleSignal {
    fn detect(&self, conn: &TcpConnection, tables: &EndpointTables) -> Option<ServerInfo> {
        let (client, server) = endpoint_pair(conn);
        match self {
            RoleSignal::SynDirection => conn.oriented_by_syn.then(|| ServerInfo {
                server_ip: server.0,
                server_port: server.1,
                confidence: Confidence::High,
                layer: "syn-direction",
            }),
            RoleSignal::WellKnownPort => {
                let verdict = |endpoint: (IpAddr, u16), confidence, layer| ServerInfo {
                    server_ip: endpoint.0,
                    server_port: endpoint.1,
                    confidence,
                    layer,
                };
                match (client.1 <= 1023, server.1 <= 1023) {
                    (false, true) => Some(verdict(server, Confidence::High, "well-known-port")),
                    (true, false) => Some(verdict(client, Confidence::High, "well-known-port")),
                    (true, true) => {
                        let lower = if client.1 <= server.1 { client } else { server };
                        Some(verdict(lower, Confidence::High, "well-known-port"))
                    }
                    (false, false) => {
                        match (
                            DATABASE_PORTS.contains(&client.1),
                            DATABASE_PORTS.contains(&server.1),
                        ) {
                            (false, true) => {
                                Some(verdict(server, Confidence::Medium, "database-port"))
                            }
                            (true, false) => {
                                Some(verdict(client, Confidence::Medium, "database-port"))
                            }
                            _ => None,
                        }
                    }
                }
            }
            RoleSignal::Cardinality => {
                let cardinality_verdict = |candidate: (IpAddr, u16), other: (IpAddr, u16)| {
                    let fan_in = tables.peer_count(&candidate);
                    let other_fan_in = tables.peer_count(&other);
                    let confidence = if fan_in >= 5 && other_fan_in < 2 {
                        Some(Confidence::High)
                    } else if (2..=4).contains(&fan_in) && other_fan_in < 2 {
                        Some(Confidence::Medium)
                    } else if other_fan_in > 0 && fan_in >= 3 * other_fan_in {
                        Some(Confidence::Medium)
                    } else {
                        None
                    };
                    confidence.map(|confidence| ServerInfo {
                        server_ip: candidate.0,
                        server_port: candidate.1,
                        confidence,
                        layer: "endpoint-cardinality",
                    })
                };
                // The busier endpoint decides; check both orientations.
                let server_first = cardinality_verdict(server, client);
                let client_first = cardinality_verdict(client, server);
                match (server_first, client_first) {
                    (Some(s), Some(c)) if c.confidence > s.confidence => Some(c),
                    (Some(s), _) => Some(s),
                    (None, c) => c,
                }
            }
            RoleSignal::PortReuse => {
                let reused = |endpoint: (IpAddr, u16)| tables.port_user_count(endpoint.1) >= 2;
                match (reused(client), reused(server)) {
                    (false, true) => Some(server),
                    (true, false) => Some(client),
                    _ => None,
                }
                .map(|endpoint| ServerInfo {
                    server_ip: endpoint.0,
                    server_port: endpoint.1,
                    confidence: Confidence::Medium,
                    layer: "port-reuse",
                })
            }
            RoleSignal::PortStability => {
                // A server endpoint faces many ephemeral peer ports while the
                // peers each face the one stable service port.
                let client_spread = tables.peer_port_count(&client);
                let server_spread = tables.peer_port_count(&server);
                let endpoint = if server_spread >= 2 && client_spread == 1 {
                    Some(server)
                } else if client_spread >= 2 && server_spread == 1 {
                    Some(client)
                } else {
                    None
                };
                endpoint.map(|endpoint| ServerInfo {
                    server_ip: endpoint.0,
                    server_port: endpoint.1,
                    confidence: Confidence::Medium,
                    layer: "port-stability",
                })
            }
            RoleSignal::PortFallback => {
                let endpoint = if server.1 <= client.1 { server } else { client };
                Some(ServerInfo {
                    server_ip: endpoint.0,
                    server_port: endpoint.1,
                    confidence: Confidence::VeryLow,
                    layer: "port-comparison",
                })
            }
        }
    }
}

/// Runs the layers in priority order; the fallback guarantees a verdict.
pub fn detect_server(conn: &TcpConnection, tables: &EndpointTables) -> ServerInfo {
    for layer in LAYERS {
        if let Some(info) = layer.detect(conn, tables) {
            return info;
        }
    }
    // The port-comparison fallback above always returns.
    unreachable!("role fallback must produce a verdict")
}

/// Detects roles for every connection of one file against its own tables.
pub fn detect_all(connections: &[TcpConnection]) -> Vec<ServerInfo> {
    let tables = EndpointTables::build(connections);
    let verdicts: Vec<ServerInfo> = connections
        .iter()
        .map(|conn| detect_server(conn, &tables))
        .collect();
    for (conn, verdict) in connections.iter().zip(&verdicts) {
        if verdict.confidence == Confidence::VeryLow {
            log::debug!(
                "stream {}: server role fell back to port comparison ({})",
                conn.stream_id,
                verdict.server_port
            );
        }
    }
    verdicts
}

#[cfg(test)]
mod tests {
    use super::{Confidence, EndpointTables, detect_server};
    use crate::connection::TcpConnection;
    use std::collections::BTreeSet;
    use std::net::IpAddr;

    fn conn(
        stream_id: u32,
        client: (&str, u16),
        server: (&str, u16),
        oriented_by_syn: bool,
    ) -> TcpConnection {
        let client_ip: IpAddr = client.0.parse().unwrap();
        let server_ip: IpAddr = server.0.parse().unwrap();
        TcpConnection {
            stream_id,
            client_ip,
            client_port: client.1,
            server_ip,
            server_port: server.1,
            oriented_by_syn,
            first_packet_time: 0.0,
            last_packet_time: 1.0,
            first_time_raw: "0.0".to_string(),
            last_time_raw: "1.0".to_string(),
            packet_count: 10,
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
            client_ttl: None,
            server_ttl: None,
        }
    }

    #[test]
    fn syn_direction_wins_with_high_confidence() {
        let c = conn(0, ("10.0.0.1", 50000), ("10.0.0.2", 9999), true);
        let tables = EndpointTables::build(std::slice::from_ref(&c));
        let info = detect_server(&c, &tables);
        assert_eq!(info.server_port, 9999);
        assert_eq!(info.confidence, Confidence::High);
        assert_eq!(info.layer, "syn-direction");
    }

    #[test]
    fn well_known_port_beats_heuristics() {
        let c = conn(0, ("10.0.0.1", 50000), ("10.0.0.2", 443), false);
        let tables = EndpointTables::build(std::slice::from_ref(&c));
        let info = detect_server(&c, &tables);
        assert_eq!(info.server_port, 443);
        assert_eq!(info.confidence, Confidence::High);
        assert_eq!(info.layer, "well-known-port");
    }

    #[test]
    fn database_port_is_medium() {
        let c = conn(0, ("10.0.0.1", 50000), ("10.0.0.2", 5432), false);
        let tables = EndpointTables::build(std::slice::from_ref(&c));
        let info = detect_server(&c, &tables);
        assert_eq!(info.server_port, 5432);
        assert_eq!(info.confidence, Confidence::Medium);
        assert_eq!(info.layer, "database-port");
    }

    #[test]
    fn cardinality_detects_fan_in() {
        // Five distinct clients against one endpoint on a non-standard port.
        let peers = ["10.0.1.1", "10.0.1.2", "10.0.1.3", "10.0.1.4", "10.0.1.5"];
        let conns: Vec<_> = peers
            .iter()
            .enumerate()
            .map(|(i, peer)| {
                conn(i as u32, (peer, 40000 + i as u16), ("10.0.0.2", 7777), false)
            })
            .collect();
        let tables = EndpointTables::build(&conns);
        let info = detect_server(&conns[0], &tables);
        assert_eq!(info.server_port, 7777);
        assert_eq!(info.confidence, Confidence::High);
        assert_eq!(info.layer, "endpoint-cardinality");
    }

    #[test]
    fn port_fallback_is_very_low() {
        let c = conn(0, ("10.0.0.1", 50000), ("10.0.0.2", 40000), false);
        let tables = EndpointTables::build(std::slice::from_ref(&c));
        let info = detect_server(&c, &tables);
        assert_eq!(info.server_port, 40000);
        assert_eq!(info.confidence, Confidence::VeryLow);
        assert_eq!(info.layer, "port-comparison");
    }

    #[test]
    fn confidence_ordering_and_weights() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::VeryLow);
        assert_eq!(Confidence::High.weight(), 1.0);
    }
}
