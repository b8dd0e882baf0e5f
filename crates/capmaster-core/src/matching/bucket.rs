//! Candidate bucketing.
//!
//! Scoring every A-stream against every B-stream is O(n·m); bucketing both
//! sides by a direction-agnostic anchor first bounds the candidate set to
//! pairs that could plausibly be the same connection. The anchor ignores
//! which endpoint was recorded as source: NAT and LB vantage points disagree
//! about direction, never about the participating pair.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::config::BucketStrategy;
use crate::connection::TcpConnection;

/// Bucket map: anchor key to connection positions, deterministic order.
pub type Buckets = BTreeMap<String, Vec<usize>>;

/// Partitions one file's connections under the given strategy. `Auto` must
/// be resolved by [`choose_strategy`] first.
pub fn bucket_connections(connections: &[TcpConnection], strategy: BucketStrategy) -> Buckets {
    let mut buckets: Buckets = BTreeMap::new();
    for (position, conn) in connections.iter().enumerate() {
        buckets
            .entry(bucket_key(conn, strategy))
            .or_default()
            .push(position);
    }
    buckets
}

fn bucket_key(conn: &TcpConnection, strategy: BucketStrategy) -> String {
    match strategy {
        BucketStrategy::Server => {
            let (low, high) = order_ips(&conn.client_ip, &conn.server_ip);
            format!("{low}:{high}")
        }
        BucketStrategy::Port => {
            let (low, high) = if conn.client_port <= conn.server_port {
                (conn.client_port, conn.server_port)
            } else {
                (conn.server_port, conn.client_port)
            };
            format!("{low}:{high}")
        }
        BucketStrategy::None => "*".to_string(),
        BucketStrategy::Auto => unreachable!("auto strategy must be resolved before bucketing"),
    }
}

fn order_ips<'a>(a: &'a IpAddr, b: &'a IpAddr) -> (&'a IpAddr, &'a IpAddr) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Resolves `Auto` by inspecting the server anchors of both files: shared
/// server addresses favour `Server`; shared ports with disjoint addresses
/// (addresses rewritten by NAT) favour `Port`; anything else falls back to
/// `Server` with a warning.
pub fn choose_strategy(
    requested: BucketStrategy,
    side_a: &[TcpConnection],
    side_b: &[TcpConnection],
) -> BucketStrategy {
    if requested != BucketStrategy::Auto {
        return requested;
    }

    let server_ips = |conns: &[TcpConnection]| -> BTreeSet<IpAddr> {
        conns.iter().map(|c| c.server_ip).collect()
    };
    let server_ports = |conns: &[TcpConnection]| -> BTreeSet<u16> {
        conns.iter().map(|c| c.server_port).collect()
    };

    let ips_a = server_ips(side_a);
    let ips_b = server_ips(side_b);
    if !ips_a.is_empty() && ips_a == ips_b {
        return BucketStrategy::Server;
    }

    let ips_intersect = ips_a.intersection(&ips_b).next().is_some();
    let ports_intersect = server_ports(side_a)
        .intersection(&server_ports(side_b))
        .next()
        .is_some();
    if ports_intersect && !ips_intersect {
        return BucketStrategy::Port;
    }

    log::warn!(
        "auto bucketing: server addresses only partially coincide; falling back to server anchors"
    );
    BucketStrategy::Server
}
