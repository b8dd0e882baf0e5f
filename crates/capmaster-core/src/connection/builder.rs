//! Grouping packets into connections and deriving features.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use super::{Direction, LengthToken, TcpConnection};
use crate::dissector::PacketRecord;

/// Fraction of truncated frames above which a stream counts as header-only.
const HEADER_ONLY_RATIO: f64 = 0.80;
/// Payload digest covers at most this many leading bytes.
const PAYLOAD_DIGEST_LIMIT: usize = 256;

/// Arena index: per-stream frame indices into the record vector, in frame
/// order. Streams iterate in id order for deterministic output.
pub type StreamIndex = BTreeMap<u32, Vec<usize>>;

/// Groups records by stream id and derives one connection per stream.
pub fn build_connections(
    records: &[PacketRecord],
    length_signature_len: usize,
) -> (StreamIndex, Vec<TcpConnection>) {
    let mut index: StreamIndex = BTreeMap::new();
    for (position, record) in records.iter().enumerate() {
        index.entry(record.stream_id).or_default().push(position);
    }

    let connections = index
        .iter()
        .map(|(stream_id, positions)| {
            build_connection(*stream_id, positions, records, length_signature_len)
        })
        .collect();
    (index, connections)
}

fn build_connection(
    stream_id: u32,
    positions: &[usize],
    records: &[PacketRecord],
    length_signature_len: usize,
) -> TcpConnection {
    let stream = || positions.iter().map(|&i| &records[i]);

    // Client is the sender of the first SYN-without-ACK; without a captured
    // SYN, the sender of the first packet. Fixed for the stream's lifetime.
    let opening_syn = stream().find(|r| r.is_syn_only());
    let oriented_by_syn = opening_syn.is_some();
    let first_record = &records[positions[0]];
    let (client_ip, client_port) = match opening_syn {
        Some(syn) => (syn.src_ip, syn.src_port),
        None => (first_record.src_ip, first_record.src_port),
    };
    let (server_ip, server_port) = stream()
        .map(|r| {
            if r.src_ip == client_ip && r.src_port == client_port {
                (r.dst_ip, r.dst_port)
            } else {
                (r.src_ip, r.src_port)
            }
        })
        .next()
        .unwrap_or((first_record.dst_ip, first_record.dst_port));

    let direction_of = |r: &PacketRecord| -> Direction {
        if r.src_ip == client_ip && r.src_port == client_port {
            Direction::Client
        } else {
            Direction::Server
        }
    };

    let syn_options = opening_syn.map(canonical_syn_options);
    let isn_client = opening_syn.map(|syn| syn.seq);
    let isn_server = stream()
        .find(|r| r.is_syn_ack() && direction_of(r) == Direction::Server)
        .map(|r| r.seq);

    let ts_val_first = stream().find_map(|r| r.opt_tsval);
    let ts_ecr_first = stream().find_map(|r| r.opt_tsecr);

    let payload_hash_client_first = first_payload_digest(stream(), &direction_of, Direction::Client);
    let payload_hash_server_first = first_payload_digest(stream(), &direction_of, Direction::Server);

    let length_signature: Vec<LengthToken> = stream()
        .filter(|r| r.has_payload())
        .take(length_signature_len)
        .map(|r| LengthToken {
            direction: direction_of(r),
            length: r.tcp_len,
        })
        .collect();

    let ipid_set: BTreeSet<u16> = stream().filter_map(|r| r.ip_id).collect();
    let ipid_first = stream().find_map(|r| r.ip_id);

    let mut first_idx = positions[0];
    let mut last_idx = positions[0];
    for &position in positions {
        if records[position].timestamp < records[first_idx].timestamp {
            first_idx = position;
        }
        if records[position].timestamp > records[last_idx].timestamp {
            last_idx = position;
        }
    }

    let truncated = stream().filter(|r| r.is_truncated()).count();
    let is_header_only = truncated as f64 / positions.len() as f64 >= HEADER_ONLY_RATIO;

    let client_ttl = mode_ttl(stream(), &direction_of, Direction::Client);
    let server_ttl = mode_ttl(stream(), &direction_of, Direction::Server);

    TcpConnection {
        stream_id,
        client_ip,
        client_port,
        server_ip,
        server_port,
        oriented_by_syn,
        first_packet_time: records[first_idx].timestamp,
        last_packet_time: records[last_idx].timestamp,
        first_time_raw: records[first_idx].time_raw.clone(),
        last_time_raw: records[last_idx].time_raw.clone(),
        packet_count: positions.len() as u64,
        syn_options,
        isn_client,
        isn_server,
        ts_val_first,
        ts_ecr_first,
        payload_hash_client_first,
        payload_hash_server_first,
        length_signature,
        ipid_set,
        ipid_first,
        is_header_only,
        client_ttl,
        server_ttl,
    }
}

/// Canonical `mss=..;ws=..;sack=0|1;ts=0|1` with missing options rendered
/// as `0`. Option order is fixed so string equality is fingerprint equality.
fn canonical_syn_options(syn: &PacketRecord) -> String {
    format!(
        "mss={};ws={};sack={};ts={}",
        syn.opt_mss.unwrap_or(0),
        syn.opt_wscale.unwrap_or(0),
        u8::from(syn.opt_sack_perm),
        u8::from(syn.opt_tsval.is_some()),
    )
}

fn first_payload_digest<'a>(
    stream: impl Iterator<Item = &'a PacketRecord>,
    direction_of: &impl Fn(&PacketRecord) -> Direction,
    wanted: Direction,
) -> Option<u128> {
    let record = stream
        .filter(|r| direction_of(r) == wanted)
        .find(|r| r.has_payload())?;
    let payload = record.payload_bytes()?;
    let head = &payload[..payload.len().min(PAYLOAD_DIGEST_LIMIT)];
    Some(u128::from_be_bytes(md5::compute(head).0))
}

/// Most common TTL in one direction; ties resolve to the smaller value so
/// the result is stable across hash orderings.
fn mode_ttl<'a>(
    stream: impl Iterator<Item = &'a PacketRecord>,
    direction_of: &impl Fn(&PacketRecord) -> Direction,
    wanted: Direction,
) -> Option<u8> {
    let mut counts: HashMap<u8, u64> = HashMap::new();
    for record in stream.filter(|r| direction_of(r) == wanted) {
        if let Some(ttl) = record.ttl {
            *counts.entry(ttl).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|&(ttl, count)| (count, std::cmp::Reverse(ttl)))
        .map(|(ttl, _)| ttl)
}

/// Raw per-packet view the differ uses, resolved through the arena.
pub fn stream_records<'a>(
    index: &StreamIndex,
    records: &'a [PacketRecord],
    stream_id: u32,
) -> Vec<&'a PacketRecord> {
    index
        .get(&stream_id)
        .map(|positions| positions.iter().map(|&i| &records[i]).collect())
        .unwrap_or_default()
}

pub(crate) fn endpoint_pair(conn: &TcpConnection) -> ((IpAddr, u16), (IpAddr, u16)) {
    (
        (conn.client_ip, conn.client_port),
        (conn.server_ip, conn.server_port),
    )
}
