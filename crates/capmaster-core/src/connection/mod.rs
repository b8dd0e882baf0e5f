//! TCP connection model and per-stream feature extraction.
//!
//! Packets arrive as a flat arena of [`PacketRecord`]s; the builder groups
//! them by dissector stream id and derives one immutable [`TcpConnection`]
//! per stream. Connections keep index slices into the arena rather than
//! owning packets, so the differ can revisit raw frames without the
//! connection graph holding cycles.

pub mod builder;
pub mod sampler;
pub mod server_role;

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Which endpoint of the connection sent a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Client,
    Server,
}

impl Direction {
    pub fn letter(&self) -> char {
        match self {
            Direction::Client => 'C',
            Direction::Server => 'S',
        }
    }
}

/// One `(direction, payload length)` entry of the length signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LengthToken {
    pub direction: Direction,
    pub length: u32,
}

impl fmt::Display for LengthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.direction.letter(), self.length)
    }
}

/// One TCP stream after grouping, with every feature the scorer consumes.
///
/// Built once per (file, stream) and immutable afterwards. Exactly one
/// client and one server endpoint; `first_packet_time <= last_packet_time`;
/// `packet_count >= 1`.
#[derive(Debug, Clone)]
pub struct TcpConnection {
    pub stream_id: u32,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    /// Whether the client/server assignment came from an observed SYN
    /// (as opposed to the first-packet fallback).
    pub oriented_by_syn: bool,
    pub first_packet_time: f64,
    pub last_packet_time: f64,
    /// Dissector strings for the first/last frame, kept verbatim so the
    /// sink can emit full-precision nanoseconds.
    pub first_time_raw: String,
    pub last_time_raw: String,
    pub packet_count: u64,
    /// Canonical handshake fingerprint `mss=..;ws=..;sack=0|1;ts=0|1`,
    /// absent when no client SYN was captured.
    pub syn_options: Option<String>,
    pub isn_client: Option<u32>,
    pub isn_server: Option<u32>,
    pub ts_val_first: Option<u32>,
    pub ts_ecr_first: Option<u32>,
    /// MD5 over the first ≤256 payload bytes of the first payload-bearing
    /// packet in each direction. Absent means no contribution, not zero.
    pub payload_hash_client_first: Option<u128>,
    pub payload_hash_server_first: Option<u128>,
    pub length_signature: Vec<LengthToken>,
    /// Every IP-ID observed in the stream. Zero is a value; absence (IPv6)
    /// yields an empty set.
    pub ipid_set: BTreeSet<u16>,
    /// First IP-ID in frame order, reporting only — never a gate by itself.
    pub ipid_first: Option<u16>,
    /// True when ≥80% of frames were truncated at capture time.
    pub is_header_only: bool,
    pub client_ttl: Option<u8>,
    pub server_ttl: Option<u8>,
}

impl TcpConnection {
    /// Classifies a packet of this stream by sender.
    pub fn direction_of(&self, src_ip: &IpAddr, src_port: u16) -> Direction {
        if *src_ip == self.client_ip && src_port == self.client_port {
            Direction::Client
        } else {
            Direction::Server
        }
    }

    /// Observation windows overlap unless one ends before the other starts.
    pub fn overlaps_in_time(&self, other: &TcpConnection) -> bool {
        !(self.last_packet_time < other.first_packet_time
            || other.last_packet_time < self.first_packet_time)
    }

    /// True when the two streams share at least one captured IP-ID.
    pub fn shares_ipid(&self, other: &TcpConnection) -> bool {
        if self.ipid_set.len() > other.ipid_set.len() {
            return other.shares_ipid(self);
        }
        self.ipid_set.iter().any(|id| other.ipid_set.contains(id))
    }

    /// `ip:port` rendering used by reports.
    pub fn client_endpoint(&self) -> String {
        format_endpoint(&self.client_ip, self.client_port)
    }

    pub fn server_endpoint(&self) -> String {
        format_endpoint(&self.server_ip, self.server_port)
    }
}

pub(crate) fn format_endpoint(ip: &IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(addr) => format!("{}:{}", addr, port),
        IpAddr::V6(addr) => format!("[{}]:{}", addr, port),
    }
}
