//! Packet-level diff of two matched streams.
//!
//! Packets are paired across captures by `(direction, ip_id)` — direction
//! disambiguation is mandatory, because the client and server halves of a
//! stream can recycle the same IP-ID and keying on the id alone would pair
//! a C→S packet with an S→C one. Within a key, packets pair up in frame
//! order; flag and sequence divergence is reported with literal before and
//! after values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::connection::{Direction, TcpConnection};
use crate::dissector::PacketRecord;

/// One divergence between the two observations of a matched stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PacketDiff {
    /// Keyed packet present only in capture A.
    OnlyInA {
        direction: Direction,
        ip_id: u16,
        frame_a: u64,
    },
    /// Keyed packet present only in capture B.
    OnlyInB {
        direction: Direction,
        ip_id: u16,
        frame_b: u64,
    },
    /// Both captures contain the key, with different packet counts.
    CountMismatch {
        direction: Direction,
        ip_id: u16,
        count_a: usize,
        count_b: usize,
    },
    /// A paired packet changed TCP flags between the vantage points.
    FlagMismatch {
        frame_a: u64,
        frame_b: u64,
        flags_a: u8,
        flags_b: u8,
    },
    /// A paired packet changed sequence number between the vantage points.
    SeqMismatch {
        frame_a: u64,
        frame_b: u64,
        seq_a: u32,
        seq_b: u32,
    },
}

/// One flag-change pattern with its frequency and a representative pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagChangeStat {
    /// Rendered `0x%04x->0x%04x` pattern, e.g. `0x0002->0x0010`.
    pub pattern: String,
    pub count: u64,
    pub example_frame_a: u64,
    pub example_frame_b: u64,
}

/// Complete diff of one matched pair, with per-category counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDiff {
    pub diffs: Vec<PacketDiff>,
    pub only_in_a: u64,
    pub only_in_b: u64,
    pub count_mismatches: u64,
    pub flag_mismatches: u64,
    pub seq_mismatches: u64,
    /// Flag-change histogram, most frequent first.
    pub flag_changes: Vec<FlagChangeStat>,
}

/// Renders a flag-change pattern the way the sink stores it.
pub fn flag_pattern(flags_a: u8, flags_b: u8) -> String {
    format!("0x{:04x}->0x{:04x}", flags_a, flags_b)
}

/// Diffs the packets of a matched stream pair.
///
/// Packets without an IP-ID (IPv6) cannot be keyed and are skipped. Keys
/// iterate in `(direction, ip_id)` order, so output is deterministic.
pub fn diff_streams(
    conn_a: &TcpConnection,
    packets_a: &[&PacketRecord],
    conn_b: &TcpConnection,
    packets_b: &[&PacketRecord],
) -> StreamDiff {
    let keyed_a = key_packets(conn_a, packets_a);
    let keyed_b = key_packets(conn_b, packets_b);

    let mut diff = StreamDiff::default();
    let mut histogram: BTreeMap<String, FlagChangeStat> = BTreeMap::new();

    let mut keys: Vec<&(Direction, u16)> = keyed_a.keys().chain(keyed_b.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        match (keyed_a.get(key), keyed_b.get(key)) {
            (Some(list_a), None) => {
                for packet in list_a {
                    diff.only_in_a += 1;
                    diff.diffs.push(PacketDiff::OnlyInA {
                        direction: key.0,
                        ip_id: key.1,
                        frame_a: packet.frame_number,
                    });
                }
            }
            (None, Some(list_b)) => {
                for packet in list_b {
                    diff.only_in_b += 1;
                    diff.diffs.push(PacketDiff::OnlyInB {
                        direction: key.0,
                        ip_id: key.1,
                        frame_b: packet.frame_number,
                    });
                }
            }
            (Some(list_a), Some(list_b)) => {
                if list_a.len() != list_b.len() {
                    diff.count_mismatches += 1;
                    diff.diffs.push(PacketDiff::CountMismatch {
                        direction: key.0,
                        ip_id: key.1,
                        count_a: list_a.len(),
                        count_b: list_b.len(),
                    });
                }
                for (packet_a, packet_b) in list_a.iter().zip(list_b.iter()) {
                    if packet_a.flags != packet_b.flags {
                        diff.flag_mismatches += 1;
                        diff.diffs.push(PacketDiff::FlagMismatch {
                            frame_a: packet_a.frame_number,
                            frame_b: packet_b.frame_number,
                            flags_a: packet_a.flags,
                            flags_b: packet_b.flags,
                        });
                        let pattern = flag_pattern(packet_a.flags, packet_b.flags);
                        histogram
                            .entry(pattern.clone())
                            .or_insert_with(|| FlagChangeStat {
                                pattern,
                                count: 0,
                                example_frame_a: packet_a.frame_number,
                                example_frame_b: packet_b.frame_number,
                            })
                            .count += 1;
                    }
                    if packet_a.seq != packet_b.seq {
                        diff.seq_mismatches += 1;
                        diff.diffs.push(PacketDiff::SeqMismatch {
                            frame_a: packet_a.frame_number,
                            frame_b: packet_b.frame_number,
                            seq_a: packet_a.seq,
                            seq_b: packet_b.seq,
                        });
                    }
                }
            }
            (None, None) => unreachable!("key came from one of the maps"),
        }
    }

    let mut flag_changes: Vec<FlagChangeStat> = histogram.into_values().collect();
    flag_changes.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
    diff.flag_changes = flag_changes;
    diff
}

fn key_packets<'a>(
    conn: &TcpConnection,
    packets: &[&'a PacketRecord],
) -> BTreeMap<(Direction, u16), Vec<&'a PacketRecord>> {
    let mut keyed: BTreeMap<(Direction, u16), Vec<&PacketRecord>> = BTreeMap::new();
    for packet in packets {
        let Some(ip_id) = packet.ip_id else {
            continue;
        };
        let direction = conn.direction_of(&packet.src_ip, packet.src_port);
        keyed.entry((direction, ip_id)).or_default().push(packet);
    }
    keyed
}
