//! Pinned dissector field list and argv shape.
//!
//! The first 27 entries of [`FIELDS`] are the wire contract with the
//! dissector and must never be reordered. Entries after
//! [`CONTRACT_FIELD_COUNT`] are append-only extensions (PSH/URG flag bits
//! and IPv6 addresses) that older consumers simply ignore.

use std::path::Path;

/// Number of fields in the frozen part of the contract.
pub const CONTRACT_FIELD_COUNT: usize = 27;

/// Complete field list requested from the dissector, in output order.
pub const FIELDS: [&str; 31] = [
    "tcp.stream",
    "frame.number",
    "frame.time_epoch",
    "ip.version",
    "ip.src",
    "ip.dst",
    "tcp.srcport",
    "tcp.dstport",
    "tcp.flags.syn",
    "tcp.flags.ack",
    "tcp.flags.fin",
    "tcp.flags.rst",
    "tcp.seq",
    "tcp.ack",
    "tcp.len",
    "tcp.window_size_value",
    "tcp.options.mss_val",
    "tcp.options.wscale.shift",
    "tcp.options.sack_perm",
    "tcp.options.timestamp.tsval",
    "tcp.options.timestamp.tsecr",
    "ip.id",
    "ip.ttl",
    "ipv6.hlim",
    "frame.cap_len",
    "frame.len",
    "data.data",
    // append-only extensions
    "tcp.flags.push",
    "tcp.flags.urg",
    "ipv6.src",
    "ipv6.dst",
];

/// Builds the dissector argv for one capture file.
///
/// Sequence numbers must be absolute and TCP reassembly off — the stream
/// correlator works on raw per-frame values, and reassembled "packets"
/// would break the length signature and the IP-ID pairing.
pub fn build_args(input: &Path) -> Vec<String> {
    let mut args = vec![
        "-r".to_string(),
        input.display().to_string(),
        "-Y".to_string(),
        "tcp".to_string(),
        "-T".to_string(),
        "fields".to_string(),
        "-E".to_string(),
        "separator=/t".to_string(),
        "-E".to_string(),
        "occurrence=f".to_string(),
        "-o".to_string(),
        "tcp.relative_sequence_numbers:FALSE".to_string(),
        "-o".to_string(),
        "tcp.desegment_tcp_streams:FALSE".to_string(),
    ];
    for field in FIELDS {
        args.push("-e".to_string());
        args.push(field.to_string());
    }
    args
}
