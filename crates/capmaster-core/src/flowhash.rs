//! Direction-independent flow hashing.
//!
//! A matched connection is keyed downstream by a 64-bit hash of its 5-tuple
//! that must be identical no matter which direction the tuple was observed
//! in, and bit-exact across languages: the database consumer recomputes the
//! same value from its own packet view. The serialization and the hash
//! (SipHash-1-3, keys 0/0) are therefore pinned here byte for byte and
//! covered by a reference vector; neither may drift with a dependency bump,
//! which is why the hash is implemented in-module rather than through a
//! hashing crate.
//!
//! Canonical serialization of `(src_ip, src_port, dst_ip, dst_port, proto)`:
//! the endpoint with the numerically smaller port (smaller address on a port
//! tie) is emitted first. Both ports come first as two network-order bytes
//! each, then each address framed by little-endian u64 `0` and its octet
//! length, then little-endian u64 `1` and the protocol byte.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Which endpoint of the observed tuple is the canonical left-hand side.
///
/// `LhsGeRhs` means the observed source sorts after the destination
/// (`src_port > dst_port`, or ports equal and `src_ip >= dst_ip`). Swapping
/// the tuple flips the side but never the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowSide {
    /// Side could not be determined (never produced by [`flow_hash`]).
    Unknown = 0,
    /// Observed source is the canonical left-hand side.
    LhsGeRhs = 1,
    /// Observed destination is the canonical left-hand side.
    RhsGtLhs = 2,
}

impl FlowSide {
    /// Short tag used in reports (`lhs>=rhs` / `rhs>lhs`).
    pub fn tag(&self) -> &'static str {
        match self {
            FlowSide::Unknown => "unknown",
            FlowSide::LhsGeRhs => "lhs>=rhs",
            FlowSide::RhsGtLhs => "rhs>lhs",
        }
    }
}

/// Computes the direction-independent flow hash and the side indicator for
/// an observed 5-tuple.
///
/// # Examples
/// ```
/// use std::net::IpAddr;
///
/// use capmaster_core::flowhash::{FlowSide, flow_hash};
///
/// let src: IpAddr = "8.42.96.45".parse().unwrap();
/// let dst: IpAddr = "8.67.2.125".parse().unwrap();
/// let (hash, side) = flow_hash(src, 35101, dst, 26302, 6);
/// assert_eq!(hash, -1173584886679544929);
/// assert_eq!(side, FlowSide::LhsGeRhs);
///
/// let (rev_hash, rev_side) = flow_hash(dst, 26302, src, 35101, 6);
/// assert_eq!(rev_hash, hash);
/// assert_eq!(rev_side, FlowSide::RhsGtLhs);
/// ```
pub fn flow_hash(
    src_ip: IpAddr,
    src_port: u16,
    dst_ip: IpAddr,
    dst_port: u16,
    protocol: u8,
) -> (i64, FlowSide) {
    let lhs_ge = src_port > dst_port || (src_port == dst_port && ip_ge(&src_ip, &dst_ip));
    // Lesser endpoint serializes first; `src` is the lesser one exactly when
    // it is NOT the canonical left-hand side.
    let ((first_ip, first_port), (second_ip, second_port)) = if lhs_ge {
        ((dst_ip, dst_port), (src_ip, src_port))
    } else {
        ((src_ip, src_port), (dst_ip, dst_port))
    };

    // Worst case: 2 ports + 2 framed IPv6 addresses + option frame + proto.
    let mut bytes = Vec::with_capacity(4 + 2 * (16 + 16) + 9);
    bytes.extend_from_slice(&first_port.to_be_bytes());
    bytes.extend_from_slice(&second_port.to_be_bytes());
    for ip in [first_ip, second_ip] {
        bytes.extend_from_slice(&0u64.to_le_bytes());
        match ip {
            IpAddr::V4(v4) => {
                bytes.extend_from_slice(&4u64.to_le_bytes());
                bytes.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                bytes.extend_from_slice(&16u64.to_le_bytes());
                bytes.extend_from_slice(&v6.octets());
            }
        }
    }
    bytes.extend_from_slice(&1u64.to_le_bytes());
    bytes.push(protocol);

    let hash = siphash13(0, 0, &bytes) as i64;
    let side = if lhs_ge {
        FlowSide::LhsGeRhs
    } else {
        FlowSide::RhsGtLhs
    };
    (hash, side)
}

/// Address comparison for the side decision: numeric for IPv4, lexicographic
/// over packed bytes for IPv6. `std`'s `Ord` on `IpAddr` implements exactly
/// that (with V4 sorting before V6).
fn ip_ge(a: &IpAddr, b: &IpAddr) -> bool {
    a >= b
}

/// SipHash-1-3 over a byte slice with explicit keys.
///
/// One compression round per 8-byte little-endian word, three finalization
/// rounds, standard length-in-top-byte padding.
fn siphash13(k0: u64, k1: u64, data: &[u8]) -> u64 {
    let mut v0 = k0 ^ 0x736f_6d65_7073_6575;
    let mut v1 = k1 ^ 0x646f_7261_6e64_6f6d;
    let mut v2 = k0 ^ 0x6c79_6765_6e65_7261;
    let mut v3 = k1 ^ 0x7465_6462_7974_6573;

    let mut round = |v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64| {
        *v0 = v0.wrapping_add(*v1);
        *v1 = v1.rotate_left(13);
        *v1 ^= *v0;
        *v0 = v0.rotate_left(32);
        *v2 = v2.wrapping_add(*v3);
        *v3 = v3.rotate_left(16);
        *v3 ^= *v2;
        *v0 = v0.wrapping_add(*v3);
        *v3 = v3.rotate_left(21);
        *v3 ^= *v0;
        *v2 = v2.wrapping_add(*v1);
        *v1 = v1.rotate_left(17);
        *v1 ^= *v2;
        *v2 = v2.rotate_left(32);
    };

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let m = u64::from_le_bytes(word);
        v3 ^= m;
        round(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= m;
    }

    let tail = chunks.remainder();
    let mut last = [0u8; 8];
    last[..tail.len()].copy_from_slice(tail);
    let m = u64::from_le_bytes(last) | ((data.len() as u64 & 0xff) << 56);
    v3 ^= m;
    round(&mut v0, &mut v1, &mut v2, &mut v3);
    v0 ^= m;

    v2 ^= 0xff;
    for _ in 0..3 {
        round(&mut v0, &mut v1, &mut v2, &mut v3);
    }
    v0 ^ v1 ^ v2 ^ v3
}
