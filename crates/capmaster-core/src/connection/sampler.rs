//! Time-stratified connection subsampling.
//!
//! Large captures are cut down before matching: connections are bucketed
//! into time strata by first-packet time and sampled proportionally, while
//! minority connections (very short or very long streams) are retained
//! unconditionally up to a quota — they are exactly the streams the
//! correlator is most likely asked about. The RNG is seeded from the input
//! paths (or an explicit override) so a rerun reproduces the same sample.

use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;

use super::TcpConnection;
use crate::config::SampleConfig;

/// Hard floor and ceiling on the sample target.
const TARGET_MIN: usize = 100;
const TARGET_MAX: usize = 3000;
/// Packet-count bounds marking minority (outlier) connections.
const MINORITY_SHORT: u64 = 3;
const MINORITY_LONG: u64 = 500;

/// Derives the default RNG seed from the capture pair (FNV-1a fold), so the
/// sample is stable for a given input pair without any configuration.
pub fn derive_seed(path_a: &Path, path_b: &Path) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for path in [path_a, path_b] {
        for byte in path.display().to_string().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x1000_0000_01b3);
        }
    }
    hash
}

/// Applies stratified sampling when the connection count exceeds the
/// configured threshold; otherwise returns the input untouched. Output is
/// sorted by stream id either way.
pub fn sample_connections(
    mut connections: Vec<TcpConnection>,
    config: &SampleConfig,
    seed: u64,
) -> Vec<TcpConnection> {
    connections.sort_by_key(|c| c.stream_id);
    if connections.len() <= config.threshold {
        return connections;
    }

    let total = connections.len();
    let target = ((config.rate * total as f64).round() as usize).clamp(TARGET_MIN, TARGET_MAX);
    if target >= total {
        return connections;
    }

    let is_minority =
        |c: &TcpConnection| c.packet_count <= MINORITY_SHORT || c.packet_count >= MINORITY_LONG;
    let minority_quota = ((target as f64 * 0.05).round() as usize).max(5);

    let mut keep = vec![false; total];
    let mut kept = 0usize;
    for (position, conn) in connections.iter().enumerate() {
        if kept >= minority_quota {
            break;
        }
        if is_minority(conn) {
            keep[position] = true;
            kept += 1;
        }
    }

    // Stratify the remainder by first-packet time and sample each stratum
    // proportionally to its population.
    let start = connections
        .iter()
        .map(|c| c.first_packet_time)
        .fold(f64::INFINITY, f64::min);
    let end = connections
        .iter()
        .map(|c| c.first_packet_time)
        .fold(f64::NEG_INFINITY, f64::max);
    let span = (end - start).max(f64::EPSILON);

    let mut strata: Vec<Vec<usize>> = vec![Vec::new(); config.strata];
    for (position, conn) in connections.iter().enumerate() {
        if keep[position] {
            continue;
        }
        let fraction = (conn.first_packet_time - start) / span;
        let stratum = ((fraction * config.strata as f64) as usize).min(config.strata - 1);
        strata[stratum].push(position);
    }

    let pool: usize = strata.iter().map(Vec::len).sum();
    let budget = target.saturating_sub(kept);
    let mut rng = StdRng::seed_from_u64(seed);
    for stratum in &strata {
        if stratum.is_empty() || budget == 0 {
            continue;
        }
        let share = ((stratum.len() as f64 / pool as f64) * budget as f64).round() as usize;
        let take = share.min(stratum.len());
        if take == 0 {
            continue;
        }
        for chosen in index::sample(&mut rng, stratum.len(), take).into_iter() {
            keep[stratum[chosen]] = true;
        }
    }

    let sampled: Vec<TcpConnection> = connections
        .into_iter()
        .enumerate()
        .filter_map(|(position, conn)| keep[position].then_some(conn))
        .collect();
    log::info!(
        "sampled {} of {} connections (target {}, {} minority retained)",
        sampled.len(),
        total,
        target,
        kept
    );
    sampled
}
