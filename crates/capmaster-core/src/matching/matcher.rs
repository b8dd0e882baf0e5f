//! Candidate assignment.
//!
//! Candidates are enumerated bucket by bucket, scored (in parallel — the
//! scorer is pure CPU), filtered by threshold, then assigned under a stable
//! total order: descending normalized score, then ascending stream ids.
//! Re-running on identical input yields an identical match sequence.

use std::collections::HashSet;
use std::thread;

use serde::{Deserialize, Serialize};

use super::bucket::bucket_connections;
use super::score::{MatchScore, score_pair};
use crate::config::{BucketStrategy, MatchConfig, MatchMode};
use crate::connection::TcpConnection;

/// One accepted pairing between a stream of file A and a stream of file B.
#[derive(Debug, Clone)]
pub struct ConnectionMatch {
    /// Position into file A's connection vector.
    pub a_index: usize,
    /// Position into file B's connection vector.
    pub b_index: usize,
    pub score: MatchScore,
}

/// Aggregate statistics over one matching run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchStats {
    pub total: usize,
    pub mean_normalized: f64,
    pub unique_a: usize,
    pub unique_b: usize,
    /// Largest number of partners any single connection received.
    pub max_fanout: usize,
    /// Mean partners per matched connection; 1.0 in one-to-one mode.
    pub mean_fanout: f64,
}

/// Scores and assigns candidates. `strategy` must already be resolved
/// (never `Auto`).
pub fn match_connections(
    side_a: &[TcpConnection],
    side_b: &[TcpConnection],
    strategy: BucketStrategy,
    config: &MatchConfig,
) -> (Vec<ConnectionMatch>, MatchStats) {
    let buckets_a = bucket_connections(side_a, strategy);
    let buckets_b = bucket_connections(side_b, strategy);

    // Candidate index pairs, bucket order; only keys present on both sides
    // can ever match (G3 by construction of the anchor).
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for (key, members_a) in &buckets_a {
        let Some(members_b) = buckets_b.get(key) else {
            continue;
        };
        for &a_index in members_a {
            for &b_index in members_b {
                pairs.push((a_index, b_index));
            }
        }
    }

    let scored = score_candidates(side_a, side_b, &pairs, config);

    let mut candidates: Vec<ConnectionMatch> = scored
        .into_iter()
        .filter(|m| !m.score.gate_rejected())
        .filter(|m| m.score.available_weight > 0.0)
        .filter(|m| m.score.normalized >= config.threshold)
        .collect();

    candidates.sort_by(|left, right| {
        right
            .score
            .normalized
            .total_cmp(&left.score.normalized)
            .then_with(|| {
                let l = (side_a[left.a_index].stream_id, side_b[left.b_index].stream_id);
                let r = (side_a[right.a_index].stream_id, side_b[right.b_index].stream_id);
                l.cmp(&r)
            })
    });

    let matches = match config.mode {
        MatchMode::OneToOne => {
            let mut used_a = HashSet::new();
            let mut used_b = HashSet::new();
            candidates
                .into_iter()
                .filter(|m| {
                    if used_a.contains(&m.a_index) || used_b.contains(&m.b_index) {
                        return false;
                    }
                    used_a.insert(m.a_index);
                    used_b.insert(m.b_index);
                    true
                })
                .collect()
        }
        MatchMode::OneToMany => candidates,
    };

    let stats = compute_stats(&matches);
    (matches, stats)
}

/// Scores candidate pairs across worker threads. Chunk results concatenate
/// in submission order, so parallelism never changes the outcome.
fn score_candidates(
    side_a: &[TcpConnection],
    side_b: &[TcpConnection],
    pairs: &[(usize, usize)],
    config: &MatchConfig,
) -> Vec<ConnectionMatch> {
    if pairs.is_empty() {
        return Vec::new();
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
        .min(pairs.len());
    let chunk_len = pairs.len().div_ceil(workers);

    thread::scope(|scope| {
        let handles: Vec<_> = pairs
            .chunks(chunk_len)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|&(a_index, b_index)| ConnectionMatch {
                            a_index,
                            b_index,
                            score: score_pair(&side_a[a_index], &side_b[b_index], config),
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("scorer worker panicked"))
            .collect()
    })
}

fn compute_stats(matches: &[ConnectionMatch]) -> MatchStats {
    let total = matches.len();
    let mean_normalized = if total == 0 {
        0.0
    } else {
        matches.iter().map(|m| m.score.normalized).sum::<f64>() / total as f64
    };

    let mut per_a: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
    let mut per_b: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
    for m in matches {
        *per_a.entry(m.a_index).or_default() += 1;
        *per_b.entry(m.b_index).or_default() += 1;
    }
    let max_fanout = per_a
        .values()
        .chain(per_b.values())
        .copied()
        .max()
        .unwrap_or(0);
    let matched_endpoints = per_a.len() + per_b.len();
    let mean_fanout = if matched_endpoints == 0 {
        0.0
    } else {
        (2 * total) as f64 / matched_endpoints as f64
    };

    MatchStats {
        total,
        mean_normalized,
        unique_a: per_a.len(),
        unique_b: per_b.len(),
        max_fanout,
        mean_fanout,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::net::IpAddr;

    use super::match_connections;
    use crate::config::{BucketStrategy, MatchConfig, MatchMode};
    use crate::connection::TcpConnection;

    fn conn(stream_id: u32, ipids: &[u16], window: (f64, f64)) -> TcpConnection {
        let client_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let server_ip: IpAddr = "10.0.0.2".parse().unwrap();
        TcpConnection {
            stream_id,
            client_ip,
            client_port: 51000,
            server_ip,
            server_port: 443,
            oriented_by_syn: true,
            first_packet_time: window.0,
            last_packet_time: window.1,
            first_time_raw: format!("{:.6}", window.0),
            last_time_raw: format!("{:.6}", window.1),
            packet_count: 10,
            syn_options: Some("mss=1460;ws=7;sack=1;ts=1".to_string()),
            isn_client: Some(1000),
            isn_server: Some(2000),
            ts_val_first: None,
            ts_ecr_first: None,
            payload_hash_client_first: None,
            payload_hash_server_first: None,
            length_signature: Vec::new(),
            ipid_set: ipids.iter().copied().collect::<BTreeSet<u16>>(),
            ipid_first: ipids.first().copied(),
            is_header_only: false,
            client_ttl: None,
            server_ttl: None,
        }
    }

    /// One B stream covering the whole window vs sixteen A segments drawn
    /// from the same IP-ID pool in disjoint windows.
    fn segmented_sides() -> (Vec<TcpConnection>, Vec<TcpConnection>) {
        let mut side_a = Vec::new();
        let mut pool = Vec::new();
        for segment in 0..16u32 {
            let ipid = 0x1000 + segment as u16;
            pool.push(ipid);
            let start = segment as f64 * 1000.0;
            side_a.push(conn(segment, &[ipid], (start, start + 999.0)));
        }
        let side_b = vec![conn(0, &pool, (0.0, 16000.0))];
        (side_a, side_b)
    }

    #[test]
    fn one_to_many_matches_every_segment() {
        let (side_a, side_b) = segmented_sides();
        let config = MatchConfig {
            mode: MatchMode::OneToMany,
            ..MatchConfig::default()
        };
        let (matches, stats) =
            match_connections(&side_a, &side_b, BucketStrategy::Server, &config);
        assert_eq!(matches.len(), 16);
        assert_eq!(stats.unique_b, 1);
        assert_eq!(stats.max_fanout, 16);
    }

    #[test]
    fn one_to_one_picks_a_single_segment() {
        let (side_a, side_b) = segmented_sides();
        let config = MatchConfig::default();
        let (matches, stats) =
            match_connections(&side_a, &side_b, BucketStrategy::Server, &config);
        assert_eq!(matches.len(), 1);
        assert_eq!(stats.max_fanout, 1);
    }

    #[test]
    fn deterministic_across_runs() {
        let (side_a, side_b) = segmented_sides();
        let config = MatchConfig {
            mode: MatchMode::OneToMany,
            ..MatchConfig::default()
        };
        let run = || {
            let (matches, _) =
                match_connections(&side_a, &side_b, BucketStrategy::Server, &config);
            matches
                .iter()
                .map(|m| (m.a_index, m.b_index))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn ties_resolve_by_stream_id() {
        // Two identical A streams compete for one B stream: the smaller
        // stream id wins the greedy pass.
        let side_a = vec![
            conn(7, &[0x42], (0.0, 10.0)),
            conn(3, &[0x42], (0.0, 10.0)),
        ];
        let side_b = vec![conn(0, &[0x42], (0.0, 10.0))];
        let config = MatchConfig::default();
        let (matches, _) = match_connections(&side_a, &side_b, BucketStrategy::Server, &config);
        assert_eq!(matches.len(), 1);
        assert_eq!(side_a[matches[0].a_index].stream_id, 3);
    }

    #[test]
    fn below_threshold_is_dropped() {
        let mut weak = conn(0, &[0x42], (0.0, 10.0));
        weak.syn_options = Some("mss=9000;ws=1;sack=0;ts=0".to_string());
        weak.isn_client = Some(9);
        weak.isn_server = Some(8);
        let side_a = vec![weak];
        let side_b = vec![conn(0, &[0x42], (0.0, 10.0))];
        let config = MatchConfig::default();
        let (matches, stats) = match_connections(&side_a, &side_b, BucketStrategy::Server, &config);
        assert!(matches.is_empty());
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn empty_sides_produce_empty_stats() {
        let config = MatchConfig::default();
        let (matches, stats) = match_connections(&[], &[], BucketStrategy::Server, &config);
        assert!(matches.is_empty());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.mean_normalized, 0.0);
    }
}
