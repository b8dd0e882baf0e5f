//! Cross-capture candidate generation, scoring, and assignment.

pub mod bucket;
pub mod matcher;
pub mod score;

pub use bucket::{bucket_connections, choose_strategy};
pub use matcher::{ConnectionMatch, MatchStats, match_connections};
pub use score::{MatchScore, score_pair};
