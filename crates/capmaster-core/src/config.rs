//! Analysis configuration and validation.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default acceptance threshold on the normalized score.
pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.60;
/// Default number of `(direction, length)` tokens in the length signature.
pub const DEFAULT_LENGTH_SIGNATURE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Candidate bucketing strategy (§ bucketer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketStrategy {
    /// Key on the direction-agnostic address pair.
    Server,
    /// Key on the sorted port pair.
    Port,
    /// Single bucket; every cross-file pair is a candidate.
    None,
    /// Inspect the two files and pick `Server` or `Port`.
    Auto,
}

impl FromStr for BucketStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "port" => Ok(Self::Port),
            "none" => Ok(Self::None),
            "auto" => Ok(Self::Auto),
            other => Err(ConfigError::Invalid(format!(
                "unknown bucket strategy `{other}` (expected server|port|none|auto)"
            ))),
        }
    }
}

/// Match cardinality across the two captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    /// Greedy one-to-one assignment (default).
    OneToOne,
    /// A stream may pair with many on the other side (segmented captures).
    OneToMany,
}

impl FromStr for MatchMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "one-to-one" | "1:1" => Ok(Self::OneToOne),
            "one-to-many" | "1:n" => Ok(Self::OneToMany),
            other => Err(ConfigError::Invalid(format!(
                "unknown match mode `{other}` (expected one-to-one|one-to-many)"
            ))),
        }
    }
}

/// IP-ID hard-gate policy. IPv6 traffic carries no IP-ID, so the gate can
/// never pass there; `Strict` fails fast on an IPv6-only pair, `Off` removes
/// the gate and its weight from scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpidGate {
    Strict,
    Off,
}

impl FromStr for IpidGate {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "off" => Ok(Self::Off),
            other => Err(ConfigError::Invalid(format!(
                "unknown ipid-gate policy `{other}` (expected strict|off)"
            ))),
        }
    }
}

/// Optional time-stratified subsampling of large connection sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Sampling kicks in above this many connections.
    pub threshold: usize,
    /// Fraction of connections to keep (target clamped to [100, 3000]).
    pub rate: f64,
    /// Number of time strata.
    pub strata: usize,
    /// Explicit RNG seed; when absent, derived from the input paths.
    pub seed: Option<u64>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            threshold: 1000,
            rate: 0.1,
            strata: 20,
            seed: None,
        }
    }
}

/// Full configuration for a match/compare run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    pub threshold: f64,
    pub mode: MatchMode,
    pub bucket: BucketStrategy,
    pub ipid_gate: IpidGate,
    /// Token budget of the length signature.
    pub length_signature_len: usize,
    /// `None` disables sampling entirely.
    pub sample: Option<SampleConfig>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SCORE_THRESHOLD,
            mode: MatchMode::OneToOne,
            bucket: BucketStrategy::Auto,
            ipid_gate: IpidGate::Strict,
            length_signature_len: DEFAULT_LENGTH_SIGNATURE_LEN,
            sample: None,
        }
    }
}

impl MatchConfig {
    /// Rejects out-of-range values before any work is done.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Invalid(format!(
                "score threshold {} out of range [0, 1]",
                self.threshold
            )));
        }
        if self.length_signature_len == 0 {
            return Err(ConfigError::Invalid(
                "length signature must keep at least one token".to_string(),
            ));
        }
        if let Some(sample) = &self.sample {
            if !(sample.rate > 0.0 && sample.rate <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "sample rate {} out of range (0, 1]",
                    sample.rate
                )));
            }
            if sample.strata == 0 {
                return Err(ConfigError::Invalid(
                    "sample strata must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}
