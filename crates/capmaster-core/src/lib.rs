//! CapMaster core library: cross-capture TCP connection correlation.
//!
//! Given two captures of ostensibly the same traffic taken at different
//! vantage points (client side vs server side of a NAT, load balancer, or
//! firewall), this crate identifies which TCP streams correspond, computes a
//! direction-independent flow identifier for each matched pair, and — in
//! compare mode — reconciles the two observations packet by packet.
//!
//! Packet dissection is delegated to an external tshark process; this crate
//! consumes its tab-separated field rows. The pipeline is
//! dissector → connection builder → (optional) sampler → bucketer → scorer →
//! matcher → flow hasher → packet differ → endpoint aggregator → sink.
//!
//! Key guarantees:
//! - Reports are deterministic and stable across runs, including match
//!   order and the compare-mode packet diff.
//! - Flow hashes are bit-exact against the external database consumer
//!   (SipHash-1-3, fixed zero keys, pinned byte layout).
//! - Absent dissector fields stay absent; zero is never substituted.
//!
//! # Examples
//! ```no_run
//! use std::path::Path;
//!
//! use capmaster_core::{AnalysisOptions, DissectorConfig, MatchConfig, analyze_capture_pair};
//!
//! let options = AnalysisOptions {
//!     match_config: MatchConfig::default(),
//!     dissector: DissectorConfig::default(),
//!     compare: false,
//!     db: None,
//! };
//! let report = analyze_capture_pair(Path::new("a.pcap"), Path::new("b.pcap"), &options)?;
//! println!("{} matches", report.stats.total);
//! # Ok::<(), capmaster_core::AnalysisError>(())
//! ```

pub mod aggregate;
pub mod analysis;
pub mod capture;
pub mod config;
pub mod connection;
pub mod diff;
pub mod dissector;
pub mod flowhash;
pub mod matching;
pub mod report;
pub mod sink;
pub mod timestamp;

pub use aggregate::{EndpointGroup, EndpointTuple};
pub use analysis::{AnalysisError, AnalysisOptions, analyze_capture_pair};
pub use capture::{CaptureError, resolve_capture_pair, validate_capture_file};
pub use config::{BucketStrategy, ConfigError, IpidGate, MatchConfig, MatchMode, SampleConfig};
pub use connection::TcpConnection;
pub use diff::{PacketDiff, StreamDiff};
pub use dissector::{DissectorConfig, DissectorError, PacketRecord};
pub use flowhash::{FlowSide, flow_hash};
pub use matching::{ConnectionMatch, MatchScore, MatchStats};
pub use report::{MatchEntry, MatchReport, REPORT_VERSION, render_text};
pub use sink::{CompareSink, DbConfig, SinkError, StreamExtraRow};
