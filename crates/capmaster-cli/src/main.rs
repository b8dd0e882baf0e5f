//! CapMaster command-line interface.
//!
//! Thin wrapper over the `capmaster-core` correlation pipeline:
//! - `capmaster match <A> <B>` lists matched TCP streams across two captures.
//! - `capmaster compare <A> <B>` adds a per-packet diff and can write the
//!   per-case stream table into a database.
//!
//! Inputs are two capture files, one directory containing exactly two, or a
//! glob resolving to either. Exit codes: 0 success, 1 no matches, 2 bad
//! arguments or unreadable input, >2 internal failure.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use capmaster_core::{
    AnalysisError, AnalysisOptions, BucketStrategy, CaptureError, DbConfig, DissectorConfig,
    DissectorError, IpidGate, MatchConfig, MatchMode, MatchReport, SampleConfig,
    analyze_capture_pair, render_text, resolve_capture_pair,
};
use clap::{Args, Parser, Subcommand};
use glob::glob;

#[derive(Parser, Debug)]
#[command(name = "capmaster")]
#[command(
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (commit ",
        env!("CAPMASTER_BUILD_COMMIT"),
        ", built ",
        env!("CAPMASTER_BUILD_DATE"),
        ")"
    )
)]
#[command(
    about = "Cross-capture TCP stream correlator for forensic PCAP analysis.",
    long_about = None,
    after_help = "Examples:\n  capmaster match client.pcap server.pcap\n  capmaster match ./case-dir --json -o matches.json\n  capmaster compare client.pcap server.pcap --db case.db --case-id 17"
)]
struct Cli {
    /// Verbose diagnostics: debug logging plus error cause chains
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Correlate TCP streams across two captures.
    Match(MatchArgs),
    /// Correlate, diff matched streams packet by packet, optionally persist.
    Compare(CompareArgs),
}

#[derive(Args, Debug)]
struct MatchArgs {
    /// Two capture files, one directory with exactly two, or a glob
    inputs: Vec<PathBuf>,

    /// Bucketing strategy: server, port, none, auto
    #[arg(long, default_value = "auto")]
    bucket: String,

    /// Match cardinality: one-to-one, one-to-many
    #[arg(long, default_value = "one-to-one")]
    mode: String,

    /// Acceptance threshold on the normalized score, in [0, 1]
    #[arg(long, default_value_t = 0.60)]
    threshold: f64,

    /// IP-ID gate policy: strict, off
    #[arg(long, default_value = "strict")]
    ipid_gate: String,

    /// Enable time-stratified sampling of large captures
    #[arg(long)]
    sample: bool,

    /// Connection count above which sampling kicks in
    #[arg(long, default_value_t = 1000)]
    sample_threshold: usize,

    /// Sampling rate in (0, 1]
    #[arg(long, default_value_t = 0.1)]
    sample_rate: f64,

    /// Explicit sampler seed (default derives from the input paths)
    #[arg(long)]
    seed: Option<u64>,

    /// Dissector binary
    #[arg(long, default_value = "tshark")]
    dissector: PathBuf,

    /// Dissector timeout per capture, seconds
    #[arg(long, default_value_t = 120)]
    dissector_timeout: u64,

    /// Emit the JSON report instead of text
    #[arg(long)]
    json: bool,

    /// Write the report to a file instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Suppress non-error progress output
    #[arg(long)]
    quiet: bool,
}

#[derive(Args, Debug)]
struct CompareArgs {
    #[command(flatten)]
    common: MatchArgs,

    /// SQLite database path for the write-through sink
    #[arg(long)]
    db: Option<String>,

    /// Case id; the sink writes into `kase_{id}_tcp_stream_extra`
    #[arg(long)]
    case_id: Option<String>,

    /// `pcap_id` values for capture A and B, comma-separated
    #[arg(long, default_value = "0,1")]
    pcap_ids: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "warn" }),
    )
    .init();
    let verbose = cli.verbose;

    let result = match cli.command {
        Commands::Match(args) => run(args, false, None),
        Commands::Compare(args) => {
            let db = match compare_sink_config(&args) {
                Ok(db) => db,
                Err(err) => return err.report(verbose),
            };
            run(args.common, true, db)
        }
    };

    match result {
        Ok(code) => code,
        Err(err) => err.report(verbose),
    }
}

#[derive(Debug)]
struct CliError {
    message: String,
    hint: Option<String>,
    /// Underlying causes, outermost first; shown only in verbose mode.
    chain: Vec<String>,
    exit_code: u8,
}

impl CliError {
    fn new(message: impl Into<String>, hint: Option<String>, exit_code: u8) -> Self {
        Self {
            message: message.into(),
            hint,
            chain: Vec::new(),
            exit_code,
        }
    }

    fn usage(message: impl Into<String>, hint: &str) -> Self {
        Self::new(message, Some(hint.to_string()), 2)
    }

    fn report(&self, verbose: bool) -> ExitCode {
        eprintln!("error: {}", self.message);
        if verbose {
            for cause in &self.chain {
                eprintln!("caused by: {cause}");
            }
        }
        if let Some(hint) = &self.hint {
            eprintln!("hint: {}", hint);
        }
        ExitCode::from(self.exit_code)
    }
}

fn cause_chain(err: &dyn std::error::Error) -> Vec<String> {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(format!("{err:#}"), None, 2)
    }
}

impl From<AnalysisError> for CliError {
    fn from(err: AnalysisError) -> Self {
        let hint = match &err {
            AnalysisError::Dissector(DissectorError::NotFound { .. }) => {
                Some("install Wireshark/tshark or pass --dissector <path>".to_string())
            }
            AnalysisError::Dissector(DissectorError::Timeout { .. }) => {
                Some("raise --dissector-timeout for very large captures".to_string())
            }
            AnalysisError::Capture(CaptureError::WrongCount { .. }) => {
                Some("pass exactly two capture files, or a directory containing two".to_string())
            }
            AnalysisError::Config(_) => Some("see --help for option ranges".to_string()),
            _ => None,
        };
        // Input and configuration problems are usage errors; everything the
        // dissector or sink reports is an environment failure. Both exit 2;
        // internal invariants panic and surface as >2.
        let mut cli_err = CliError::new(err.to_string(), hint, 2);
        cli_err.chain = cause_chain(&err);
        cli_err
    }
}

/// `Some(db)` only when compare should persist; db and case id go together.
fn compare_sink_config(args: &CompareArgs) -> Result<Option<DbConfig>, CliError> {
    let db = match (&args.db, &args.case_id) {
        (None, None) => return Ok(None),
        (Some(path), Some(case_id)) => {
            let pcap_ids = parse_pcap_ids(&args.pcap_ids)?;
            DbConfig {
                path: path.clone(),
                case_id: case_id.clone(),
                pcap_ids,
            }
        }
        (Some(_), None) => {
            return Err(CliError::usage(
                "--db requires --case-id",
                "pass --case-id <ID> to name the per-case table",
            ));
        }
        (None, Some(_)) => {
            return Err(CliError::usage(
                "--case-id requires --db",
                "pass --db <PATH> to enable the database sink",
            ));
        }
    };
    Ok(Some(db))
}

fn parse_pcap_ids(value: &str) -> Result<(i64, i64), CliError> {
    let invalid = || {
        CliError::usage(
            format!("invalid --pcap-ids `{value}`"),
            "expected two comma-separated integers, e.g. 0,1",
        )
    };
    let (a, b) = value.split_once(',').ok_or_else(invalid)?;
    Ok((
        a.trim().parse().map_err(|_| invalid())?,
        b.trim().parse().map_err(|_| invalid())?,
    ))
}

fn run(args: MatchArgs, compare: bool, db: Option<DbConfig>) -> Result<ExitCode, CliError> {
    let options = build_options(&args, compare, db)?;
    let inputs = resolve_inputs(&args.inputs)?;
    let (input_a, input_b) = resolve_capture_pair(&inputs).map_err(AnalysisError::Capture)?;

    if !args.quiet {
        eprintln!(
            "correlating {} <-> {}",
            input_a.display(),
            input_b.display()
        );
    }

    let report = analyze_capture_pair(&input_a, &input_b, &options)?;
    emit_report(&report, &args)?;

    if report.stats.total == 0 {
        if !args.quiet {
            eprintln!("no matches above threshold {:.2}", options.match_config.threshold);
        }
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn build_options(
    args: &MatchArgs,
    compare: bool,
    db: Option<DbConfig>,
) -> Result<AnalysisOptions, CliError> {
    let match_config = MatchConfig {
        threshold: args.threshold,
        mode: args.mode.parse::<MatchMode>().map_err(AnalysisError::Config)?,
        bucket: args
            .bucket
            .parse::<BucketStrategy>()
            .map_err(AnalysisError::Config)?,
        ipid_gate: args
            .ipid_gate
            .parse::<IpidGate>()
            .map_err(AnalysisError::Config)?,
        sample: args.sample.then(|| SampleConfig {
            threshold: args.sample_threshold,
            rate: args.sample_rate,
            seed: args.seed,
            ..SampleConfig::default()
        }),
        ..MatchConfig::default()
    };

    Ok(AnalysisOptions {
        match_config,
        dissector: DissectorConfig {
            binary: args.dissector.display().to_string(),
            timeout: Duration::from_secs(args.dissector_timeout),
            ..DissectorConfig::default()
        },
        compare,
        db,
    })
}

/// Expands glob patterns; plain paths pass through untouched.
fn resolve_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, CliError> {
    let mut resolved = Vec::new();
    for input in inputs {
        let pattern = input.to_string_lossy();
        if !is_glob_pattern(&pattern) {
            resolved.push(input.clone());
            continue;
        }
        let mut matched = false;
        let entries = glob(&pattern).map_err(|err| {
            CliError::usage(
                format!("invalid input pattern '{pattern}'"),
                &format!("pattern error: {}", err.msg),
            )
        })?;
        for entry in entries {
            let path = entry.map_err(|err| {
                CliError::usage(
                    format!("invalid input pattern '{pattern}'"),
                    &format!("pattern error: {err}"),
                )
            })?;
            resolved.push(path);
            matched = true;
        }
        if !matched {
            return Err(CliError::usage(
                format!("no files match pattern '{pattern}'"),
                "check the path or quote the pattern",
            ));
        }
    }
    if resolved.is_empty() {
        return Err(CliError::usage(
            "missing inputs",
            "pass two capture files or a directory containing exactly two",
        ));
    }
    Ok(resolved)
}

fn is_glob_pattern(input: &str) -> bool {
    input.contains('*') || input.contains('?') || input.contains('[')
}

fn emit_report(report: &MatchReport, args: &MatchArgs) -> Result<(), CliError> {
    let rendered = if args.json {
        serde_json::to_string_pretty(report)
            .context("JSON serialization failed")
            .map_err(CliError::from)?
    } else {
        render_text(report)
    };

    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create output directory: {}", parent.display())
                    })?;
                }
            }
            fs::write(path, rendered)
                .with_context(|| format!("Failed to write report: {}", path.display()))?;
            if !args.quiet {
                eprintln!("OK: report written -> {}", path.display());
            }
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
