//! Child-process driver for the external dissector.
//!
//! Spawns tshark with the pinned argv, streams stdout rows through a bounded
//! channel, and enforces a wall-clock timeout: on expiry the child is killed
//! and the stream yields `DissectorError::Timeout` instead of silently
//! truncating the capture.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};

use super::fields::build_args;
use super::record::{PacketRecord, parse_row};
use super::DissectorError;

/// Minimum dissector major version the pipeline was validated against.
/// Older versions are a warning, never fatal.
pub const MIN_MAJOR_VERSION: u32 = 4;

/// How the dissector child process is invoked.
#[derive(Debug, Clone)]
pub struct DissectorConfig {
    /// Binary name or path; resolved via PATH.
    pub binary: String,
    /// Wall-clock budget for one capture file.
    pub timeout: Duration,
    /// Bounded-channel capacity between the reader thread and the consumer.
    pub channel_capacity: usize,
}

impl Default for DissectorConfig {
    fn default() -> Self {
        Self {
            binary: "tshark".to_string(),
            timeout: Duration::from_secs(120),
            channel_capacity: 1024,
        }
    }
}

/// Streaming handle over one dissector invocation.
///
/// Records arrive in capture order. After the last record the channel closes;
/// any invocation-level failure (timeout, non-zero exit, malformed row)
/// arrives as a final `Err` item.
pub struct DissectorStream {
    receiver: Receiver<Result<PacketRecord, DissectorError>>,
}

impl DissectorStream {
    /// Returns the next record, a terminal error, or `None` at end of stream.
    pub fn next_record(&mut self) -> Option<Result<PacketRecord, DissectorError>> {
        self.receiver.recv().ok()
    }

    /// Drains the stream into a vector, stopping at the first error.
    pub fn collect_records(mut self) -> Result<Vec<PacketRecord>, DissectorError> {
        let mut records = Vec::new();
        while let Some(item) = self.next_record() {
            records.push(item?);
        }
        Ok(records)
    }
}

/// Spawns the dissector over `input` and returns the record stream.
///
/// The reader and watchdog threads detach; dropping the stream early leaves
/// them to run the child to completion or timeout on their own.
pub fn spawn_dissector(
    input: &Path,
    config: &DissectorConfig,
) -> Result<DissectorStream, DissectorError> {
    let mut child = Command::new(&config.binary)
        .args(build_args(input))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => DissectorError::NotFound {
                binary: config.binary.clone(),
            },
            _ => DissectorError::Invocation {
                message: err.to_string(),
            },
        })?;

    let stdout = child.stdout.take().ok_or_else(|| DissectorError::Invocation {
        message: "child stdout unavailable".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| DissectorError::Invocation {
        message: "child stderr unavailable".to_string(),
    })?;

    let child = Arc::new(Mutex::new(child));
    let finished = Arc::new(AtomicBool::new(false));
    let timed_out = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = bounded(config.channel_capacity);

    // Stderr drains on its own thread so a chatty dissector cannot deadlock
    // against a full stdout pipe.
    let stderr_handle = thread::spawn(move || {
        let mut buf = String::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_string(&mut buf);
        buf
    });

    spawn_watchdog(
        Arc::clone(&child),
        Arc::clone(&finished),
        Arc::clone(&timed_out),
        config.timeout,
    );

    let timeout_secs = config.timeout.as_secs();
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        let mut line_number = 0u64;
        let mut row_error = None;
        // After the consumer hangs up, keep reading to EOF so the child is
        // never blocked on a full stdout pipe.
        let mut consumer_gone = false;
        for line in reader.lines() {
            line_number += 1;
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    row_error = Some(DissectorError::Io(err));
                    break;
                }
            };
            if line.is_empty() || consumer_gone {
                continue;
            }
            match parse_row(line_number, &line) {
                Ok(record) => {
                    if sender.send(Ok(record)).is_err() {
                        consumer_gone = true;
                    }
                }
                Err(err) => {
                    row_error = Some(err);
                    break;
                }
            }
        }

        finished.store(true, Ordering::SeqCst);
        if row_error.is_some() {
            // A malformed row aborts the run; the child may still be mid
            // stream, so stop it before waiting.
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        }
        let status = child.lock().map(|mut child| child.wait()).ok();
        let stderr_text = stderr_handle
            .join()
            .unwrap_or_default()
            .trim()
            .to_string();

        let outcome = if timed_out.load(Ordering::SeqCst) {
            Err(DissectorError::Timeout {
                seconds: timeout_secs,
            })
        } else if let Some(err) = row_error {
            Err(err)
        } else {
            match status {
                Some(Ok(status)) if status.success() => Ok(()),
                Some(Ok(status)) => Err(DissectorError::Exit {
                    code: status.code().unwrap_or(-1),
                    stderr: stderr_text,
                }),
                Some(Err(err)) => Err(DissectorError::Io(err)),
                None => Err(DissectorError::Invocation {
                    message: "child handle poisoned".to_string(),
                }),
            }
        };
        if let Err(err) = outcome {
            let _ = sender.send(Err(err));
        }
    });

    Ok(DissectorStream { receiver })
}

fn spawn_watchdog(
    child: Arc<Mutex<Child>>,
    finished: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
    timeout: Duration,
) {
    thread::spawn(move || {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if finished.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        if !finished.load(Ordering::SeqCst) {
            timed_out.store(true, Ordering::SeqCst);
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        }
    });
}

/// Probes `<binary> --version`, returning the `(major, minor)` pair from the
/// first line when it can be parsed. A missing binary is `NotFound`; an
/// unparseable banner is `None` (callers warn, never fail).
pub fn probe_version(binary: &str) -> Result<Option<(u32, u32)>, DissectorError> {
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => DissectorError::NotFound {
                binary: binary.to_string(),
            },
            _ => DissectorError::Invocation {
                message: err.to_string(),
            },
        })?;
    let banner = String::from_utf8_lossy(&output.stdout);
    Ok(parse_version_banner(&banner))
}

fn parse_version_banner(banner: &str) -> Option<(u32, u32)> {
    let first_line = banner.lines().next()?;
    for token in first_line.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        let mut parts = token.split('.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts.next().and_then(|p| p.parse().ok());
        if let (Some(major), Some(minor)) = (major, minor) {
            return Some((major, minor));
        }
    }
    None
}
