//! Capture-file pre-checks and pair discovery.
//!
//! Before a dissector process is spent on an input, the file must exist, be
//! a regular file, and start with a recognised capture magic. `match` and
//! `compare` operate on exactly two captures; a directory input is scanned
//! (non-recursive) and must contain exactly two.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Classic pcap magics (both endiannesses, microsecond and nanosecond
/// timestamp variants) plus the pcapng section-header block type.
const PCAP_MAGIC_LE_USEC: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
const PCAP_MAGIC_BE_USEC: [u8; 4] = [0xa1, 0xb2, 0xc3, 0xd4];
const PCAP_MAGIC_LE_NSEC: [u8; 4] = [0x4d, 0x3c, 0xb2, 0xa1];
const PCAP_MAGIC_BE_NSEC: [u8; 4] = [0xa1, 0xb2, 0x3c, 0x4d];
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("input not accessible: {path}: {reason}")]
    NotAccessible { path: PathBuf, reason: String },
    #[error("expected exactly two capture files, found {found} in {path}")]
    WrongCount { path: PathBuf, found: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validates that `path` is a readable capture file with a known magic.
pub fn validate_capture_file(path: &Path) -> Result<(), CaptureError> {
    let metadata = std::fs::metadata(path).map_err(|err| CaptureError::NotAccessible {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    if !metadata.is_file() {
        return Err(CaptureError::NotAccessible {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }

    let mut file = File::open(path).map_err(|err| CaptureError::NotAccessible {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| CaptureError::NotAccessible {
            path: path.to_path_buf(),
            reason: "file shorter than a capture header".to_string(),
        })?;

    if !is_capture_magic(&magic) {
        return Err(CaptureError::NotAccessible {
            path: path.to_path_buf(),
            reason: format!(
                "unrecognised magic {:02x}{:02x}{:02x}{:02x} (expected pcap or pcapng)",
                magic[0], magic[1], magic[2], magic[3]
            ),
        });
    }
    Ok(())
}

fn is_capture_magic(magic: &[u8; 4]) -> bool {
    matches!(
        *magic,
        PCAP_MAGIC_LE_USEC | PCAP_MAGIC_BE_USEC | PCAP_MAGIC_LE_NSEC | PCAP_MAGIC_BE_NSEC
            | PCAPNG_MAGIC
    )
}

fn has_capture_extension(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref(),
        Some("pcap") | Some("pcapng") | Some("cap")
    )
}

/// Resolves the input list for `match`/`compare` into an ordered pair.
///
/// Accepts either two explicit file paths or one directory containing
/// exactly two captures; directory entries are taken in name order so the
/// pair assignment is stable across runs.
pub fn resolve_capture_pair(inputs: &[PathBuf]) -> Result<(PathBuf, PathBuf), CaptureError> {
    let pair = match inputs {
        [single] if single.is_dir() => {
            let mut found: Vec<PathBuf> = std::fs::read_dir(single)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && has_capture_extension(path))
                .collect();
            found.sort();
            if found.len() != 2 {
                return Err(CaptureError::WrongCount {
                    path: single.clone(),
                    found: found.len(),
                });
            }
            (found.remove(0), found.remove(0))
        }
        [a, b] => (a.clone(), b.clone()),
        other => {
            return Err(CaptureError::WrongCount {
                path: other.first().cloned().unwrap_or_default(),
                found: other.len(),
            });
        }
    };

    validate_capture_file(&pair.0)?;
    validate_capture_file(&pair.1)?;
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::{CaptureError, resolve_capture_pair, validate_capture_file};

    const PCAP_HEADER: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];

    fn write_capture(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, PCAP_HEADER).expect("write capture");
        path
    }

    #[test]
    fn accepts_known_magics() {
        let dir = TempDir::new().expect("tempdir");
        for magic in [
            [0xd4, 0xc3, 0xb2, 0xa1],
            [0xa1, 0xb2, 0xc3, 0xd4],
            [0x4d, 0x3c, 0xb2, 0xa1],
            [0xa1, 0xb2, 0x3c, 0x4d],
            [0x0a, 0x0d, 0x0d, 0x0a],
        ] {
            let path = dir.path().join("t.pcap");
            std::fs::write(&path, magic).expect("write");
            validate_capture_file(&path).expect("magic should be accepted");
        }
    }

    #[test]
    fn rejects_wrong_magic() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bad.pcap");
        std::fs::write(&path, [0x00, 0x11, 0x22, 0x33]).expect("write");
        let err = validate_capture_file(&path).expect_err("must reject");
        assert!(err.to_string().contains("unrecognised magic"));
    }

    #[test]
    fn rejects_short_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("tiny.pcap");
        std::fs::write(&path, [0xd4]).expect("write");
        let err = validate_capture_file(&path).expect_err("must reject");
        assert!(err.to_string().contains("shorter"));
    }

    #[test]
    fn directory_with_two_captures_resolves_in_name_order() {
        let dir = TempDir::new().expect("tempdir");
        write_capture(&dir, "b.pcap");
        write_capture(&dir, "a.pcap");
        let (first, second) =
            resolve_capture_pair(&[dir.path().to_path_buf()]).expect("resolve pair");
        assert!(first.ends_with("a.pcap"));
        assert!(second.ends_with("b.pcap"));
    }

    #[test]
    fn directory_with_wrong_count_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        write_capture(&dir, "only.pcap");
        let err = resolve_capture_pair(&[dir.path().to_path_buf()]).expect_err("must reject");
        match err {
            CaptureError::WrongCount { found, .. } => assert_eq!(found, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn three_explicit_paths_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let a = write_capture(&dir, "a.pcap");
        let b = write_capture(&dir, "b.pcap");
        let c = write_capture(&dir, "c.pcap");
        let err = resolve_capture_pair(&[a, b, c]).expect_err("must reject");
        assert!(matches!(err, CaptureError::WrongCount { found: 3, .. }));
    }
}
