//! Filesystem scanner: walks a landing directory and fingerprints files.
//!
//! Hashing runs on a bounded pool of blocking tasks. Results are collected
//! in full and sorted by path before anything touches the registry.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{RegistrationError, TidemarkError};
use crate::types::Grain;

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}$").unwrap());
static YEAR_RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{4})$").unwrap());
static MONTH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}$").unwrap());
static MONTH_RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2})-(\d{4}-\d{2})$").unwrap());

/// Options for a directory scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Upper bound on concurrent hashing tasks.
    pub max_workers: usize,
    /// Lowercase extensions to include; empty means every file.
    pub extensions: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_workers: 8,
            extensions: vec![
                "parquet".into(),
                "csv".into(),
                "json".into(),
                "jsonl".into(),
            ],
        }
    }
}

/// Result of fingerprinting one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedFile {
    pub source_id: String,
    pub file_path: String,
    /// SHA-256 of the content; empty when the file could not be read.
    pub content_hash: String,
    pub file_size: u64,
    pub coverage_start: Option<String>,
    pub coverage_end: Option<String>,
    pub grain: Option<Grain>,
    /// Failure reason; a scanned file with an error registers as `failed`.
    pub error: Option<String>,
}

impl ScannedFile {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Coverage bounds parsed from a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageTokens {
    pub start: String,
    pub end: String,
    pub grain: Grain,
}

/// Parse the coverage tokens of a file name.
///
/// The token is the stem up to the first `-part-`. Accepted shapes are
/// `YYYY`, `YYYY-YYYY`, `YYYY-MM` and `YYYY-MM-YYYY-MM`. Range order is not
/// checked here; the router rejects inverted ranges.
pub fn parse_coverage(file_name: &str) -> Result<CoverageTokens, RegistrationError> {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let token = stem.split("-part-").next().unwrap_or(stem);

    let tokens = |start: &str, end: &str, grain| CoverageTokens {
        start: start.to_string(),
        end: end.to_string(),
        grain,
    };

    if let Some(caps) = YEAR_RANGE_RE.captures(token) {
        return Ok(tokens(&caps[1], &caps[2], Grain::Year));
    }
    if YEAR_RE.is_match(token) {
        return Ok(tokens(token, token, Grain::Year));
    }
    if let Some(caps) = MONTH_RANGE_RE.captures(token) {
        return Ok(tokens(&caps[1], &caps[2], Grain::Month));
    }
    if MONTH_RE.is_match(token) {
        return Ok(tokens(token, token, Grain::Month));
    }
    Err(RegistrationError::UnrecognizedCoverage {
        name: file_name.to_string(),
    })
}

/// First path component below `root`, or `unknown` for files at the root.
pub fn source_id_for(root: &Path, path: &Path) -> String {
    let Ok(relative) = path.strip_prefix(root) else {
        return "unknown".to_string();
    };
    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(first)), Some(_)) => first.to_string_lossy().into_owned(),
        _ => "unknown".to_string(),
    }
}

/// Stream a file through SHA-256. Returns (hex digest, byte count).
pub fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Fingerprint a single file. Never fails: problems are recorded on the result.
pub fn scan_file(root: &Path, path: &Path) -> ScannedFile {
    let source_id = source_id_for(root, path);
    let Some(file_path) = path.to_str().map(str::to_string) else {
        let err = RegistrationError::NonUtf8Path {
            path: path.to_path_buf(),
        };
        return failed(source_id, path.to_string_lossy().into_owned(), err.to_string());
    };

    let (content_hash, file_size) = match hash_file(path) {
        Ok(digest) => digest,
        Err(e) => {
            let err = RegistrationError::Unreadable {
                path: path.to_path_buf(),
                message: e.to_string(),
            };
            warn!(path = %file_path, error = %e, "Failed to hash file");
            return failed(source_id, file_path, err.to_string());
        }
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (coverage_start, coverage_end, grain, error) = match parse_coverage(&file_name) {
        Ok(cov) => (Some(cov.start), Some(cov.end), Some(cov.grain), None),
        Err(_) => (None, None, None, Some(format!("unrecognized:{file_name}"))),
    };

    debug!(path = %file_path, hash = %content_hash, size = file_size, "Fingerprinted file");
    ScannedFile {
        source_id,
        file_path,
        content_hash,
        file_size,
        coverage_start,
        coverage_end,
        grain,
        error,
    }
}

fn failed(source_id: String, file_path: String, reason: String) -> ScannedFile {
    ScannedFile {
        source_id,
        file_path,
        content_hash: String::new(),
        file_size: 0,
        coverage_start: None,
        coverage_end: None,
        grain: None,
        error: Some(reason),
    }
}

fn has_wanted_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| extensions.iter().any(|want| want.eq_ignore_ascii_case(&e)))
}

/// List candidate files under `root`, sorted by path.
pub fn collect_candidates(root: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| has_wanted_extension(p, extensions))
        .collect();
    paths.sort();
    paths
}

/// Walk `root` and fingerprint every candidate file on a bounded pool.
///
/// Per-file failures are carried on the returned [`ScannedFile`]s; only a
/// missing root is an error.
pub async fn scan_directory(
    root: &Path,
    options: &ScanOptions,
) -> Result<Vec<ScannedFile>, TidemarkError> {
    if !root.is_dir() {
        return Err(TidemarkError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("scan root {} is not a directory", root.display()),
        )));
    }

    let paths = collect_candidates(root, &options.extensions);
    info!(root = %root.display(), files = paths.len(), "Scan started");

    let semaphore = Arc::new(Semaphore::new(options.max_workers.max(1)));
    let root = Arc::new(root.to_path_buf());
    let mut handles = Vec::with_capacity(paths.len());
    for path in &paths {
        let permit = semaphore.clone().acquire_owned().await.ok();
        let root = Arc::clone(&root);
        let path = path.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            scan_file(&root, &path)
        }));
    }

    let mut scanned = Vec::with_capacity(paths.len());
    for (path, joined) in paths.iter().zip(futures::future::join_all(handles).await) {
        match joined {
            Ok(file) => scanned.push(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Hash task failed");
                scanned.push(failed(
                    source_id_for(&root, path),
                    path.to_string_lossy().into_owned(),
                    format!("hash task failed: {e}"),
                ));
            }
        }
    }
    scanned.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    let failed_count = scanned.iter().filter(|f| f.is_failed()).count();
    info!(files = scanned.len(), failed = failed_count, "Scan finished");
    Ok(scanned)
}
