//! Offline analysis over the capture tree
//!
//! Read-only: scans the directory layout written by [`crate::store`],
//! aggregates token-cache statistics over a time window, and resolves two
//! request ids to their normalized request bodies for prefix diffing.
//! Partially written captures (a crash mid-stream, a truncated meta file)
//! degrade to "missing usage" rather than failing the scan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::store::{
    CaptureMeta, ResponseMeta, CAPTURE_META_FILE, REQUEST_BODY_FILE, REQUEST_NORMALIZED_FILE,
    RESPONSE_META_FILE,
};
use crate::usage::{cached_tokens, input_tokens};

/// Reference to one capture directory found during a scan
#[derive(Debug, Clone)]
pub struct CaptureRef {
    pub request_id: String,
    pub dir: PathBuf,
    /// Derived from the directory name, with a metadata fallback
    pub captured_at: Option<DateTime<Utc>>,
}

/// Parse the UTC timestamp embedded in a request id / directory name
pub fn timestamp_from_id(request_id: &str) -> Option<DateTime<Utc>> {
    let stamp = request_id.split('_').next()?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Enumerate capture directories under `<root>/<date>/<id>/`
///
/// A directory counts as a capture once its raw request body exists (the
/// first artifact the gateway writes). Results are sorted by timestamp,
/// then id.
pub fn find_captures(root: &Path) -> Vec<CaptureRef> {
    let mut captures = Vec::new();
    let Ok(days) = std::fs::read_dir(root) else {
        return captures;
    };

    let mut day_dirs: Vec<PathBuf> = days
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    day_dirs.sort();

    for day in day_dirs {
        let Ok(entries) = std::fs::read_dir(&day) else {
            continue;
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            if !dir.join(REQUEST_BODY_FILE).exists() {
                continue;
            }
            let request_id = match dir.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            let captured_at = timestamp_from_id(&request_id)
                .or_else(|| {
                    read_json::<CaptureMeta>(&dir.join(CAPTURE_META_FILE)).map(|m| m.captured_at)
                })
                .or_else(|| {
                    read_json::<ResponseMeta>(&dir.join(RESPONSE_META_FILE)).map(|m| m.captured_at)
                });

            captures.push(CaptureRef {
                request_id,
                dir,
                captured_at,
            });
        }
    }

    captures.sort_by(|a, b| (a.captured_at, &a.request_id).cmp(&(b.captured_at, &b.request_id)));
    captures
}

/// Aggregate token-cache statistics over a time window
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowStats {
    /// Captures inside the window
    pub captures: u64,
    /// Captures whose usage carries a cached-token field (zero included)
    pub with_cached_tokens: u64,
    /// Captures with no usage data at all; counted, but excluded from the
    /// token sums so the ratio is not silently biased
    pub missing_usage: u64,
    /// Sum of input tokens over captures with usage
    pub input_tokens: u64,
    /// Sum of cached tokens over captures with usage
    pub cached_tokens: u64,
    /// Sum and count of recorded latencies
    pub elapsed_ms_sum: u64,
    pub elapsed_count: u64,
    /// Capture counts grouped by cache identity, when requests carried one
    pub by_cache_ident: BTreeMap<String, u64>,
}

impl WindowStats {
    /// Cached tokens / input tokens; 0 when no input tokens were recorded
    pub fn cache_hit_ratio(&self) -> f64 {
        if self.input_tokens == 0 {
            0.0
        } else {
            self.cached_tokens as f64 / self.input_tokens as f64
        }
    }

    /// Mean latency over captures that recorded one
    pub fn avg_elapsed_ms(&self) -> Option<u64> {
        if self.elapsed_count == 0 {
            None
        } else {
            Some(self.elapsed_ms_sum / self.elapsed_count)
        }
    }
}

/// Aggregate usage statistics over captures in `[since, until)`
///
/// Captures whose timestamp cannot be determined are included only when the
/// window is unbounded. An empty window yields all-zero stats, not an
/// error.
pub fn window_stats(
    root: &Path,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> WindowStats {
    let mut stats = WindowStats::default();

    for capture in find_captures(root) {
        match capture.captured_at {
            Some(at) => {
                if let Some(since) = since {
                    if at < since {
                        continue;
                    }
                }
                if let Some(until) = until {
                    if at >= until {
                        continue;
                    }
                }
            }
            None => {
                if since.is_some() || until.is_some() {
                    continue;
                }
            }
        }

        stats.captures += 1;

        let meta = read_json::<ResponseMeta>(&capture.dir.join(RESPONSE_META_FILE));
        match meta.as_ref().and_then(|m| m.usage.as_ref()) {
            Some(usage) => {
                stats.input_tokens += input_tokens(usage);
                if let Some(cached) = cached_tokens(usage) {
                    stats.with_cached_tokens += 1;
                    stats.cached_tokens += cached;
                }
            }
            None => stats.missing_usage += 1,
        }

        if let Some(meta) = &meta {
            stats.elapsed_ms_sum += meta.elapsed_ms;
            stats.elapsed_count += 1;
        }

        if let Some(capture_meta) = read_json::<CaptureMeta>(&capture.dir.join(CAPTURE_META_FILE))
        {
            if let Some(key) = capture_meta.cache_ident.as_ref().and_then(|i| i.key()) {
                *stats.by_cache_ident.entry(key.to_string()).or_insert(0) += 1;
            }
        }
    }

    stats
}

/// Result of resolving two captures for a prefix diff
#[derive(Debug, Clone)]
pub struct DiffReport {
    /// Normalized request body of the first id
    pub left: PathBuf,
    /// Normalized request body of the second id
    pub right: PathBuf,
    /// Whether the two normalized documents are byte-identical
    pub identical: bool,
    /// First divergent key path, when the documents differ
    pub divergence: Option<String>,
}

/// Locate two captures by id and compare their normalized request bodies
///
/// The id alone does not encode the containing date directory, so every
/// date shard is searched. An id with no match is `CaptureNotFound`; an id
/// matching under more than one date is `CaptureAmbiguous`.
pub fn diff_captures(root: &Path, id1: &str, id2: &str) -> Result<DiffReport> {
    let dir1 = locate_capture(root, id1)?;
    let dir2 = locate_capture(root, id2)?;

    let left = dir1.join(REQUEST_NORMALIZED_FILE);
    let right = dir2.join(REQUEST_NORMALIZED_FILE);

    let left_bytes = std::fs::read(&left).map_err(|_| {
        AppError::IoError(format!(
            "{id1} has no normalized request body (non-JSON capture?)"
        ))
    })?;
    let right_bytes = std::fs::read(&right).map_err(|_| {
        AppError::IoError(format!(
            "{id2} has no normalized request body (non-JSON capture?)"
        ))
    })?;

    let identical = left_bytes == right_bytes;
    let divergence = if identical {
        None
    } else {
        match (
            serde_json::from_slice::<Value>(&left_bytes),
            serde_json::from_slice::<Value>(&right_bytes),
        ) {
            (Ok(a), Ok(b)) => first_divergence(&a, &b, "$"),
            _ => Some("$".to_string()),
        }
    };

    Ok(DiffReport {
        left,
        right,
        identical,
        divergence,
    })
}

fn locate_capture(root: &Path, request_id: &str) -> Result<PathBuf> {
    let mut matches = Vec::new();
    let days = std::fs::read_dir(root)
        .map_err(|e| AppError::IoError(format!("{}: {e}", root.display())))?;

    for entry in days.filter_map(|e| e.ok()) {
        let day = entry.path();
        if !day.is_dir() {
            continue;
        }
        let candidate = day.join(request_id);
        if candidate.is_dir() {
            matches.push(candidate);
        }
    }

    match matches.len() {
        0 => Err(AppError::CaptureNotFound(request_id.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(AppError::CaptureAmbiguous(request_id.to_string())),
    }
}

/// First point of structural divergence between two JSON documents
///
/// Walks both documents together, object keys in sorted order, and returns
/// the path of the first difference, e.g. `$.input[2].content`.
pub fn first_divergence(a: &Value, b: &Value, path: &str) -> Option<String> {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut keys: Vec<&String> = ma.keys().chain(mb.keys()).collect();
            keys.sort();
            keys.dedup();

            for key in keys {
                let child = format!("{path}.{key}");
                match (ma.get(key), mb.get(key)) {
                    (Some(va), Some(vb)) => {
                        if let Some(found) = first_divergence(va, vb, &child) {
                            return Some(found);
                        }
                    }
                    _ => return Some(child),
                }
            }
            None
        }
        (Value::Array(xa), Value::Array(xb)) => {
            let shared = xa.len().min(xb.len());
            for i in 0..shared {
                let child = format!("{path}[{i}]");
                if let Some(found) = first_divergence(&xa[i], &xb[i], &child) {
                    return Some(found);
                }
            }
            if xa.len() != xb.len() {
                return Some(format!("{path}[{shared}]"));
            }
            None
        }
        _ => {
            if a == b {
                None
            } else {
                Some(path.to_string())
            }
        }
    }
}
