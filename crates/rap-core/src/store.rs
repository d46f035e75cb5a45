//! Capture store
//!
//! Persists one directory per request/response exchange under
//! `<root>/<YYYY-MM-DD>/<YYYYMMDDTHHMMSSZ>_<hex>/`, with one file per
//! artifact. Complete JSON documents are written atomically (tmp + rename)
//! so the analysis engine never observes a half-written file; streamed
//! response text is appended chunk-by-chunk so a crash mid-stream leaves
//! previously written bytes intact and readable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::{AppError, Result};
use crate::normalize::normalize_bytes;
use crate::redact::redact_headers;

/// Redacted inbound headers
pub const REQUEST_HEADERS_FILE: &str = "request.headers.json";
/// Exact bytes of the inbound body
pub const REQUEST_BODY_FILE: &str = "request.body.json";
/// Canonical re-serialization of the inbound body
pub const REQUEST_NORMALIZED_FILE: &str = "request.body.normalized.json";
/// Method, path, and cache-identity hints for this exchange
pub const CAPTURE_META_FILE: &str = "capture.meta.json";
/// Status, latency, and usage counters
pub const RESPONSE_META_FILE: &str = "response.meta.json";
/// Full body of a buffered JSON exchange
pub const RESPONSE_BODY_FILE: &str = "response.body.json";
/// Full body of a non-JSON, non-SSE exchange
pub const RESPONSE_BINARY_FILE: &str = "response.body.bin";
/// Raw concatenated SSE text of a streaming exchange
pub const RESPONSE_SSE_FILE: &str = "response.sse.txt";

/// Paths for one capture directory
#[derive(Debug, Clone)]
pub struct CapturePaths {
    /// Date shard directory, e.g. `<root>/2026-08-06`
    pub day_dir: PathBuf,
    /// The capture directory itself
    pub capture_dir: PathBuf,
    /// Request id embedded in the directory name
    pub request_id: String,
}

impl CapturePaths {
    /// Path of a named artifact inside this capture
    pub fn file(&self, name: &str) -> PathBuf {
        self.capture_dir.join(name)
    }
}

/// Cache-identity hints extracted from the request
///
/// Best-effort stickiness identifiers: some SDKs pass a session id through
/// headers, others through a `prompt_cache_key` body field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheIdent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "x-session-id", default, skip_serializing_if = "Option::is_none")]
    pub x_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
}

impl CacheIdent {
    /// Extract identity hints from headers and the parsed body, if any
    pub fn from_request(headers: &BTreeMap<String, String>, body: Option<&Value>) -> Option<Self> {
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };

        let prompt_cache_key = body.and_then(|b| {
            b.get("prompt_cache_key")
                .or_else(|| b.get("promptCacheKey"))
                .and_then(|v| v.as_str())
                .map(String::from)
        });

        let ident = Self {
            session_id: header("session_id"),
            x_session_id: header("x-session-id"),
            prompt_cache_key,
        };

        if ident == Self::default() {
            None
        } else {
            Some(ident)
        }
    }

    /// The preferred grouping key for analysis
    pub fn key(&self) -> Option<&str> {
        self.prompt_cache_key
            .as_deref()
            .or(self.session_id.as_deref())
            .or(self.x_session_id.as_deref())
    }
}

/// Metadata about the inbound request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureMeta {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    pub captured_at: DateTime<Utc>,
    /// Whether the body parsed as JSON (and a normalized copy was written)
    #[serde(default)]
    pub body_is_json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ident: Option<CacheIdent>,
}

/// Metadata about the upstream response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub upstream_url: String,
    pub status_code: u16,
    pub elapsed_ms: u64,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub streaming: bool,
    /// The captured copy hit the size cap; the client still received
    /// everything
    #[serde(default)]
    pub capture_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Capture store rooted at the log directory
#[derive(Debug, Clone)]
pub struct CaptureStore {
    root: PathBuf,
    log_sensitive_headers: bool,
    max_capture_bytes: usize,
}

impl CaptureStore {
    /// Create a store with default policy, rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            log_sensitive_headers: false,
            max_capture_bytes: crate::config::DEFAULT_MAX_CAPTURE_BYTES,
        }
    }

    /// Create a store configured from the proxy configuration
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            root: config.log_dir.clone(),
            log_sensitive_headers: config.log_sensitive_headers,
            max_capture_bytes: config.max_capture_bytes,
        }
    }

    /// Root of the capture tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory for a new capture
    ///
    /// The request id is time-sortable: `20260806T180000Z_ab12cd34`.
    pub fn begin_capture(&self) -> Result<CapturePaths> {
        self.begin_capture_at(Utc::now())
    }

    /// Create a capture directory for an explicit timestamp
    pub fn begin_capture_at(&self, now: DateTime<Utc>) -> Result<CapturePaths> {
        let suffix = Uuid::new_v4().simple().to_string();
        let request_id = format!("{}_{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8]);
        let day_dir = self.root.join(now.format("%Y-%m-%d").to_string());
        let capture_dir = day_dir.join(&request_id);

        std::fs::create_dir_all(&day_dir).map_err(|e| {
            AppError::CaptureWriteFailure(format!("{}: {e}", day_dir.display()))
        })?;
        // create_dir (not create_dir_all) so an id collision is an error
        // rather than two requests sharing a directory
        std::fs::create_dir(&capture_dir).map_err(|e| {
            AppError::CaptureWriteFailure(format!("{}: {e}", capture_dir.display()))
        })?;

        Ok(CapturePaths {
            day_dir,
            capture_dir,
            request_id,
        })
    }

    /// Persist the inbound request: redacted headers, raw body bytes, and
    /// the normalized copy when the body parses as JSON
    ///
    /// Returns whether the body was JSON (i.e. a normalized copy exists).
    pub async fn save_request(
        &self,
        paths: &CapturePaths,
        headers: &BTreeMap<String, String>,
        raw_body: &[u8],
    ) -> Result<bool> {
        let stored_headers = redact_headers(headers, self.log_sensitive_headers);
        write_json_atomic(&paths.file(REQUEST_HEADERS_FILE), &stored_headers).await?;
        write_bytes_atomic(&paths.file(REQUEST_BODY_FILE), raw_body).await?;

        match normalize_bytes(raw_body) {
            Some(canonical) => {
                write_bytes_atomic(&paths.file(REQUEST_NORMALIZED_FILE), canonical.as_bytes())
                    .await?;
                Ok(true)
            }
            None => {
                tracing::debug!(
                    request_id = %paths.request_id,
                    "request body is not JSON; normalization skipped"
                );
                Ok(false)
            }
        }
    }

    /// Persist capture metadata
    pub async fn save_capture_meta(&self, paths: &CapturePaths, meta: &CaptureMeta) -> Result<()> {
        write_json_atomic(&paths.file(CAPTURE_META_FILE), meta).await
    }

    /// Persist response metadata
    pub async fn save_response_meta(
        &self,
        paths: &CapturePaths,
        meta: &ResponseMeta,
    ) -> Result<()> {
        write_json_atomic(&paths.file(RESPONSE_META_FILE), meta).await
    }

    /// Persist a buffered JSON response body, byte-for-byte
    pub async fn save_response_body(&self, paths: &CapturePaths, body: &[u8]) -> Result<()> {
        write_bytes_atomic(&paths.file(RESPONSE_BODY_FILE), body).await
    }

    /// Persist an opaque (non-JSON, non-SSE) response body, byte-for-byte
    pub async fn save_response_binary(&self, paths: &CapturePaths, body: &[u8]) -> Result<()> {
        write_bytes_atomic(&paths.file(RESPONSE_BINARY_FILE), body).await
    }

    /// Open the append-only SSE capture file for a streaming exchange
    pub async fn open_stream_capture(&self, paths: &CapturePaths) -> Result<StreamCapture> {
        StreamCapture::create(&paths.file(RESPONSE_SSE_FILE), self.max_capture_bytes).await
    }
}

/// Append-only capture of a streamed response
///
/// Chunks are written to disk in arrival order as they are forwarded to the
/// client. A bounded in-memory mirror of the captured bytes is kept so the
/// terminal usage event can be parsed at finalization without re-reading
/// the file.
pub struct StreamCapture {
    file: tokio::fs::File,
    captured: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl StreamCapture {
    async fn create(path: &Path, limit: usize) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| AppError::CaptureWriteFailure(format!("{}: {e}", path.display())))?;

        Ok(Self {
            file,
            captured: Vec::new(),
            limit,
            truncated: false,
        })
    }

    /// Append one chunk, capped at the configured capture size
    pub async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if self.captured.len() >= self.limit {
            self.truncated = true;
            return Ok(());
        }

        let take = chunk.len().min(self.limit - self.captured.len());
        if take < chunk.len() {
            self.truncated = true;
        }

        let slice = &chunk[..take];
        self.file
            .write_all(slice)
            .await
            .map_err(|e| AppError::CaptureWriteFailure(e.to_string()))?;
        self.file
            .flush()
            .await
            .map_err(|e| AppError::CaptureWriteFailure(e.to_string()))?;
        self.captured.extend_from_slice(slice);
        Ok(())
    }

    /// Whether the capture hit the size cap
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Bytes captured so far
    pub fn len(&self) -> usize {
        self.captured.len()
    }

    /// Whether anything has been captured yet
    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }

    /// Captured text, for terminal-event parsing
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.captured).into_owned()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| AppError::CaptureWriteFailure(format!("{}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| AppError::CaptureWriteFailure(format!("{}: {e}", path.display())))?;
    Ok(())
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    write_bytes_atomic(path, text.as_bytes()).await
}
