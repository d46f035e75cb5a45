//! Streaming relay
//!
//! Copies an upstream response to the client while tee-ing the identical
//! bytes into the capture store. The response is classified once, at the
//! boundary, from its declared content type; downstream code matches on the
//! variant instead of probing the body.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rap_core::store::{CapturePaths, CaptureStore, ResponseMeta, StreamCapture};
use rap_core::usage::{usage_from_body, usage_from_sse};

/// Response headers never copied back to the client. The body is re-framed
/// by axum, and accept-encoding was stripped on the way up so there is no
/// content-encoding to preserve.
const RESPONSE_SKIP_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "connection",
    "content-length",
];

/// How an upstream response is relayed, decided from its content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// A single JSON document, read and forwarded as one unit
    BufferedJson,
    /// An SSE stream, forwarded chunk-by-chunk as it arrives
    EventStream,
    /// Anything else: forwarded and captured byte-for-byte, never parsed
    Opaque,
}

/// Classify a response by its declared content type, not its body
pub fn classify(content_type: &str) -> UpstreamKind {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("text/event-stream") {
        UpstreamKind::EventStream
    } else if ct.contains("application/json") || ct.contains("+json") {
        UpstreamKind::BufferedJson
    } else {
        UpstreamKind::Opaque
    }
}

/// Per-request context handed from the gateway to the relay
pub struct RelayContext {
    pub store: Arc<CaptureStore>,
    /// None when creating the capture directory failed; forwarding
    /// proceeds uncaptured
    pub paths: Option<CapturePaths>,
    pub upstream_url: String,
    pub started: Instant,
}

/// Relay an upstream response to the client, capturing as it goes
pub async fn relay_response(ctx: RelayContext, response: reqwest::Response) -> Response {
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match classify(content_type) {
        UpstreamKind::EventStream => relay_stream(ctx, response).await,
        UpstreamKind::BufferedJson => relay_buffered(ctx, response, true).await,
        UpstreamKind::Opaque => relay_buffered(ctx, response, false).await,
    }
}

/// Buffered path: read the complete body, capture it verbatim, then send
/// it to the client as one unit
async fn relay_buffered(ctx: RelayContext, response: reqwest::Response, json: bool) -> Response {
    let status = response.status();
    let resp_headers = response.headers().clone();

    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read upstream response body");
            if let Some(paths) = &ctx.paths {
                let meta = error_meta(&ctx, status.as_u16(), e.to_string());
                if let Err(we) = ctx.store.save_response_meta(paths, &meta).await {
                    warn!(error = %we, "capture write failed");
                }
            }
            return (StatusCode::BAD_GATEWAY, "Failed to read upstream response body")
                .into_response();
        }
    };

    let usage = if json {
        serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| usage_from_body(&v))
    } else {
        None
    };

    if let Some(paths) = &ctx.paths {
        let saved = if json {
            ctx.store.save_response_body(paths, &body).await
        } else {
            ctx.store.save_response_binary(paths, &body).await
        };
        if let Err(e) = saved {
            // forwarding takes precedence over logging
            warn!(error = %e, "capture write failed; response still delivered");
        }

        let meta = ResponseMeta {
            upstream_url: ctx.upstream_url.clone(),
            status_code: status.as_u16(),
            elapsed_ms: ctx.started.elapsed().as_millis() as u64,
            captured_at: Utc::now(),
            streaming: false,
            capture_truncated: false,
            usage,
            error: None,
        };
        if let Err(e) = ctx.store.save_response_meta(paths, &meta).await {
            warn!(error = %e, "capture write failed; response still delivered");
        }
    }

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in resp_headers.iter() {
        if RESPONSE_SKIP_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Streaming path: forward each chunk to the client immediately and tee
/// the identical bytes to a dedicated writer task
///
/// The writer task owns the append-only capture file and drains a channel,
/// so a slow disk never delays the client. When the stream ends for any
/// reason (completion, upstream error, client disconnect dropping the
/// body), the sender side closes and the writer finalizes the capture.
async fn relay_stream(ctx: RelayContext, response: reqwest::Response) -> Response {
    let status = response.status();
    let resp_headers = response.headers().clone();

    let capture_tx = match &ctx.paths {
        Some(paths) => match ctx.store.open_stream_capture(paths).await {
            Ok(capture) => {
                let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
                tokio::spawn(drain_stream_capture(
                    ctx.store.clone(),
                    paths.clone(),
                    capture,
                    rx,
                    ctx.upstream_url.clone(),
                    status.as_u16(),
                    ctx.started,
                ));
                Some(tx)
            }
            Err(e) => {
                warn!(error = %e, "capture write failed; stream delivery unaffected");
                None
            }
        },
        None => None,
    };

    let stream = response.bytes_stream().map(move |result| match result {
        Ok(chunk) => {
            if let Some(tx) = &capture_tx {
                let _ = tx.send(chunk.clone());
            }
            Ok::<_, std::io::Error>(chunk)
        }
        Err(e) => {
            warn!(error = %e, "upstream stream error");
            Err(std::io::Error::other(e))
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in resp_headers.iter() {
        if RESPONSE_SKIP_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }

    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Writer side of a streaming capture: append chunks in arrival order,
/// then finalize the metadata once the channel closes
async fn drain_stream_capture(
    store: Arc<CaptureStore>,
    paths: CapturePaths,
    mut capture: StreamCapture,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    upstream_url: String,
    status_code: u16,
    started: Instant,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = capture.append(&chunk).await {
            warn!(error = %e, "capture write failed; stream delivery unaffected");
            break;
        }
    }

    // the sender is gone: stream complete, upstream error, or client
    // disconnect; whatever partial text exists is finalized as-is
    let text = capture.text();
    let usage = usage_from_sse(&text);
    debug!(
        request_id = %paths.request_id,
        bytes = capture.len(),
        has_usage = usage.is_some(),
        "finalizing stream capture"
    );

    let meta = ResponseMeta {
        upstream_url,
        status_code,
        elapsed_ms: started.elapsed().as_millis() as u64,
        captured_at: Utc::now(),
        streaming: true,
        capture_truncated: capture.truncated(),
        usage,
        error: None,
    };
    if let Err(e) = store.save_response_meta(&paths, &meta).await {
        warn!(error = %e, "capture write failed while finalizing stream");
    }
}

fn error_meta(ctx: &RelayContext, status_code: u16, error: String) -> ResponseMeta {
    ResponseMeta {
        upstream_url: ctx.upstream_url.clone(),
        status_code,
        elapsed_ms: ctx.started.elapsed().as_millis() as u64,
        captured_at: Utc::now(),
        streaming: false,
        capture_truncated: false,
        usage: None,
        error: Some(error),
    }
}
