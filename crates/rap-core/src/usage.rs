//! Usage extraction from upstream responses
//!
//! The Responses API reports token accounting in a `usage` object, either
//! in a buffered JSON body or inside the terminal event of an SSE stream.
//! Cached-token absence is a valid state distinct from zero: older upstream
//! versions and requests with no cacheable prefix simply omit the field.

use serde_json::Value;

/// Extract the `usage` object from a buffered JSON response body
pub fn usage_from_body(body: &Value) -> Option<Value> {
    match body.get("usage") {
        Some(usage @ Value::Object(_)) => Some(usage.clone()),
        _ => None,
    }
}

/// Extract the `usage` object from raw SSE text
///
/// Responses streaming emits JSON events on `data:` lines; the usage
/// counters arrive in a terminal event. Blank lines, comments, non-JSON
/// payloads and the `[DONE]` sentinel are skipped. The last event carrying
/// a usage object wins.
pub fn usage_from_sse(sse_text: &str) -> Option<Value> {
    let mut usage = None;

    for line in sse_text.lines() {
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        if let Some(found) = usage_from_body(&event) {
            usage = Some(found);
        }
    }

    usage
}

/// Input token count from a usage object
///
/// Accepts both the Responses shape (`input_tokens`) and the older
/// completions shape (`prompt_tokens`). Unparseable counters read as zero.
pub fn input_tokens(usage: &Value) -> u64 {
    for key in ["input_tokens", "prompt_tokens"] {
        if let Some(value) = usage.get(key) {
            return value.as_u64().unwrap_or(0);
        }
    }
    0
}

/// Cached token count from a usage object, if the field is present
///
/// Looks in `input_tokens_details.cached_tokens` first, then falls back to
/// a flat `cached_tokens` for older shapes. Returns `None` when neither
/// field exists, so absence stays distinguishable from a zero value.
pub fn cached_tokens(usage: &Value) -> Option<u64> {
    if let Some(details) = usage.get("input_tokens_details") {
        if let Some(cached) = details.get("cached_tokens") {
            return Some(cached.as_u64().unwrap_or(0));
        }
    }
    usage.get("cached_tokens").map(|v| v.as_u64().unwrap_or(0))
}
