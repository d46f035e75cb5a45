//! Header redaction policy
//!
//! Sensitive header values are replaced with a fixed marker before a
//! capture is written. The decision is made per header, case-insensitively,
//! against a fixed default set; an explicit override flag stores everything
//! verbatim instead.

use std::collections::BTreeMap;

/// Header names whose values are redacted by default
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie"];

/// Marker written in place of a redacted value
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Whether a header name is in the sensitive set (case-insensitive)
pub fn is_sensitive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&lower.as_str())
}

/// Apply the redaction policy to a header map
///
/// With `log_sensitive` set, every header is returned verbatim.
pub fn redact_headers(
    headers: &BTreeMap<String, String>,
    log_sensitive: bool,
) -> BTreeMap<String, String> {
    if log_sensitive {
        return headers.clone();
    }

    headers
        .iter()
        .map(|(name, value)| {
            let stored = if is_sensitive(name) {
                REDACTION_MARKER.to_string()
            } else {
                value.clone()
            };
            (name.clone(), stored)
        })
        .collect()
}
