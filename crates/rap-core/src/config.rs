//! Proxy configuration
//!
//! An immutable configuration object constructed once at process start and
//! passed by reference into the gateway, relay, and capture store. Nothing
//! in the core reads the environment directly; the CLI resolves env
//! fallbacks and hands the finished values in.

use std::path::PathBuf;

/// Default upstream when none is configured.
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com";

/// Default upstream Responses endpoint.
pub const DEFAULT_RESPONSES_PATH: &str = "/v1/responses";

/// Default cap on captured response bytes per exchange.
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 5_000_000;

/// Immutable proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream base URL, without a trailing slash
    pub upstream_base_url: String,
    /// Upstream path that Responses calls are rewritten to
    pub upstream_responses_path: String,
    /// Upstream API key; when set, it replaces any client Authorization
    pub upstream_api_key: Option<String>,
    /// Root of the capture directory tree
    pub log_dir: PathBuf,
    /// Store sensitive headers verbatim instead of redacting them
    pub log_sensitive_headers: bool,
    /// Cap on captured response bytes per exchange
    pub max_capture_bytes: usize,
}

impl ProxyConfig {
    /// Create a configuration with defaults for everything but the log root
    pub fn new(upstream_base_url: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        let base: String = upstream_base_url.into();
        Self {
            upstream_base_url: base.trim_end_matches('/').to_string(),
            upstream_responses_path: DEFAULT_RESPONSES_PATH.to_string(),
            upstream_api_key: None,
            log_dir: log_dir.into(),
            log_sensitive_headers: false,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }

    /// Set the upstream Responses path override
    pub fn with_responses_path(mut self, path: impl Into<String>) -> Self {
        self.upstream_responses_path = path.into();
        self
    }

    /// Set the upstream API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.upstream_api_key = Some(key.into());
        self
    }

    /// Store sensitive headers verbatim
    pub fn with_sensitive_headers(mut self, log_sensitive: bool) -> Self {
        self.log_sensitive_headers = log_sensitive;
        self
    }

    /// Set the capture size cap
    pub fn with_max_capture_bytes(mut self, max: usize) -> Self {
        self.max_capture_bytes = max;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_BASE_URL, "./logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = ProxyConfig::new("https://api.example.com/", "./logs");
        assert_eq!(config.upstream_base_url, "https://api.example.com");
    }

    #[test]
    fn test_builder_chain() {
        let config = ProxyConfig::new("https://api.example.com", "/tmp/caps")
            .with_responses_path("/openai/response")
            .with_api_key("sk-up")
            .with_sensitive_headers(true)
            .with_max_capture_bytes(1024);

        assert_eq!(config.upstream_responses_path, "/openai/response");
        assert_eq!(config.upstream_api_key.as_deref(), Some("sk-up"));
        assert!(config.log_sensitive_headers);
        assert_eq!(config.max_capture_bytes, 1024);
    }
}
