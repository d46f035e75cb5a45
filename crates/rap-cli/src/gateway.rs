//! Forwarding gateway
//!
//! Receives inbound requests, rewrites the target to the configured
//! upstream, applies the credential policy, and hands the upstream
//! response to the streaming relay. Exactly one capture is produced per
//! accepted inbound request, created before the upstream dispatch so the
//! files exist even when the call fails.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use chrono::Utc;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use rap_core::config::ProxyConfig;
use rap_core::store::{CacheIdent, CaptureMeta, CaptureStore, ResponseMeta};

use crate::relay::{relay_response, RelayContext};

/// Inbound paths that all map to the upstream Responses endpoint. The
/// `/openai/...` forms are legacy aliases kept for older SDK configs.
const RESPONSES_ALIASES: &[&str] = &[
    "/v1/responses",
    "/openai/v1/responses",
    "/openai/v1/response",
];

/// Headers never forwarded upstream. `accept-encoding` is stripped so the
/// upstream replies uncompressed and the captured bytes stay readable.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "accept-encoding",
    "transfer-encoding",
    "upgrade",
];

/// Cap on inbound request bodies
const REQUEST_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// State shared across gateway handlers
#[derive(Clone)]
pub struct GatewayState {
    /// Immutable configuration, constructed once at startup
    pub config: Arc<ProxyConfig>,
    /// Capture store rooted at the configured log directory
    pub store: Arc<CaptureStore>,
    /// HTTP client for upstream calls
    pub client: reqwest::Client,
}

/// Build the shared gateway state from a finished configuration
pub fn build_state(config: ProxyConfig) -> Result<GatewayState, String> {
    // no total timeout: an SSE stream may stay open far longer than any
    // single read should take
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

    let store = CaptureStore::from_config(&config);

    Ok(GatewayState {
        config: Arc::new(config),
        store: Arc::new(store),
        client,
    })
}

/// Build the gateway router
pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/", any(forward_handler))
        .route("/*path", any(forward_handler))
        .with_state(state)
        .layer(cors)
}

/// Run the gateway until the server exits
pub async fn run_gateway(config: ProxyConfig, host: &str, port: u16) -> Result<(), String> {
    info!(
        upstream = %config.upstream_base_url,
        log_dir = %config.log_dir.display(),
        "starting gateway"
    );

    let state = build_state(config)?;
    let app = router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind to {addr}: {e}"))?;

    eprintln!("[rap] listening on http://{addr}");
    info!("gateway listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| format!("Server error: {e}"))
}

/// Health check endpoint
async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "rap proxy is healthy")
}

/// Main forwarding handler: capture, dispatch upstream, relay back
async fn forward_handler(State(state): State<GatewayState>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let path = uri.path().to_string();
    let query = uri.query().map(str::to_string);

    let body_bytes = match axum::body::to_bytes(req.into_body(), REQUEST_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
        }
    };

    // the capture directory is created before the upstream dispatch so the
    // request files exist even if the call fails or times out mid-stream
    let paths = match state.store.begin_capture() {
        Ok(paths) => Some(paths),
        Err(e) => {
            error!(error = %e, "failed to create capture directory; forwarding uncaptured");
            None
        }
    };

    let header_map = headers_to_map(&headers);
    let body_value: Option<Value> = serde_json::from_slice(&body_bytes).ok();

    if let Some(paths) = &paths {
        let body_is_json = match state.store.save_request(paths, &header_map, &body_bytes).await {
            Ok(is_json) => is_json,
            Err(e) => {
                warn!(error = %e, "capture write failed; request still forwarded");
                body_value.is_some()
            }
        };

        let meta = CaptureMeta {
            method: method.to_string(),
            path: path.clone(),
            query: query.clone().unwrap_or_default(),
            captured_at: Utc::now(),
            body_is_json,
            cache_ident: CacheIdent::from_request(&header_map, body_value.as_ref()),
        };
        if let Err(e) = state.store.save_capture_meta(paths, &meta).await {
            warn!(error = %e, "capture write failed; request still forwarded");
        }
    }

    let url = upstream_url(&state.config, &path, query.as_deref());
    debug!(%method, %url, "forwarding request");

    let mut upstream_req = state.client.request(method, &url);

    // credential policy, decided once from configuration presence: a
    // configured upstream key replaces any client Authorization; with no
    // key the client's header passes through unmodified
    let inject_key = state.config.upstream_api_key.is_some();
    for (name, value) in headers.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name_lower.as_str()) {
            continue;
        }
        if name_lower == "authorization" && inject_key {
            continue;
        }
        if let Ok(v) = value.to_str() {
            upstream_req = upstream_req.header(name.clone(), v);
        }
    }
    if let Some(key) = &state.config.upstream_api_key {
        upstream_req = upstream_req.header("authorization", format!("Bearer {key}"));
    }

    if !body_bytes.is_empty() {
        upstream_req = upstream_req.body(body_bytes.to_vec());
    }

    let upstream_response = match upstream_req.send().await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, %url, "upstream request failed");
            if let Some(paths) = &paths {
                let meta = ResponseMeta {
                    upstream_url: url.clone(),
                    status_code: StatusCode::BAD_GATEWAY.as_u16(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    captured_at: Utc::now(),
                    streaming: false,
                    capture_truncated: false,
                    usage: None,
                    error: Some(e.to_string()),
                };
                if let Err(we) = state.store.save_response_meta(paths, &meta).await {
                    warn!(error = %we, "capture write failed on error path");
                }
            }
            return proxy_error_response(&e.to_string());
        }
    };

    let ctx = RelayContext {
        store: state.store.clone(),
        paths,
        upstream_url: url,
        started,
    };
    relay_response(ctx, upstream_response).await
}

/// Build the outbound URL: alias paths rewrite to the configured upstream
/// Responses endpoint, anything else forwards unchanged
fn upstream_url(config: &ProxyConfig, path: &str, query: Option<&str>) -> String {
    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    let out_path = if RESPONSES_ALIASES.contains(&trimmed) {
        config.upstream_responses_path.as_str()
    } else {
        path
    };

    match query {
        Some(q) if !q.is_empty() => format!("{}{}?{}", config.upstream_base_url, out_path, q),
        _ => format!("{}{}", config.upstream_base_url, out_path),
    }
}

/// Flatten inbound headers into the capture representation, joining
/// repeated names
fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&text);
            })
            .or_insert(text);
    }
    out
}

fn proxy_error_response(message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "hint": "Check RAP_UPSTREAM_BASE_URL / RAP_UPSTREAM_API_KEY and upstream availability.",
        }
    });
    (StatusCode::BAD_GATEWAY, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::routing::post;
    use serde_json::json;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    use rap_core::analyze;
    use rap_core::store::{RESPONSE_META_FILE, RESPONSE_SSE_FILE};

    #[test]
    fn test_upstream_url_alias_mapping() {
        let config = ProxyConfig::new("https://api.example.com", "./logs")
            .with_responses_path("/custom/responses");

        for inbound in ["/v1/responses", "/openai/v1/responses", "/openai/v1/response"] {
            assert_eq!(
                upstream_url(&config, inbound, None),
                "https://api.example.com/custom/responses"
            );
        }
        // trailing slash still matches the alias
        assert_eq!(
            upstream_url(&config, "/v1/responses/", None),
            "https://api.example.com/custom/responses"
        );
    }

    #[test]
    fn test_upstream_url_passthrough_and_query() {
        let config = ProxyConfig::new("https://api.example.com", "./logs");
        assert_eq!(
            upstream_url(&config, "/v1/models", None),
            "https://api.example.com/v1/models"
        );
        assert_eq!(
            upstream_url(&config, "/v1/responses", Some("a=1&b=2")),
            "https://api.example.com/v1/responses?a=1&b=2"
        );
    }

    #[test]
    fn test_headers_to_map_joins_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", "one".parse().unwrap());
        headers.append("x-tag", "two".parse().unwrap());
        let map = headers_to_map(&headers);
        assert_eq!(map["x-tag"], "one, two");
    }

    // ---- end-to-end tests against a stub upstream on loopback ----

    /// Authorization values the stub upstream observed, one per request
    #[derive(Clone, Default)]
    struct SeenAuth(Arc<Mutex<Vec<Option<String>>>>);

    async fn stub_json_handler(
        State(seen): State<SeenAuth>,
        headers: HeaderMap,
        _body: Bytes,
    ) -> Response {
        seen.0.lock().unwrap().push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        );
        Json(json!({
            "id": "resp_1",
            "output": [{"type": "message", "content": "hello"}],
            "usage": {"input_tokens": 500, "input_tokens_details": {"cached_tokens": 100}}
        }))
        .into_response()
    }

    fn sse_events() -> Vec<String> {
        let mut events: Vec<String> = (1..=4)
            .map(|n| format!("data: {{\"type\":\"response.output_text.delta\",\"n\":{n}}}\n\n"))
            .collect();
        events.push(
            "data: {\"type\":\"response.completed\",\"usage\":{\"input_tokens\":500,\"input_tokens_details\":{\"cached_tokens\":100}}}\n\n"
                .to_string(),
        );
        events
    }

    async fn stub_sse_handler() -> Response {
        let chunks: Vec<Result<Bytes, Infallible>> = sse_events()
            .into_iter()
            .map(|e| Ok(Bytes::from(e)))
            .collect();

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap()
    }

    async fn spawn_app(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn spawn_stub_upstream(seen: SeenAuth) -> SocketAddr {
        let app = Router::new()
            .route("/v1/responses", post(stub_json_handler))
            .route("/custom/responses", post(stub_json_handler))
            .route("/v1/responses/stream", post(stub_sse_handler))
            .with_state(seen);
        spawn_app(app).await
    }

    async fn spawn_proxy(config: ProxyConfig) -> SocketAddr {
        let state = build_state(config).unwrap();
        spawn_app(router(state)).await
    }

    /// Wait for the asynchronous capture writer to finalize response.meta.json
    async fn wait_for_meta(capture_dir: &Path) {
        for _ in 0..100 {
            if capture_dir.join(RESPONSE_META_FILE).exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("capture was not finalized: {}", capture_dir.display());
    }

    fn single_capture_dir(log_root: &Path) -> std::path::PathBuf {
        let captures = analyze::find_captures(log_root);
        assert_eq!(captures.len(), 1, "expected exactly one capture");
        captures[0].dir.clone()
    }

    #[tokio::test]
    async fn test_configured_key_replaces_client_authorization() {
        let seen = SeenAuth::default();
        let upstream = spawn_stub_upstream(seen.clone()).await;
        let log_dir = TempDir::new().unwrap();

        let config = ProxyConfig::new(format!("http://{upstream}"), log_dir.path())
            .with_api_key("sk-up");
        let proxy = spawn_proxy(config).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{proxy}/v1/responses"))
            .header("content-type", "application/json")
            .body(r#"{"model":"gpt-4o-mini","input":"hi"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let observed = seen.0.lock().unwrap().clone();
        assert_eq!(observed, vec![Some("Bearer sk-up".to_string())]);

        let capture_dir = single_capture_dir(log_dir.path());
        wait_for_meta(&capture_dir).await;
        let meta: ResponseMeta = serde_json::from_slice(
            &std::fs::read(capture_dir.join(RESPONSE_META_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.status_code, 200);
        assert!(!meta.streaming);
        assert!(meta.usage.is_some());
    }

    #[tokio::test]
    async fn test_client_authorization_passes_through_without_key() {
        let seen = SeenAuth::default();
        let upstream = spawn_stub_upstream(seen.clone()).await;
        let log_dir = TempDir::new().unwrap();

        let config = ProxyConfig::new(format!("http://{upstream}"), log_dir.path());
        let proxy = spawn_proxy(config).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{proxy}/v1/responses"))
            .header("content-type", "application/json")
            .header("authorization", "Bearer sk-client")
            .body(r#"{"model":"gpt-4o-mini","input":"hi"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let observed = seen.0.lock().unwrap().clone();
        assert_eq!(observed, vec![Some("Bearer sk-client".to_string())]);

        // the stored headers still redact the credential
        let capture_dir = single_capture_dir(log_dir.path());
        let stored: BTreeMap<String, String> = serde_json::from_slice(
            &std::fs::read(capture_dir.join(rap_core::store::REQUEST_HEADERS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(stored["authorization"], rap_core::redact::REDACTION_MARKER);
    }

    #[tokio::test]
    async fn test_legacy_alias_reaches_custom_upstream_path() {
        let seen = SeenAuth::default();
        let upstream = spawn_stub_upstream(seen.clone()).await;
        let log_dir = TempDir::new().unwrap();

        let config = ProxyConfig::new(format!("http://{upstream}"), log_dir.path())
            .with_responses_path("/custom/responses");
        let proxy = spawn_proxy(config).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{proxy}/openai/v1/response"))
            .header("content-type", "application/json")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(seen.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sse_events_forwarded_in_order_and_captured() {
        let seen = SeenAuth::default();
        let upstream = spawn_stub_upstream(seen.clone()).await;
        let log_dir = TempDir::new().unwrap();

        let config = ProxyConfig::new(format!("http://{upstream}"), log_dir.path());
        let proxy = spawn_proxy(config).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{proxy}/v1/responses/stream"))
            .header("content-type", "application/json")
            .body(r#"{"model":"gpt-4o-mini","input":"hi","stream":true}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .contains("text/event-stream"));

        let received = response.text().await.unwrap();
        let expected = sse_events().concat();
        assert_eq!(received, expected);

        let capture_dir = single_capture_dir(log_dir.path());
        wait_for_meta(&capture_dir).await;

        let captured = std::fs::read_to_string(capture_dir.join(RESPONSE_SSE_FILE)).unwrap();
        assert_eq!(captured, expected);

        let meta: ResponseMeta = serde_json::from_slice(
            &std::fs::read(capture_dir.join(RESPONSE_META_FILE)).unwrap(),
        )
        .unwrap();
        assert!(meta.streaming);
        assert!(!meta.capture_truncated);
        let usage = meta.usage.expect("usage parsed from terminal event");
        assert_eq!(rap_core::usage::input_tokens(&usage), 500);
        assert_eq!(rap_core::usage::cached_tokens(&usage), Some(100));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_still_writes_capture() {
        let log_dir = TempDir::new().unwrap();

        // nothing listens on this port
        let config = ProxyConfig::new("http://127.0.0.1:1", log_dir.path());
        let proxy = spawn_proxy(config).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{proxy}/v1/responses"))
            .header("content-type", "application/json")
            .body(r#"{"model":"gpt-4o-mini","input":"hi"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "proxy_error");

        let capture_dir = single_capture_dir(log_dir.path());
        wait_for_meta(&capture_dir).await;
        let meta: ResponseMeta = serde_json::from_slice(
            &std::fs::read(capture_dir.join(RESPONSE_META_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.status_code, 502);
        assert!(meta.error.is_some());
        assert!(meta.usage.is_none());
    }

    #[tokio::test]
    async fn test_stats_over_proxied_captures() {
        let seen = SeenAuth::default();
        let upstream = spawn_stub_upstream(seen.clone()).await;
        let log_dir = TempDir::new().unwrap();

        let config = ProxyConfig::new(format!("http://{upstream}"), log_dir.path());
        let proxy = spawn_proxy(config).await;

        let client = reqwest::Client::new();
        for _ in 0..2 {
            client
                .post(format!("http://{proxy}/v1/responses"))
                .header("content-type", "application/json")
                .body(r#"{"model":"gpt-4o-mini","input":"hi"}"#)
                .send()
                .await
                .unwrap();
        }

        for capture in analyze::find_captures(log_dir.path()) {
            wait_for_meta(&capture.dir).await;
        }

        let stats = analyze::window_stats(log_dir.path(), None, None);
        assert_eq!(stats.captures, 2);
        assert_eq!(stats.with_cached_tokens, 2);
        assert_eq!(stats.input_tokens, 1000);
        assert_eq!(stats.cached_tokens, 200);
    }
}
