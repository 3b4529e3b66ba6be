//! Forwarding of admitted requests to the downstream application.
//!
//! Everything the gate admits that is not one of the gateway's own routes is
//! sent to the configured upstream. The upstream's status, headers and body
//! come back unchanged, including its error responses.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::Response;
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::policy::has_dot_segment;

/// Largest request body buffered before forwarding.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Connection-scoped headers that must not be relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    base: Url,
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        let base = Url::parse(&config.url).map_err(|e| {
            GatewayError::Config(format!("invalid upstream url '{}': {e}", config.url))
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { base, http })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Join the incoming path and query onto the upstream base url.
    ///
    /// Paths with dot segments are refused: `Url` would resolve them and the
    /// upstream would see a different path from the one the gate checked.
    fn target(&self, uri: &Uri) -> Result<Url, GatewayError> {
        if has_dot_segment(uri.path()) {
            return Err(GatewayError::InvalidArgument(format!(
                "path '{}' contains dot segments",
                uri.path()
            )));
        }

        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{}", uri.path()));
        url.set_query(uri.query());
        Ok(url)
    }

    /// Send the request upstream and relay the response verbatim.
    pub async fn forward(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, GatewayError> {
        let url = self.target(uri)?;

        let mut outbound = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH {
                continue;
            }
            outbound.append(name.clone(), value.clone());
        }

        tracing::debug!(%method, %url, "Forwarding request upstream");

        let upstream = self
            .http
            .request(method, url)
            .headers(outbound)
            .body(body)
            .send()
            .await?;

        let mut response = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name) {
                continue;
            }
            response = response.header(name, value);
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::Internal(format!("failed to build response: {e}")))
    }
}

/// Router whose fallback forwards every unmatched request upstream.
///
/// Request bodies are buffered up to [`MAX_BODY_BYTES`]; larger ones are
/// answered with 413.
pub fn build_forwarding_router(client: Arc<UpstreamClient>) -> Router {
    Router::new()
        .fallback(forward_request)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(client)
}

async fn forward_request(
    State(client): State<Arc<UpstreamClient>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, GatewayError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            GatewayError::PayloadTooLarge(format!(
                "request body exceeds {MAX_BODY_BYTES} bytes"
            ))
        } else {
            GatewayError::InvalidArgument(format!(
                "failed to read request body: {}",
                rejection.body_text()
            ))
        }
    })?;
    client.forward(method, &uri, &headers, body).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::Request;
    use axum::routing::{any, get};
    use tower::ServiceExt;

    async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: String) -> String {
        let custom = headers
            .get("x-custom")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        format!("{method} {uri} {custom} {body}")
    }

    async fn spawn_upstream() -> String {
        let app = Router::new()
            .route("/echo", any(echo))
            .route("/base/echo", any(echo))
            .route(
                "/fail",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, [("x-upstream", "1")], "boom") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(url: &str) -> Arc<UpstreamClient> {
        Arc::new(
            UpstreamClient::new(&UpstreamConfig {
                url: url.to_string(),
                timeout_secs: 5,
            })
            .unwrap(),
        )
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_url() {
        let err = UpstreamClient::new(&UpstreamConfig {
            url: "not a url".to_string(),
            timeout_secs: 5,
        })
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_target_joins_base_path() {
        let c = client("http://localhost:9000/base/");
        let url = c.target(&Uri::from_static("/api/items?page=2")).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/base/api/items?page=2");

        let c = client("http://localhost:9000");
        let url = c.target(&Uri::from_static("/health")).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/health");
    }

    #[test]
    fn test_target_rejects_dot_segments() {
        let c = client("http://localhost:9000");
        for path in [
            "/api/ai-analysis/../admin/users",
            "/api/ai-analysis/%2e%2e/admin/users",
        ] {
            let err = c.target(&Uri::from_static(path)).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidArgument(_)), "{path}");
        }
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("x-mcp-request")));
    }

    #[tokio::test]
    async fn test_forward_relays_method_path_headers_body() {
        let base = spawn_upstream().await;
        let app = build_forwarding_router(client(&base));

        let req = Request::builder()
            .method("POST")
            .uri("/echo?x=1")
            .header("x-custom", "abc")
            .body(Body::from("payload"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "POST /echo?x=1 abc payload");
    }

    #[tokio::test]
    async fn test_forward_with_base_path() {
        let base = spawn_upstream().await;
        let app = build_forwarding_router(client(&format!("{base}/base")));

        let req = Request::builder().uri("/echo").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "GET /base/echo - ");
    }

    #[tokio::test]
    async fn test_forward_returns_upstream_error_verbatim() {
        let base = spawn_upstream().await;
        let app = build_forwarding_router(client(&base));

        let req = Request::builder().uri("/fail").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers().get("x-upstream").unwrap(), "1");
        assert_eq!(body_string(resp).await, "boom");
    }

    #[tokio::test]
    async fn test_forward_unreachable_upstream_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let app = build_forwarding_router(client(&format!("http://{addr}")));
        let req = Request::builder().uri("/anything").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_oversized_body_is_payload_too_large() {
        let base = spawn_upstream().await;
        let app = build_forwarding_router(client(&base));

        let req = Request::builder()
            .method("POST")
            .uri("/echo")
            .body(Body::from(vec![b'x'; MAX_BODY_BYTES + 1]))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
