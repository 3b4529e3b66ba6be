//! Seam for the facility that advertises exposed routes to MCP clients.
//!
//! Turning routes into tool definitions is not this crate's job; the
//! lifecycle only guarantees the facility is mounted exactly once, before the
//! request gate is layered on, so everything it registers is gated too.

use axum::Router;
use axum::routing::get;
use serde::Serialize;

use crate::gate::RequestGate;

pub trait ToolExposure: Send + Sync {
    /// Add whatever routes the facility needs and return the router.
    fn mount(&self, router: Router, gate: &RequestGate) -> Router;
}

/// Serves `GET /mcp/manifest`: the exposed and withheld prefixes plus the
/// header clients must send to be policy-checked.
#[derive(Debug, Clone)]
pub struct RouteManifest {
    name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub name: String,
    pub trust_header: String,
    pub exposed_prefixes: Vec<String>,
    pub withheld_prefixes: Vec<String>,
}

impl RouteManifest {
    pub const PATH: &'static str = "/mcp/manifest";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn manifest(&self, gate: &RequestGate) -> Manifest {
        let spec = gate.policy().spec();
        Manifest {
            name: self.name.clone(),
            trust_header: gate.trust_header().as_str().to_string(),
            exposed_prefixes: spec.allowed().to_vec(),
            withheld_prefixes: spec.blocked().to_vec(),
        }
    }
}

impl ToolExposure for RouteManifest {
    fn mount(&self, router: Router, gate: &RequestGate) -> Router {
        let manifest = self.manifest(gate);
        tracing::info!(
            path = Self::PATH,
            exposed = manifest.exposed_prefixes.len(),
            "Mounting MCP route manifest"
        );
        router.route(
            Self::PATH,
            get(move || {
                let manifest = manifest.clone();
                async move { axum::Json(manifest) }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{HeaderName, Request, StatusCode};
    use tower::ServiceExt;

    use crate::policy::{RoutePolicy, RouteSpec};

    fn gate() -> RequestGate {
        RequestGate::new(
            Arc::new(RoutePolicy::new(RouteSpec::new(
                ["/api/ai-analysis"],
                ["/api/admin", "/docs"],
            ))),
            HeaderName::from_static("x-mcp-request"),
        )
    }

    #[test]
    fn test_manifest_contents() {
        let manifest = RouteManifest::new("gate").manifest(&gate());
        assert_eq!(manifest.name, "gate");
        assert_eq!(manifest.trust_header, "x-mcp-request");
        assert_eq!(manifest.exposed_prefixes, vec!["/api/ai-analysis"]);
        assert_eq!(manifest.withheld_prefixes, vec!["/api/admin", "/docs"]);
    }

    #[tokio::test]
    async fn test_manifest_route_served() {
        let app = RouteManifest::new("gate").mount(Router::new(), &gate());

        let req = Request::builder()
            .uri(RouteManifest::PATH)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["exposed_prefixes"][0], "/api/ai-analysis");
    }
}
