pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod exposure;
pub mod gate;
pub mod ledger;
pub mod lifecycle;
pub mod policy;
pub mod upstream;

use std::sync::Arc;

use axum::Router;

use crate::exposure::ToolExposure;
use crate::lifecycle::GatewayLifecycle;
use crate::upstream::{UpstreamClient, build_forwarding_router};

/// Assemble the gateway application: its own API, the upstream fallback and
/// the exposure facility, with the request gate layered over all of them.
///
/// Transport layers (tracing, request ids, CORS) are left to the caller.
pub fn build_gateway(
    lifecycle: &GatewayLifecycle,
    upstream: Arc<UpstreamClient>,
    exposure: &dyn ToolExposure,
) -> Router {
    let routes = api::build_api_router().merge(build_forwarding_router(upstream));
    lifecycle.mount(routes, exposure)
}
