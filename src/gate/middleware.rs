use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::GatewayError;
use crate::gate::{RequestContext, RequestGate};

/// Axum middleware that applies the route policy to MCP-marked requests.
///
/// Behavior:
/// - Trust-signal header absent or not `true`: passes through untouched.
/// - Marked and the path is exposed: passes through untouched.
/// - Marked and the path is not exposed: returns 403 (`PolicyDenied`) without
///   running any downstream handler.
///
/// Downstream responses, error statuses included, are returned as produced.
pub async fn request_gate(
    State(gate): State<Arc<RequestGate>>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let ctx = RequestContext::from_request(&request, gate.trust_header());
    gate.admit(&ctx)?;
    Ok(next.run(request).await)
}
