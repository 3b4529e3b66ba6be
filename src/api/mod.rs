pub mod health;
pub mod usage;

use axum::Router;
use axum::routing::{get, post};

/// Build the gateway's own API router.
///
/// Route layout:
/// ```text
/// /health                          GET
/// /gateway/usage                   POST   record one invocation
/// /gateway/usage/summary           GET    aggregate counters
/// /gateway/usage/{request_id}      GET    latest record for an id
/// ```
///
/// The usage handlers read the ledger installed by
/// [`GatewayLifecycle::mount`](crate::lifecycle::GatewayLifecycle::mount),
/// so this router must be mounted before it is served.
pub fn build_api_router() -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/gateway/usage", post(usage::record_usage))
        .route("/gateway/usage/summary", get(usage::usage_summary))
        .route("/gateway/usage/{request_id}", get(usage::get_usage))
}
