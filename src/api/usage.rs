use axum::Json;
use axum::extract::Path;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::ledger::{CostBreakdown, UsageRecord, UsageSummary};
use crate::lifecycle::MountedLedger;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RecordUsageRequest {
    /// Generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecordUsageResponse {
    pub request_id: String,
    #[serde(flatten)]
    pub cost: CostBreakdown,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /gateway/usage
pub async fn record_usage(
    MountedLedger(ledger): MountedLedger,
    Json(body): Json<RecordUsageRequest>,
) -> Result<Json<RecordUsageResponse>, GatewayError> {
    let request_id = match body.request_id {
        Some(id) if id.trim().is_empty() => {
            return Err(GatewayError::InvalidArgument(
                "request_id must not be blank".to_string(),
            ));
        }
        Some(id) => id,
        None => uuid::Uuid::new_v4().to_string(),
    };
    let model = body
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| ledger.default_model().to_string());

    let cost = ledger.record(&request_id, body.input_tokens, body.output_tokens, &model)?;
    Ok(Json(RecordUsageResponse { request_id, cost }))
}

/// GET /gateway/usage/summary
pub async fn usage_summary(MountedLedger(ledger): MountedLedger) -> Json<UsageSummary> {
    Json(ledger.summary())
}

/// GET /gateway/usage/{request_id}
pub async fn get_usage(
    MountedLedger(ledger): MountedLedger,
    Path(request_id): Path<String>,
) -> Result<Json<UsageRecord>, GatewayError> {
    ledger
        .get(&request_id)
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound(format!("No usage recorded for '{request_id}'")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
