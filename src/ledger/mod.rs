pub mod audit;
pub mod retention;
pub mod tracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PricingConfig;
use crate::error::GatewayError;

pub use self::audit::spawn_audit_logger;
pub use self::retention::spawn_retention_sweeper;
pub use self::tracker::UsageLedger;

const MICROS_PER_USD: f64 = 1_000_000.0;

/// Convert whole micro-dollars to USD. Exact to 6 decimal places.
pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Token rates in USD per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingRates {
    input_per_1k: f64,
    output_per_1k: f64,
}

impl PricingRates {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Result<Self, GatewayError> {
        for rate in [input_per_1k, output_per_1k] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(GatewayError::InvalidArgument(format!(
                    "token rate must be a non-negative number, got {rate}"
                )));
            }
        }
        Ok(Self {
            input_per_1k,
            output_per_1k,
        })
    }

    pub fn from_config(config: &PricingConfig) -> Result<Self, GatewayError> {
        Self::new(config.input_rate_per_1k, config.output_rate_per_1k)
    }

    pub fn input_per_1k(&self) -> f64 {
        self.input_per_1k
    }

    pub fn output_per_1k(&self) -> f64 {
        self.output_per_1k
    }

    /// Input cost in micro-dollars, rounded to the nearest micro-dollar.
    pub fn input_cost_micros(&self, tokens: u64) -> u64 {
        cost_micros(tokens, self.input_per_1k)
    }

    /// Output cost in micro-dollars, rounded to the nearest micro-dollar.
    pub fn output_cost_micros(&self, tokens: u64) -> u64 {
        cost_micros(tokens, self.output_per_1k)
    }
}

fn cost_micros(tokens: u64, rate_per_1k: f64) -> u64 {
    ((tokens as f64 / 1000.0) * rate_per_1k * MICROS_PER_USD).round() as u64
}

/// Stored accounting for one metered invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub model: String,
}

/// Process-wide counters. Never decremented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerAggregate {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_micros: u64,
    pub request_count: u64,
}

impl LedgerAggregate {
    pub fn total_cost_usd(&self) -> f64 {
        micros_to_usd(self.total_cost_micros)
    }
}

/// Result of a single `record` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub total_cost_usd: f64,
    pub model: String,
    /// Ledger-wide total cost immediately after this call was applied.
    pub cumulative_cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub average_cost_per_request: f64,
}

impl From<LedgerAggregate> for UsageSummary {
    fn from(agg: LedgerAggregate) -> Self {
        // Unrounded; only per-call sub-costs are held to whole micro-dollars.
        let average_cost_per_request = if agg.request_count > 0 {
            agg.total_cost_micros as f64 / agg.request_count as f64 / MICROS_PER_USD
        } else {
            0.0
        };

        Self {
            total_requests: agg.request_count,
            total_input_tokens: agg.total_input_tokens,
            total_output_tokens: agg.total_output_tokens,
            total_tokens: agg.total_input_tokens.saturating_add(agg.total_output_tokens),
            total_cost_usd: agg.total_cost_usd(),
            average_cost_per_request,
        }
    }
}
