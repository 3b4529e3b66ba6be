use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::ledger::{
    CostBreakdown, LedgerAggregate, PricingRates, UsageRecord, UsageSummary, micros_to_usd,
};

#[derive(Debug, Default)]
struct LedgerState {
    aggregate: LedgerAggregate,
    records: HashMap<String, UsageRecord>,
}

/// Meters model token consumption and dollar cost for the process lifetime.
///
/// A single mutex guards both the aggregate counters and the per-request
/// records, so each `record` call is applied atomically: concurrent callers
/// never lose updates and the aggregates always equal the sum of the calls.
///
/// Aggregates count every call. Records are keyed by request id and a repeat
/// id overwrites the earlier record, so the two can legitimately diverge.
#[derive(Debug)]
pub struct UsageLedger {
    rates: PricingRates,
    default_model: String,
    state: Mutex<LedgerState>,
    audit_tx: Option<mpsc::UnboundedSender<UsageRecord>>,
}

impl UsageLedger {
    pub fn new(rates: PricingRates, default_model: impl Into<String>) -> Self {
        Self {
            rates,
            default_model: default_model.into(),
            state: Mutex::new(LedgerState::default()),
            audit_tx: None,
        }
    }

    /// Forward a copy of every stored record to the audit logger.
    pub fn with_audit_sink(mut self, tx: mpsc::UnboundedSender<UsageRecord>) -> Self {
        self.audit_tx = Some(tx);
        self
    }

    pub fn rates(&self) -> PricingRates {
        self.rates
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Record one completed invocation.
    ///
    /// Token counts are validated before any state changes; a rejected call
    /// leaves the ledger untouched.
    pub fn record(
        &self,
        request_id: &str,
        input_tokens: i64,
        output_tokens: i64,
        model: &str,
    ) -> Result<CostBreakdown, GatewayError> {
        let input_tokens = non_negative("input_tokens", input_tokens)?;
        let output_tokens = non_negative("output_tokens", output_tokens)?;

        let input_micros = self.rates.input_cost_micros(input_tokens);
        let output_micros = self.rates.output_cost_micros(output_tokens);
        let total_micros = input_micros.saturating_add(output_micros);

        let record = UsageRecord {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            input_tokens,
            output_tokens,
            input_cost: micros_to_usd(input_micros),
            output_cost: micros_to_usd(output_micros),
            total_cost: micros_to_usd(total_micros),
            model: model.to_string(),
        };

        let cumulative_micros = {
            let mut state = self.lock();
            let agg = &mut state.aggregate;
            agg.total_input_tokens = agg.total_input_tokens.saturating_add(input_tokens);
            agg.total_output_tokens = agg.total_output_tokens.saturating_add(output_tokens);
            agg.total_cost_micros = agg.total_cost_micros.saturating_add(total_micros);
            agg.request_count = agg.request_count.saturating_add(1);
            let cumulative = agg.total_cost_micros;

            if let Some(previous) = state.records.insert(request_id.to_string(), record.clone()) {
                tracing::debug!(
                    request_id,
                    previous_cost_usd = previous.total_cost,
                    "Usage record overwritten by repeated request id"
                );
            }
            cumulative
        };

        tracing::info!(
            request_id,
            model,
            input_tokens,
            output_tokens,
            cost_usd = %format!("${:.6}", record.total_cost),
            cumulative_cost_usd = %format!("${:.6}", micros_to_usd(cumulative_micros)),
            "Usage recorded"
        );

        let breakdown = CostBreakdown {
            input_tokens,
            output_tokens,
            input_cost_usd: record.input_cost,
            output_cost_usd: record.output_cost,
            total_cost_usd: record.total_cost,
            model: record.model.clone(),
            cumulative_cost_usd: micros_to_usd(cumulative_micros),
        };

        if let Some(tx) = &self.audit_tx {
            if tx.send(record).is_err() {
                tracing::warn!(request_id, "Audit logger has stopped; usage not persisted");
            }
        }

        Ok(breakdown)
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary::from(self.aggregate())
    }

    pub fn aggregate(&self) -> LedgerAggregate {
        self.lock().aggregate
    }

    /// The most recent record stored for `request_id`, if still retained.
    pub fn get(&self, request_id: &str) -> Option<UsageRecord> {
        self.lock().records.get(request_id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Drop per-request records older than `cutoff`. Aggregates are not
    /// affected. Returns the number of records removed.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let before = state.records.len();
        state.records.retain(|_, r| r.timestamp >= cutoff);
        before - state.records.len()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // Every mutation completes before the guard is released, so a
        // poisoned lock still holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn non_negative(name: &str, value: i64) -> Result<u64, GatewayError> {
    u64::try_from(value)
        .map_err(|_| GatewayError::InvalidArgument(format!("{name} must be >= 0, got {value}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ledger() -> UsageLedger {
        UsageLedger::new(PricingRates::new(0.003, 0.009).unwrap(), "test-model")
    }

    #[test]
    fn test_record_thousand_tokens() {
        let ledger = ledger();
        let b = ledger.record("req-1", 1000, 1000, "claude").unwrap();

        assert_eq!(b.input_cost_usd, 0.003);
        assert_eq!(b.output_cost_usd, 0.009);
        assert_eq!(b.total_cost_usd, 0.012);
        assert_eq!(b.cumulative_cost_usd, 0.012);
        assert_eq!(b.model, "claude");
        assert_eq!(b.input_tokens, 1000);
        assert_eq!(b.output_tokens, 1000);
    }

    #[test]
    fn test_record_stores_usage_record() {
        let ledger = ledger();
        ledger.record("req-1", 200, 100, "claude").unwrap();

        let rec = ledger.get("req-1").unwrap();
        assert_eq!(rec.request_id, "req-1");
        assert_eq!(rec.input_tokens, 200);
        assert_eq!(rec.output_tokens, 100);
        assert_eq!(rec.input_cost, 0.0006);
        assert_eq!(rec.output_cost, 0.0009);
        assert_eq!(rec.total_cost, 0.0015);
        assert!(ledger.get("req-2").is_none());
    }

    #[test]
    fn test_cumulative_cost_tracks_running_total() {
        let ledger = ledger();
        let first = ledger.record("a", 1000, 0, "m").unwrap();
        let second = ledger.record("b", 0, 1000, "m").unwrap();

        assert_eq!(first.cumulative_cost_usd, 0.003);
        assert_eq!(second.cumulative_cost_usd, 0.012);
    }

    #[test]
    fn test_sequential_records_sum() {
        let ledger = ledger();
        let mut expected_micros = 0u64;
        let n = 25;

        for i in 0..n {
            let b = ledger
                .record(&format!("req-{i}"), i * 37, i * 11, "m")
                .unwrap();
            expected_micros += (b.total_cost_usd * 1_000_000.0).round() as u64;
        }

        let summary = ledger.summary();
        assert_eq!(summary.total_requests, n as u64);
        assert_eq!(ledger.aggregate().total_cost_micros, expected_micros);
        assert!((summary.total_cost_usd - expected_micros as f64 / 1_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_empty_ledger() {
        let summary = ledger().summary();
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.total_tokens, 0);
        assert_eq!(summary.average_cost_per_request, 0.0);
    }

    #[test]
    fn test_summary_totals() {
        let ledger = ledger();
        ledger.record("a", 1000, 1000, "m").unwrap();
        ledger.record("b", 1000, 1000, "m").unwrap();

        let summary = ledger.summary();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.total_input_tokens, 2000);
        assert_eq!(summary.total_output_tokens, 2000);
        assert_eq!(summary.total_tokens, 4000);
        assert_eq!(summary.total_cost_usd, 0.024);
        assert_eq!(summary.average_cost_per_request, 0.012);
    }

    #[test]
    fn test_negative_tokens_rejected_without_mutation() {
        let ledger = ledger();
        ledger.record("ok", 10, 10, "m").unwrap();
        let before = ledger.aggregate();

        let err = ledger.record("bad", -1, 10, "m").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
        let err = ledger.record("bad", 10, -5, "m").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));

        assert_eq!(ledger.aggregate(), before);
        assert!(ledger.get("bad").is_none());
    }

    #[test]
    fn test_zero_tokens_allowed() {
        let ledger = ledger();
        let b = ledger.record("zero", 0, 0, "m").unwrap();
        assert_eq!(b.total_cost_usd, 0.0);
        assert_eq!(ledger.summary().total_requests, 1);
    }

    #[test]
    fn test_duplicate_request_id_double_counts_aggregate() {
        let ledger = ledger();
        ledger.record("dup", 1000, 1000, "first").unwrap();
        ledger.record("dup", 100, 50, "second").unwrap();

        let agg = ledger.aggregate();
        assert_eq!(agg.request_count, 2);
        assert_eq!(agg.total_input_tokens, 1100);
        assert_eq!(agg.total_output_tokens, 1050);
        assert_eq!(agg.total_cost_micros, 12_000 + 750);

        let rec = ledger.get("dup").unwrap();
        assert_eq!(rec.model, "second");
        assert_eq!(rec.input_tokens, 100);
        assert_eq!(rec.output_tokens, 50);
        assert_eq!(ledger.record_count(), 1);
    }

    #[test]
    fn test_evict_older_than_keeps_aggregates() {
        let ledger = ledger();
        ledger.record("old", 1000, 0, "m").unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        let removed = ledger.evict_older_than(cutoff);
        assert_eq!(removed, 1);
        assert!(ledger.get("old").is_none());
        assert_eq!(ledger.summary().total_requests, 1);
        assert_eq!(ledger.aggregate().total_cost_micros, 3000);
    }

    #[test]
    fn test_evict_keeps_recent_records() {
        let ledger = ledger();
        ledger.record("fresh", 1, 1, "m").unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(ledger.evict_older_than(cutoff), 0);
        assert!(ledger.get("fresh").is_some());
    }

    #[test]
    fn test_audit_sink_receives_records() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ledger = ledger().with_audit_sink(tx);

        ledger.record("r1", 10, 20, "m").unwrap();
        let _ = ledger.record("bad", -1, 0, "m");

        let rec = rx.try_recv().unwrap();
        assert_eq!(rec.request_id, "r1");
        assert!(rx.try_recv().is_err(), "rejected calls must not be audited");
    }

    #[test]
    fn test_closed_audit_sink_does_not_fail_record() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ledger = ledger().with_audit_sink(tx);
        assert!(ledger.record("r1", 10, 20, "m").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_records_lose_no_updates() {
        let ledger = Arc::new(ledger());
        let single = ledger.rates().input_cost_micros(100) + ledger.rates().output_cost_micros(50);

        let mut handles = Vec::new();
        for i in 0..100 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.record(&format!("req-{i}"), 100, 50, "m").unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let agg = ledger.aggregate();
        assert_eq!(agg.request_count, 100);
        assert_eq!(agg.total_cost_micros, 100 * single);
        assert_eq!(agg.total_input_tokens, 10_000);
        assert_eq!(agg.total_output_tokens, 5_000);
        assert_eq!(ledger.summary().total_cost_usd, 0.075);
    }

    #[test]
    fn test_concurrent_threads_lose_no_updates() {
        let ledger = Arc::new(ledger());
        std::thread::scope(|s| {
            for t in 0..8 {
                let ledger = &ledger;
                s.spawn(move || {
                    for i in 0..250 {
                        ledger.record(&format!("t{t}-{i}"), 100, 50, "m").unwrap();
                    }
                });
            }
        });

        let agg = ledger.aggregate();
        assert_eq!(agg.request_count, 2000);
        assert_eq!(agg.total_cost_micros, 2000 * 750);
        assert_eq!(ledger.record_count(), 2000);
    }
}
