use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::ledger::UsageLedger;

/// Spawn a background task that periodically evicts usage records older
/// than `window`. Aggregate counters are never touched.
///
/// The task runs until the returned handle is aborted.
pub fn spawn_retention_sweeper(
    ledger: Arc<UsageLedger>,
    window: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let removed = sweep_once(&ledger, window);
            if removed > 0 {
                tracing::debug!(evicted = removed, "Usage record retention sweep");
            }
        }
    })
}

fn sweep_once(ledger: &UsageLedger, window: Duration) -> usize {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return 0;
    };
    match Utc::now().checked_sub_signed(window) {
        Some(cutoff) => ledger.evict_older_than(cutoff),
        None => 0,
    }
}
