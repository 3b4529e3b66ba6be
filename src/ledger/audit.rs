use std::time::Duration;

use chrono::SecondsFormat;
use rusqlite::params;
use tokio::sync::mpsc;

use crate::db::Database;
use crate::ledger::UsageRecord;

/// Maximum number of records to buffer before flushing, regardless of timer.
const BATCH_SIZE: usize = 100;

/// How often to flush buffered records even if the batch is not full.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a background task that reads `UsageRecord` values from the channel
/// and batch-writes them to the `usage_log` table.
///
/// The task exits once every sender is dropped and the remaining records
/// are flushed, so awaiting the handle gives a clean shutdown.
pub fn spawn_audit_logger(
    db: Database,
    mut rx: mpsc::UnboundedReceiver<UsageRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<UsageRecord> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                record = rx.recv() => {
                    match record {
                        Some(r) => {
                            buffer.push(r);
                            if buffer.len() >= BATCH_SIZE {
                                flush_batch(&db, &mut buffer);
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                flush_batch(&db, &mut buffer);
                            }
                            tracing::info!("Audit logger shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        flush_batch(&db, &mut buffer);
                    }
                }
            }
        }
    })
}

/// Write a batch of records in a single transaction. On failure the records
/// are kept in the buffer and retried on the next tick.
fn flush_batch(db: &Database, buffer: &mut Vec<UsageRecord>) {
    let records = std::mem::take(buffer);
    let count = records.len();

    if let Err(e) = write_records(db, &records) {
        tracing::error!(count, error = %e, "Failed to flush usage audit batch");
        buffer.extend(records);
    } else {
        tracing::debug!(count, "Flushed usage audit batch");
    }
}

fn write_records(db: &Database, records: &[UsageRecord]) -> Result<(), rusqlite::Error> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO usage_log (request_id, model, input_tokens, output_tokens, \
                 input_cost, output_cost, total_cost, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;

            for r in records {
                stmt.execute(params![
                    r.request_id,
                    r.model,
                    r.input_tokens as i64,
                    r.output_tokens as i64,
                    r.input_cost,
                    r.output_cost,
                    r.total_cost,
                    r.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                ])?;
            }
        }

        tx.commit()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_record(request_id: &str, total_cost: f64) -> UsageRecord {
        UsageRecord {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            input_tokens: 100,
            output_tokens: 50,
            input_cost: 0.0003,
            output_cost: 0.00045,
            total_cost,
            model: "test-model".to_string(),
        }
    }

    fn row_count(db: &Database) -> i64 {
        db.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM usage_log", [], |row| row.get(0)))
            .unwrap()
    }

    #[test]
    fn test_write_records_inserts_rows() {
        let db = Database::open_in_memory().unwrap();
        write_records(&db, &[make_record("r1", 0.00075)]).unwrap();
        assert_eq!(row_count(&db), 1);

        let (model, cost): (String, f64) = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT model, total_cost FROM usage_log WHERE request_id = 'r1'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(model, "test-model");
        assert!((cost - 0.00075).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicate_request_ids_kept_as_separate_events() {
        let db = Database::open_in_memory().unwrap();
        write_records(&db, &[make_record("dup", 0.1), make_record("dup", 0.2)]).unwrap();
        assert_eq!(row_count(&db), 2);
    }

    #[tokio::test]
    async fn test_spawn_audit_logger_flushes_on_close() {
        let db = Database::open_in_memory().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = spawn_audit_logger(db.clone(), rx);

        tx.send(make_record("a", 1.0)).unwrap();
        tx.send(make_record("b", 2.0)).unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(row_count(&db), 2);
    }

    #[tokio::test]
    async fn test_spawn_audit_logger_periodic_flush() {
        let db = Database::open_in_memory().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let _handle = spawn_audit_logger(db.clone(), rx);
        tx.send(make_record("a", 0.5)).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(row_count(&db), 1);

        drop(tx);
    }

    #[tokio::test]
    async fn test_spawn_audit_logger_full_batch() {
        let db = Database::open_in_memory().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_audit_logger(db.clone(), rx);

        for i in 0..(BATCH_SIZE * 2 + 3) {
            tx.send(make_record(&format!("r{i}"), 0.001)).unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(row_count(&db), (BATCH_SIZE * 2 + 3) as i64);
    }
}
