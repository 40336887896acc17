use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::BookingStatus;

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Background task that settles bookings whose scheduled end has passed:
/// confirmed → finished, pending → expired. Selection is level-triggered on
/// status, so a tick that overruns the cadence re-selects nothing it already
/// settled.
pub async fn run_sweep(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = wall_clock_ms();
        for (booking_id, status) in engine.collect_due_bookings(now) {
            let (result, outcome) = match status {
                BookingStatus::Confirmed => {
                    (engine.finish_booking(booking_id, now).await, "finished")
                }
                BookingStatus::Pending => (engine.expire_booking(booking_id).await, "expired"),
                _ => continue,
            };
            match result {
                Ok(()) => {
                    info!("swept booking {booking_id} → {outcome}");
                    metrics::counter!(
                        crate::observability::SWEEP_TRANSITIONS_TOTAL,
                        "outcome" => outcome
                    )
                    .increment(1);
                }
                Err(e) => {
                    // Settled or cancelled since the scan — that's fine
                    tracing::debug!("sweep skip {booking_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_backlog().await >= threshold {
            match engine.compact().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
