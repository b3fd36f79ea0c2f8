//! Periodic drain of due retry entries back through [`process_one`]. Runs on a
//! fixed-delay `tokio::time::interval` rather than a cron-style scheduler,
//! matching the "a periodic task, not a framework job" guidance for this
//! codebase's background work.

use chrono::Utc;
use order_processor::{process_one, Deps};
use retry_queue::RetryQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

pub async fn run(deps: Arc<Deps>, fixed_delay: Duration) {
    let mut ticker = tokio::time::interval(fixed_delay);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        tick(&deps).await;
    }
}

async fn tick(deps: &Arc<Deps>) {
    let due = match deps.retry_queue.due(Utc::now()).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(error = %e, "failed to list due retry entries");
            return;
        }
    };

    if due.is_empty() {
        return;
    }

    tracing::info!(count = due.len(), "draining due retry entries");

    for entry in due {
        let order_id = entry.order_id.clone();
        let span = tracing::info_span!("retry_tick", order_id = %order_id);
        // A failure here is recorded by process_one itself; the scheduler must
        // keep going regardless so one bad candidate never stalls the tick.
        process_one(deps, entry.original_message).instrument(span).await;
    }
}
