//! Subscribes to the `orders` subject and feeds each message through
//! [`process_one`], bounded to a configurable number of concurrently in-flight
//! messages. Mirrors the `tokio::spawn` + `while let Some(msg) = stream.next()`
//! shape this codebase's payment-succeeded consumer uses, generalized from one
//! hardcoded subject to a configured one.

use event_bus::EventBus;
use futures::StreamExt;
use order_processor::{parse_order_message, process_one, publish_dead_letter, Deps};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::Instrument;

pub async fn run(bus: Arc<dyn EventBus>, subject: String, concurrency: usize, deps: Arc<Deps>) {
    tracing::info!(subject, concurrency, "starting order consumer");

    let mut stream = match bus.subscribe(&subject).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(subject, error = %e, "failed to subscribe to orders subject");
            return;
        }
    };

    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(msg) = stream.next().await {
        let deps = deps.clone();
        let permits = permits.clone();
        let subject = msg.subject.clone();

        let permit = match permits.acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        tokio::spawn(
            async move {
                let _permit = permit;
                match parse_order_message(&msg.payload) {
                    Ok(message) => {
                        let order_id = message.order_id.clone();
                        let span = tracing::info_span!("process_order", order_id = %order_id, subject = %subject);
                        process_one(&deps, message).instrument(span).await;
                    }
                    Err(reason) => {
                        tracing::warn!(subject, error = %reason, "malformed order message");
                        let synthetic_id = format!("malformed:{}", uuid::Uuid::new_v4());
                        let raw = serde_json::from_slice(&msg.payload)
                            .unwrap_or(serde_json::Value::Null);
                        match deps.malformed_queue.record(&synthetic_id, &raw, "malformed").await {
                            Ok(retry_queue::RecordOutcome::DeadLettered { .. }) => {
                                publish_dead_letter(&deps, &synthetic_id, msg.payload).await;
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "failed to record malformed message"),
                        }
                    }
                }
            }
            .in_current_span(),
        );
    }

    tracing::warn!(subject, "order consumer stream ended");
}
