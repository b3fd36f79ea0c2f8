//! Shared processing path for the consumer (C6) and the retry scheduler (C7).
//! Both feed a parsed [`OrderMessage`] through the same lock + enrich +
//! record-or-clear discipline so the two paths can never drift apart.

pub mod config;

use catalog_client::CatalogClient;
use enricher::{enrich, EnrichError, OrderMessage};
use event_bus::EventBus;
use lock_service::{LockError, LockService};
use order_store::OrderStore;
use retry_queue::RetryQueue;
use std::sync::Arc;

/// Unifies the two failure sources `process_one` can hit under the lock
/// (acquisition itself, and the enrichment it guards) into one error it can
/// propagate with `?` before deciding how to record the failure.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("{0}")]
    Lock(#[from] LockError),
    #[error("{0}")]
    Enrich(#[from] EnrichError),
}

pub struct Deps {
    pub catalog: Arc<CatalogClient>,
    pub store: Arc<dyn OrderStore>,
    pub lock: Arc<LockService>,
    pub retry_queue: Arc<dyn RetryQueue<OrderMessage>>,
    /// Separate retry-queue instance keyed by a synthetic id, used only for the
    /// consumer's malformed-message path: a payload that doesn't parse into
    /// [`OrderMessage`] has no `orderId` to key the typed queue on.
    pub malformed_queue: Arc<dyn RetryQueue<serde_json::Value>>,
    pub bus: Arc<dyn EventBus>,
    pub dlq_subject: String,
}

/// Publishes an exhausted message onto the dead-letter subject. Best-effort: a
/// publish failure is logged but never turns a dead-lettered entry back into a
/// retryable one, since the retry queue's own dead-letter record is already the
/// durable copy.
pub async fn publish_dead_letter(deps: &Deps, order_id: &str, payload: Vec<u8>) {
    if let Err(e) = deps.bus.publish(&deps.dlq_subject, payload).await {
        tracing::error!(order_id, subject = %deps.dlq_subject, error = %e, "failed to publish dead letter");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Processed,
    Recorded,
    DeadLettered,
}

/// Runs one order through lock -> enrich -> save, then records or clears the
/// retry-queue entry for its `orderId`. Never returns an error: every failure
/// is terminal for this attempt and is captured in the retry queue instead,
/// since the caller always acks regardless of outcome.
pub async fn process_one(deps: &Deps, message: OrderMessage) -> ProcessingOutcome {
    let order_id = message.order_id.clone();

    match try_process(deps, &message).await {
        Ok(order) => {
            tracing::info!(order_id = %order.order_id, "order processed");
            if let Err(e) = deps.retry_queue.clear(&order_id).await {
                tracing::warn!(order_id, error = %e, "failed to clear retry entry after success");
            }
            ProcessingOutcome::Processed
        }
        Err(err) => {
            tracing::warn!(order_id, error = %err, "attempt failed, recording for retry");
            record_failure(deps, &order_id, &message, &err.to_string()).await
        }
    }
}

async fn try_process(
    deps: &Deps,
    message: &OrderMessage,
) -> Result<order_store::EnrichedOrder, ConsumerError> {
    let result = deps
        .lock
        .with_lock(&message.order_id, || {
            let catalog = deps.catalog.clone();
            let store = deps.store.clone();
            let message = message.clone();
            async move { enrich(&catalog, store.as_ref(), &message).await }
        })
        .await?;

    Ok(result?)
}

async fn record_failure(
    deps: &Deps,
    order_id: &str,
    message: &OrderMessage,
    error: &str,
) -> ProcessingOutcome {
    match deps.retry_queue.record(order_id, message, error).await {
        Ok(retry_queue::RecordOutcome::Retried { attempt_count, next_retry_at }) => {
            tracing::info!(order_id, attempt_count, %next_retry_at, "recorded for retry");
            ProcessingOutcome::Recorded
        }
        Ok(retry_queue::RecordOutcome::DeadLettered { attempt_count }) => {
            tracing::error!(order_id, attempt_count, "exhausted retries, dead-lettered");
            let payload = serde_json::to_vec(message).unwrap_or_default();
            publish_dead_letter(deps, order_id, payload).await;
            ProcessingOutcome::DeadLettered
        }
        Err(e) => {
            tracing::error!(order_id, error = %e, "failed to record retry entry");
            ProcessingOutcome::Recorded
        }
    }
}

/// Parses a raw message payload into an [`OrderMessage`], rejecting shapes the
/// enricher must never see (blank ids, empty product list, non-positive
/// quantity).
pub fn parse_order_message(payload: &[u8]) -> Result<OrderMessage, String> {
    let message: OrderMessage =
        serde_json::from_slice(payload).map_err(|e| format!("malformed order message: {e}"))?;
    message.validate_shape()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_client::{CacheConfig, CatalogConfig};
    use enricher::ProductLine;
    use event_bus::InMemoryBus;
    use futures::StreamExt;
    use lock_service::fake::InMemoryLockBackend;
    use order_store::fake::InMemoryOrderStore;
    use retry_queue::fake::InMemoryRetryQueue;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn deps(server_uri: String) -> Deps {
        let config = CatalogConfig {
            base_url: server_uri,
            cache: CacheConfig::default(),
            ..CatalogConfig::from_env()
        };
        Deps {
            catalog: Arc::new(CatalogClient::new(config)),
            store: Arc::new(InMemoryOrderStore::new()),
            lock: Arc::new(LockService::new(
                Arc::new(InMemoryLockBackend::new()),
                lock_service::LockConfig::default(),
            )),
            retry_queue: Arc::new(InMemoryRetryQueue::new(retry_queue::RetryConfig::default())),
            malformed_queue: Arc::new(InMemoryRetryQueue::new(retry_queue::RetryConfig::default())),
            bus: Arc::new(InMemoryBus::new()),
            dlq_subject: "orders-dlq".to_string(),
        }
    }

    fn message() -> OrderMessage {
        OrderMessage {
            order_id: "order-1".into(),
            customer_id: "customer-1".into(),
            products: vec![ProductLine {
                product_id: "p-1".into(),
                quantity: 2,
            }],
        }
    }

    #[tokio::test]
    async fn successful_processing_clears_any_retry_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/customer-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "customerId": "customer-1", "name": "John Doe", "status": "ACTIVE"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/products/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "productId": "p-1", "name": "Laptop", "description": "", "price": "10.00", "inStock": true
            })))
            .mount(&server)
            .await;

        let deps = deps(server.uri()).await;
        let outcome = process_one(&deps, message()).await;
        assert_eq!(outcome, ProcessingOutcome::Processed);
        assert!(deps.store.exists("order-1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_enrichment_records_to_retry_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/customer-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "customerId": "customer-1", "name": "John Doe", "status": "INACTIVE"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/products/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "productId": "p-1", "name": "Laptop", "description": "", "price": "10.00", "inStock": true
            })))
            .mount(&server)
            .await;

        let deps = deps(server.uri()).await;
        let outcome = process_one(&deps, message()).await;
        assert_eq!(outcome, ProcessingOutcome::Recorded);
        assert_eq!(deps.retry_queue.attempt_count("order-1").await.unwrap(), 1);
        assert!(!deps.store.exists("order-1").await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_retries_are_published_to_the_dlq_subject() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/customer-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "customerId": "customer-1", "name": "John Doe", "status": "INACTIVE"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/products/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "productId": "p-1", "name": "Laptop", "description": "", "price": "10.00", "inStock": true
            })))
            .mount(&server)
            .await;

        let mut deps = deps(server.uri()).await;
        deps.retry_queue = Arc::new(InMemoryRetryQueue::new(retry_queue::RetryConfig {
            max_attempts: 1,
            ..retry_queue::RetryConfig::default()
        }));
        let mut dlq = deps.bus.subscribe(&deps.dlq_subject).await.unwrap();

        let outcome = process_one(&deps, message()).await;
        assert_eq!(outcome, ProcessingOutcome::DeadLettered);

        let published = dlq.next().await.expect("dead letter published");
        let decoded: OrderMessage = serde_json::from_slice(&published.payload).unwrap();
        assert_eq!(decoded.order_id, "order-1");
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(parse_order_message(b"not json").is_err());
        assert!(parse_order_message(br#"{"orderId":"","customerId":"c","products":[]}"#).is_err());
    }
}
