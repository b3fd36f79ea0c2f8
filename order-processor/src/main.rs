mod consumer;
mod http;
mod scheduler;

use catalog_client::CatalogClient;
use event_bus::{EventBus, InMemoryBus, NatsBus};
use lock_service::{LockService, RedisLockBackend};
use order_processor::config::Config;
use order_processor::Deps;
use order_store::PgOrderStore;
use redis::Client as RedisClient;
use retry_queue::RedisRetryQueue;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    let order_store = PgOrderStore::new(db.clone());
    order_store
        .run_migrations()
        .await
        .expect("failed to run order-store migrations");
    tracing::info!("order-store migrations applied");

    let redis_client =
        RedisClient::open(config.redis_url.clone()).expect("invalid REDIS_URL");

    let lock_backend = Arc::new(RedisLockBackend::new(redis_client.clone()));
    let lock_service = Arc::new(LockService::new(lock_backend, config.lock));

    let retry_queue = Arc::new(RedisRetryQueue::<enricher::OrderMessage>::new(
        redis_client.clone(),
        config.retry.clone(),
    ));
    let malformed_queue = Arc::new(RedisRetryQueue::<serde_json::Value>::new(
        redis_client.clone(),
        config.retry.clone(),
    ));

    let catalog_client = Arc::new(CatalogClient::new(config.catalog.clone()));

    let event_bus: Arc<dyn EventBus> = match config.bus_type.to_lowercase().as_str() {
        "nats" => {
            tracing::info!(nats_url = %config.nats_url, "connecting to NATS");
            let client = async_nats::connect(&config.nats_url)
                .await
                .expect("failed to connect to NATS");
            Arc::new(NatsBus::new(client))
        }
        _ => {
            tracing::info!("using in-memory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    let deps = Arc::new(Deps {
        catalog: catalog_client,
        store: Arc::new(order_store),
        lock: lock_service,
        retry_queue,
        malformed_queue,
        bus: event_bus.clone(),
        dlq_subject: config.orders_dlq_subject.clone(),
    });

    tokio::spawn(consumer::run(
        event_bus.clone(),
        config.orders_subject.clone(),
        config.consumer_concurrency,
        deps.clone(),
    ));

    tokio::spawn(scheduler::run(deps.clone(), config.scheduler_fixed_delay));

    let state = http::AppState {
        db,
        redis: Arc::new(redis_client),
    };
    let app = http::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    tracing::info!(addr, "order-processor listening");

    axum::serve(listener, app)
        .await
        .expect("http server failed");
}
