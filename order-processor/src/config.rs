use catalog_client::CatalogConfig;
use lock_service::LockConfig;
use retry_queue::RetryConfig;
use std::time::Duration;

fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub bus_type: String,
    pub nats_url: String,
    pub orders_subject: String,
    pub orders_dlq_subject: String,
    pub consumer_concurrency: usize,
    pub scheduler_fixed_delay: Duration,
    pub catalog: CatalogConfig,
    pub lock: LockConfig,
    pub retry: RetryConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8090u16),
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            bus_type: env_or("BUS_TYPE", "inmemory"),
            nats_url: env_or("NATS_URL", "nats://localhost:4222"),
            orders_subject: env_or("ORDERS_SUBJECT", "orders"),
            orders_dlq_subject: env_or("ORDERS_DLQ_SUBJECT", "orders-dlq"),
            consumer_concurrency: env_parse_or("CONSUMER_CONCURRENCY", 3usize),
            scheduler_fixed_delay: env_duration_ms("SCHEDULER_FIXED_DELAY_MS", 30_000),
            catalog: CatalogConfig::from_env(),
            lock: LockConfig {
                wait_time: env_duration_ms("LOCK_WAIT_TIME_MS", 10_000),
                lease_time: env_duration_ms("LOCK_LEASE_TIME_MS", 30_000),
                poll_interval: env_duration_ms("LOCK_POLL_INTERVAL_MS", 50),
            },
            retry: RetryConfig {
                initial_delay: env_duration_ms("RETRY_INITIAL_DELAY_MS", 1_000),
                multiplier: env_parse_or("RETRY_MULTIPLIER", 2.0f64),
                max_delay: env_duration_ms("RETRY_MAX_DELAY_MS", 5 * 60 * 1000),
                max_attempts: env_parse_or("RETRY_MAX_ATTEMPTS", 5u32),
            },
        }
    }
}
