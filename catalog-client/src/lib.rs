//! # Catalog Client
//!
//! HTTP client for the customer/product catalog API. Wraps each call with a
//! read-through cache, a per-endpoint circuit breaker, and bounded retry with
//! exponential backoff, in that order: the cache is consulted first (a hit never
//! touches the breaker's call accounting), then the breaker decides whether to
//! admit the call, then retry governs how many HTTP attempts are made.
//!
//! ```text
//! cache.get_or_fetch(key, || breaker.call(|| retry.call(|| http.get(...))))
//! ```

pub mod circuit_breaker;
pub mod retry;

use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitCallError};
use moka::future::Cache;
use prometheus::{IntCounterVec, Opts};
use retry::{retry_with_backoff, RetryConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Total catalog HTTP call attempts, one increment per attempt (so a retried
/// call counts more than once), labeled by endpoint and outcome. Registered
/// into the process's default registry, the same one `order-processor`'s
/// `/metrics` route gathers from.
fn catalog_calls_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "catalog_client_calls_total",
                "Total catalog HTTP call attempts, including retries",
            ),
            &["endpoint", "outcome"],
        )
        .expect("catalog_client_calls_total metric");
        prometheus::register(Box::new(counter.clone()))
            .expect("register catalog_client_calls_total");
        counter
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub customer_id: String,
    pub name: String,
    pub status: String,
}

impl Customer {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
}

fn default_in_stock() -> bool {
    true
}

impl Product {
    /// A product is usable in an order when it has a name, a positive price, and
    /// is in stock.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && self.price > Decimal::ZERO && self.in_stock
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("catalog upstream error: {0}")]
    Upstream(String),
    #[error("catalog circuit breaker open for {0}")]
    Unavailable(&'static str),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub customer_ttl: Duration,
    pub product_ttl: Duration,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            customer_ttl: Duration::from_secs(15 * 60),
            product_ttl: Duration::from_secs(30 * 60),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    pub call_timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
}

impl CatalogConfig {
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("CATALOG_BASE_URL").unwrap_or_else(|_| "http://localhost:8090".into());
        let call_timeout_ms: u64 = std::env::var("CATALOG_CALL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);
        let max_attempts: u32 = std::env::var("CATALOG_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        let failure_rate_threshold: f64 = std::env::var("CATALOG_BREAKER_FAILURE_RATE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.5);

        Self {
            base_url,
            call_timeout: Duration::from_millis(call_timeout_ms),
            retry: RetryConfig {
                max_attempts,
                ..RetryConfig::default()
            },
            breaker: CircuitBreakerConfig {
                failure_rate_threshold,
                ..CircuitBreakerConfig::default()
            },
            cache: CacheConfig::default(),
        }
    }
}

pub struct CatalogClient {
    http: reqwest::Client,
    config: CatalogConfig,
    /// Separate per-kind caches so each can carry its own TTL — one `moka`
    /// cache can only express a single `time_to_live`, and customers and
    /// products expire on different schedules.
    customer_cache: Cache<String, Customer>,
    product_cache: Cache<String, Product>,
    customer_breaker: Arc<CircuitBreaker>,
    product_breaker: Arc<CircuitBreaker>,
}

impl CatalogClient {
    pub fn new(config: CatalogConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .expect("failed to build catalog HTTP client");

        let customer_cache = Cache::builder()
            .max_capacity(config.cache.max_entries)
            .time_to_live(config.cache.customer_ttl)
            .build();
        let product_cache = Cache::builder()
            .max_capacity(config.cache.max_entries)
            .time_to_live(config.cache.product_ttl)
            .build();

        Self {
            http,
            customer_breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            product_breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            customer_cache,
            product_cache,
            config,
        }
    }

    pub async fn get_customer(&self, customer_id: &str) -> Result<Customer, CatalogError> {
        if let Some(c) = self.customer_cache.get(customer_id).await {
            tracing::debug!(customer_id, "catalog cache hit for customer");
            return Ok(c);
        }

        let id = customer_id.to_string();
        let customer = self
            .fetch_through_breaker(&self.customer_breaker, "customer", move |http, base| {
                let id = id.clone();
                Box::pin(async move { fetch_customer(http, base, &id).await })
            })
            .await?;

        self.customer_cache
            .insert(customer_id.to_string(), customer.clone())
            .await;
        Ok(customer)
    }

    pub async fn get_product(&self, product_id: &str) -> Result<Product, CatalogError> {
        if let Some(p) = self.product_cache.get(product_id).await {
            tracing::debug!(product_id, "catalog cache hit for product");
            return Ok(p);
        }

        let id = product_id.to_string();
        let product = self
            .fetch_through_breaker(&self.product_breaker, "product", move |http, base| {
                let id = id.clone();
                Box::pin(async move { fetch_product(http, base, &id).await })
            })
            .await?;

        self.product_cache
            .insert(product_id.to_string(), product.clone())
            .await;
        Ok(product)
    }

    async fn fetch_through_breaker<T, F>(
        &self,
        breaker: &CircuitBreaker,
        endpoint: &'static str,
        make_call: F,
    ) -> Result<T, CatalogError>
    where
        F: for<'a> Fn(
            &'a reqwest::Client,
            &'a str,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, CatalogError>> + Send + 'a>>,
    {
        let result = breaker
            .call(|| {
                retry_with_backoff(
                    || {
                        let call = make_call(&self.http, &self.config.base_url);
                        async move {
                            let outcome = call.await;
                            catalog_calls_total()
                                .with_label_values(&[
                                    endpoint,
                                    if outcome.is_ok() { "ok" } else { "err" },
                                ])
                                .inc();
                            outcome
                        }
                    },
                    &self.config.retry,
                    |e: &CatalogError| matches!(e, CatalogError::Upstream(_)),
                    endpoint,
                )
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitCallError::Open) => Err(CatalogError::Unavailable(endpoint)),
            Err(CircuitCallError::Inner(e)) => Err(e),
        }
    }
}

async fn fetch_customer(
    http: &reqwest::Client,
    base_url: &str,
    customer_id: &str,
) -> Result<Customer, CatalogError> {
    let url = format!("{base_url}/v1/customers/{customer_id}");
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| CatalogError::Upstream(e.to_string()))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(CatalogError::NotFound {
            entity: "customer",
            id: customer_id.to_string(),
        });
    }
    if !response.status().is_success() {
        return Err(CatalogError::Upstream(format!(
            "customer lookup returned {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| CatalogError::Upstream(e.to_string()))
}

async fn fetch_product(
    http: &reqwest::Client,
    base_url: &str,
    product_id: &str,
) -> Result<Product, CatalogError> {
    let url = format!("{base_url}/v1/products/{product_id}");
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| CatalogError::Upstream(e.to_string()))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(CatalogError::NotFound {
            entity: "product",
            id: product_id.to_string(),
        });
    }
    if !response.status().is_success() {
        return Err(CatalogError::Upstream(format!(
            "product lookup returned {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| CatalogError::Upstream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> CatalogConfig {
        CatalogConfig {
            base_url,
            call_timeout: Duration::from_secs(2),
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(10),
                multiplier: 2.0,
                jitter: 0.0,
            },
            breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    #[tokio::test]
    async fn get_customer_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/customer-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "customerId": "customer-1",
                "name": "John Doe",
                "status": "ACTIVE"
            })))
            .mount(&server)
            .await;

        let client = CatalogClient::new(test_config(server.uri()));
        let customer = client.get_customer("customer-1").await.unwrap();
        assert_eq!(customer.name, "John Doe");
        assert!(customer.is_active());
    }

    #[tokio::test]
    async fn get_product_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/products/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = CatalogClient::new(test_config(server.uri()));
        let result = client.get_product("missing").await;
        assert!(matches!(result, Err(CatalogError::NotFound { .. })));
    }

    #[tokio::test]
    async fn transient_failure_then_success_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/products/p-1"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/products/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "productId": "p-1",
                "name": "Laptop",
                "description": "A laptop",
                "price": "999.00",
                "inStock": true
            })))
            .mount(&server)
            .await;

        let client = CatalogClient::new(test_config(server.uri()));
        let product = client.get_product("p-1").await.unwrap();
        assert_eq!(product.name, "Laptop");

        let before = catalog_calls_total()
            .with_label_values(&["product", "err"])
            .get();
        assert!(before >= 1, "failed attempt should be observable on the counter");
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/customer-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "customerId": "customer-1",
                "name": "John Doe",
                "status": "ACTIVE"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = CatalogClient::new(test_config(server.uri()));
        client.get_customer("customer-1").await.unwrap();
        client.get_customer("customer-1").await.unwrap();
    }

    #[test]
    fn product_validity() {
        let valid = Product {
            product_id: "p".into(),
            name: "Widget".into(),
            description: "".into(),
            price: Decimal::new(100, 2),
            category: None,
            in_stock: true,
        };
        assert!(valid.is_valid());

        let out_of_stock = Product {
            in_stock: false,
            ..valid.clone()
        };
        assert!(!out_of_stock.is_valid());

        let free = Product {
            price: Decimal::ZERO,
            ..valid
        };
        assert!(!free.is_valid());
    }
}
