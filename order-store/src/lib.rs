//! # Order Store
//!
//! Idempotent persistence of [`EnrichedOrder`] records, keyed by `order_id`. The
//! production implementation ([`PgOrderStore`]) is backed by Postgres; [`fake`]
//! provides an in-memory sibling for unit tests, the same pairing `event-bus`
//! establishes between `NatsBus` and `InMemoryBus`.

pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Processed,
    Failed,
    Retry,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Retry => "RETRY",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSED" => Ok(OrderStatus::Processed),
            "FAILED" => Ok(OrderStatus::Failed),
            "RETRY" => Ok(OrderStatus::Retry),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedProduct {
    pub product_id: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub quantity: i32,
    pub subtotal: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedOrder {
    pub order_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_status: String,
    pub products: Vec<EnrichedProduct>,
    pub total_amount: Decimal,
    pub processed_at: DateTime<Utc>,
    pub status: OrderStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("order {0} already exists")]
    Duplicate(String),
    #[error("order store error: {0}")]
    Backend(String),
}

/// A page of results for the indexed listing reads.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn exists(&self, order_id: &str) -> Result<bool, StoreError>;
    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<EnrichedOrder>, StoreError>;
    /// Idempotent at `order_id` granularity: a unique-constraint collision is
    /// recovered as [`StoreError::Duplicate`], never a partial write.
    async fn save(&self, order: EnrichedOrder) -> Result<EnrichedOrder, StoreError>;
    async fn find_by_customer_id(
        &self,
        customer_id: &str,
        page: Page,
    ) -> Result<Vec<EnrichedOrder>, StoreError>;
    async fn find_by_status(
        &self,
        status: OrderStatus,
        page: Page,
    ) -> Result<Vec<EnrichedOrder>, StoreError>;
}

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./db/migrations").run(&self.pool).await
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    order_id: String,
    customer_id: String,
    customer_name: String,
    customer_status: String,
    products: serde_json::Value,
    total_amount: Decimal,
    processed_at: DateTime<Utc>,
    status: String,
}

impl TryFrom<OrderRow> for EnrichedOrder {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let products: Vec<EnrichedProduct> = serde_json::from_value(row.products)
            .map_err(|e| StoreError::Backend(format!("corrupt products column: {e}")))?;
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Backend(format!("corrupt status column: {e}")))?;
        Ok(EnrichedOrder {
            order_id: row.order_id,
            customer_id: row.customer_id,
            customer_name: row.customer_name,
            customer_status: row.customer_status,
            products,
            total_amount: row.total_amount,
            processed_at: row.processed_at,
            status,
        })
    }
}

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn exists(&self, order_id: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM orders WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<EnrichedOrder>, StoreError> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            SELECT order_id, customer_id, customer_name, customer_status, products,
                   total_amount, processed_at, status
            FROM orders WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        row.map(EnrichedOrder::try_from).transpose()
    }

    async fn save(&self, order: EnrichedOrder) -> Result<EnrichedOrder, StoreError> {
        let products_json = serde_json::to_value(&order.products)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO orders
                (order_id, customer_id, customer_name, customer_status, products,
                 total_amount, processed_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.customer_id)
        .bind(&order.customer_name)
        .bind(&order.customer_status)
        .bind(products_json)
        .bind(order.total_amount)
        .bind(order.processed_at)
        .bind(order.status.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::info!(order_id = %order.order_id, "order persisted");
                Ok(order)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                tracing::info!(order_id = %order.order_id, "duplicate save recovered as idempotent");
                self.find_by_order_id(&order.order_id)
                    .await?
                    .ok_or_else(|| StoreError::Duplicate(order.order_id.clone()))
            }
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn find_by_customer_id(
        &self,
        customer_id: &str,
        page: Page,
    ) -> Result<Vec<EnrichedOrder>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT order_id, customer_id, customer_name, customer_status, products,
                   total_amount, processed_at, status
            FROM orders
            WHERE customer_id = $1
            ORDER BY processed_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(customer_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.into_iter().map(EnrichedOrder::try_from).collect()
    }

    async fn find_by_status(
        &self,
        status: OrderStatus,
        page: Page,
    ) -> Result<Vec<EnrichedOrder>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT order_id, customer_id, customer_name, customer_status, products,
                   total_amount, processed_at, status
            FROM orders
            WHERE status = $1
            ORDER BY processed_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.as_str())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.into_iter().map(EnrichedOrder::try_from).collect()
    }
}
