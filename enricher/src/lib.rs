//! # Enricher
//!
//! Turns an inbound [`OrderMessage`] into a persisted [`EnrichedOrder`] by joining
//! customer and product lookups through the catalog client, validating the result,
//! and saving it. This is the one place the pipeline's per-order business rules
//! live; the consumer and the retry scheduler both call [`enrich`] and otherwise
//! know nothing about catalog shapes or totaling.

use catalog_client::{CatalogClient, CatalogError};
use chrono::Utc;
use futures::future::try_join_all;
use order_store::{EnrichedOrder, EnrichedProduct, OrderStatus, OrderStore, StoreError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductLine {
    pub product_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderMessage {
    pub order_id: String,
    pub customer_id: String,
    pub products: Vec<ProductLine>,
}

impl OrderMessage {
    /// Rejects the shapes the parse layer must never hand to the enricher:
    /// blank ids, an empty product list, or a non-positive quantity.
    pub fn validate_shape(&self) -> Result<(), String> {
        if self.order_id.trim().is_empty() {
            return Err("orderId is blank".into());
        }
        if self.customer_id.trim().is_empty() {
            return Err("customerId is blank".into());
        }
        if self.products.is_empty() {
            return Err("products is empty".into());
        }
        for line in &self.products {
            if line.product_id.trim().is_empty() {
                return Err("productId is blank".into());
            }
            if line.quantity <= 0 {
                return Err(format!("quantity must be positive, got {}", line.quantity));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("catalog entity not found: {0}")]
    NotFound(CatalogErrorNotFound),
    #[error("catalog upstream error: {0}")]
    Upstream(String),
    #[error("catalog circuit breaker open for {0}")]
    Unavailable(&'static str),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("order store error: {0}")]
    Storage(String),
}

#[derive(Debug, thiserror::Error)]
#[error("{entity} {id} not found")]
pub struct CatalogErrorNotFound {
    pub entity: &'static str,
    pub id: String,
}

impl From<CatalogError> for EnrichError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound { entity, id } => {
                EnrichError::NotFound(CatalogErrorNotFound { entity, id })
            }
            CatalogError::Upstream(msg) => EnrichError::Upstream(msg),
            CatalogError::Unavailable(endpoint) => EnrichError::Unavailable(endpoint),
        }
    }
}

impl From<StoreError> for EnrichError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => {
                // Callers are expected to special-case `save`'s Duplicate before
                // this conversion runs; reaching here means a caller elsewhere
                // treated it as a hard failure, which is still a storage concern.
                EnrichError::Storage(format!("unexpected duplicate order {id}"))
            }
            StoreError::Backend(msg) => EnrichError::Storage(msg),
        }
    }
}

/// Enriches, validates, and persists one order. Idempotent: a message for an
/// `orderId` that already has a stored record returns that record unchanged.
pub async fn enrich(
    catalog: &CatalogClient,
    store: &dyn OrderStore,
    message: &OrderMessage,
) -> Result<EnrichedOrder, EnrichError> {
    if let Some(existing) = store.find_by_order_id(&message.order_id).await? {
        tracing::debug!(order_id = %message.order_id, "order already processed, short-circuiting");
        return Ok(existing);
    }

    let unique_product_ids: Vec<&str> = {
        let mut seen = std::collections::HashSet::new();
        message
            .products
            .iter()
            .map(|p| p.product_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    };

    let customer_fut = catalog.get_customer(&message.customer_id);
    let products_fut = try_join_all(
        unique_product_ids
            .iter()
            .map(|id| catalog.get_product(id)),
    );

    let (customer, products) = tokio::try_join!(
        async { customer_fut.await.map_err(EnrichError::from) },
        async { products_fut.await.map_err(EnrichError::from) },
    )?;

    if !customer.is_active() {
        return Err(EnrichError::InvalidOrder("customer not active".into()));
    }

    let catalog_products: HashMap<&str, _> = unique_product_ids
        .iter()
        .copied()
        .zip(products.iter())
        .collect();

    for product in &products {
        if !product.is_valid() {
            return Err(EnrichError::InvalidOrder("invalid product(s)".into()));
        }
    }

    let mut line_items = Vec::with_capacity(message.products.len());
    let mut total_amount = Decimal::ZERO;
    for line in &message.products {
        let product = catalog_products
            .get(line.product_id.as_str())
            .ok_or_else(|| EnrichError::InvalidOrder(format!("unknown product {}", line.product_id)))?;
        let subtotal = product.price * Decimal::from(line.quantity);
        total_amount += subtotal;
        line_items.push(EnrichedProduct {
            product_id: product.product_id.clone(),
            name: product.name.clone(),
            description: product.description.clone(),
            price: product.price,
            quantity: line.quantity,
            subtotal,
        });
    }

    let order = EnrichedOrder {
        order_id: message.order_id.clone(),
        customer_id: message.customer_id.clone(),
        customer_name: customer.name.clone(),
        customer_status: customer.status.clone(),
        products: line_items,
        total_amount,
        processed_at: Utc::now(),
        status: OrderStatus::Processed,
    };

    match store.save(order).await {
        Ok(saved) => Ok(saved),
        Err(StoreError::Duplicate(order_id)) => {
            tracing::info!(order_id, "concurrent save raced; returning stored record");
            store
                .find_by_order_id(&order_id)
                .await?
                .ok_or_else(|| EnrichError::Storage(format!("duplicate order {order_id} vanished")))
        }
        Err(e) => Err(e.into()),
    }
}
