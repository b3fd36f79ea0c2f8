//! In-memory [`OrderStore`] for unit tests, mirroring `event_bus::InMemoryBus` as
//! the test-only sibling of the production backend.

use crate::{EnrichedOrder, OrderStatus, OrderStore, Page, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: Mutex<HashMap<String, EnrichedOrder>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn exists(&self, order_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .orders
            .lock()
            .expect("in-memory order store poisoned")
            .contains_key(order_id))
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<EnrichedOrder>, StoreError> {
        Ok(self
            .orders
            .lock()
            .expect("in-memory order store poisoned")
            .get(order_id)
            .cloned())
    }

    async fn save(&self, order: EnrichedOrder) -> Result<EnrichedOrder, StoreError> {
        let mut orders = self.orders.lock().expect("in-memory order store poisoned");
        if let Some(existing) = orders.get(&order.order_id) {
            return Ok(existing.clone());
        }
        orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn find_by_customer_id(
        &self,
        customer_id: &str,
        page: Page,
    ) -> Result<Vec<EnrichedOrder>, StoreError> {
        let orders = self.orders.lock().expect("in-memory order store poisoned");
        let mut matches: Vec<EnrichedOrder> = orders
            .values()
            .filter(|o| o.customer_id == customer_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(paginate(matches, page))
    }

    async fn find_by_status(
        &self,
        status: OrderStatus,
        page: Page,
    ) -> Result<Vec<EnrichedOrder>, StoreError> {
        let orders = self.orders.lock().expect("in-memory order store poisoned");
        let mut matches: Vec<EnrichedOrder> = orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(paginate(matches, page))
    }
}

fn paginate(items: Vec<EnrichedOrder>, page: Page) -> Vec<EnrichedOrder> {
    let offset = page.offset.max(0) as usize;
    let limit = page.limit.max(0) as usize;
    items.into_iter().skip(offset).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn order(order_id: &str) -> EnrichedOrder {
        EnrichedOrder {
            order_id: order_id.to_string(),
            customer_id: "customer-1".to_string(),
            customer_name: "John Doe".to_string(),
            customer_status: "ACTIVE".to_string(),
            products: vec![],
            total_amount: Decimal::ZERO,
            processed_at: Utc::now(),
            status: OrderStatus::Processed,
        }
    }

    #[tokio::test]
    async fn save_is_idempotent() {
        let store = InMemoryOrderStore::new();
        let first = store.save(order("order-1")).await.unwrap();
        let second = store.save(order("order-1")).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(
            store
                .find_by_status(OrderStatus::Processed, Page::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn exists_reflects_saved_orders() {
        let store = InMemoryOrderStore::new();
        assert!(!store.exists("order-1").await.unwrap());
        store.save(order("order-1")).await.unwrap();
        assert!(store.exists("order-1").await.unwrap());
    }
}
