//! Typed callers for the operations other services expose.

use rabbitrpc::{EventPublisher, Result, RpcClient};
use tracing::debug;

use crate::contracts::{
    OrderCreated, Product, ProductPatch, StockCheckRequest, StockCheckResponse,
    UpdateProductRequest, User, ORDER_CREATED, ORDER_EXCHANGE, PRODUCT_EXCHANGE, PRODUCT_GET,
    PRODUCT_UPDATE, STOCK_CHECK, USER_EXCHANGE, USER_GET,
};

/// Map a remote `not_found` to `None`
fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct ProductEvents {
    client: RpcClient,
}

impl ProductEvents {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    pub async fn get_product_by_id(&self, id: &str) -> Result<Option<Product>> {
        found(self.client.request(PRODUCT_GET, PRODUCT_EXCHANGE, &id).await)
    }

    pub async fn update_product(&self, id: &str, patch: ProductPatch) -> Result<Option<Product>> {
        let request = UpdateProductRequest {
            id: id.to_string(),
            update_product_dto: patch,
        };
        found(self.client.request(PRODUCT_UPDATE, PRODUCT_EXCHANGE, &request).await)
    }
}

#[derive(Debug, Clone)]
pub struct UserEvents {
    client: RpcClient,
}

impl UserEvents {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        found(self.client.request(USER_GET, USER_EXCHANGE, &id).await)
    }
}

#[derive(Debug, Clone)]
pub struct OrderEvents {
    client: RpcClient,
    publisher: EventPublisher,
}

impl OrderEvents {
    pub fn new(client: RpcClient, publisher: EventPublisher) -> Self {
        Self { client, publisher }
    }

    pub async fn check_stock(&self, product_id: &str, quantity: u32) -> Result<StockCheckResponse> {
        let request = StockCheckRequest {
            product_id: product_id.to_string(),
            quantity,
        };
        self.client.request(STOCK_CHECK, ORDER_EXCHANGE, &request).await
    }

    /// Fire-and-forget; a publish failure is returned but never retried
    pub async fn publish_order_created(&self, event: &OrderCreated) -> Result<()> {
        self.publisher
            .publish(ORDER_EXCHANGE, ORDER_CREATED, event)
            .await?;
        debug!("Published {} for order {}", ORDER_CREATED, event.order_id);
        Ok(())
    }
}
