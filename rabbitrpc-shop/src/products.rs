use chrono::Utc;
use dashmap::DashMap;
use rabbitrpc::{ExchangeRegistry, RabbitRpcError, Result, Service, SubscribeOptions};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::contracts::{
    NewProduct, OrderCreated, Product, ProductPatch, ProductStatus, UpdateProductRequest,
    ORDER_CREATED, ORDER_EXCHANGE, PRODUCT_EXCHANGE, PRODUCT_GET, PRODUCT_ORDER_CREATED_QUEUE,
    PRODUCT_UPDATE,
};
use crate::store::RepositoryPtr;

pub const SERVICE_NAME: &str = "product-service";

const MIN_DESCRIPTION_LEN: usize = 5;

/// Owns the product catalogue and serves `product.get` / `product.update`
pub struct ProductService {
    products: RepositoryPtr<Product>,
    /// order id -> (product id, quantity)
    sales: DashMap<String, (String, u32)>,
}

impl ProductService {
    pub fn new(products: RepositoryPtr<Product>) -> Self {
        Self {
            products,
            sales: DashMap::new(),
        }
    }

    /// Exchanges this service owns and consumes
    pub fn registry() -> Result<ExchangeRegistry> {
        ExchangeRegistry::builder()
            .owns(PRODUCT_EXCHANGE)
            .consumes(ORDER_EXCHANGE)
            .build()
    }

    /// Register the product RPC handlers and the `order.created` subscriber
    pub fn bind(self: &Arc<Self>, service: &mut Service) -> Result<()> {
        let get = self.clone();
        let update = self.clone();
        let ledger = self.clone();

        service
            .respond(PRODUCT_GET, PRODUCT_EXCHANGE, PRODUCT_GET, move |id: String| {
                let products = get.clone();
                async move { products.get_product_by_id(&id).await }
            })?
            .respond(PRODUCT_UPDATE, PRODUCT_EXCHANGE, PRODUCT_UPDATE, move |req: UpdateProductRequest| {
                let products = update.clone();
                async move { products.update_product(req).await }
            })?
            .subscribe_queue(
                ORDER_CREATED,
                ORDER_EXCHANGE,
                PRODUCT_ORDER_CREATED_QUEUE,
                SubscribeOptions::default(),
                move |event: OrderCreated| {
                    let products = ledger.clone();
                    async move {
                        products.record_sale(event);
                        Ok(())
                    }
                },
            )?;
        Ok(())
    }

    pub async fn create_product(&self, input: NewProduct) -> Result<Product> {
        if input.name.trim().is_empty() {
            return Err(RabbitRpcError::invalid("product name is required"));
        }
        if input.description.chars().count() < MIN_DESCRIPTION_LEN {
            return Err(RabbitRpcError::invalid(format!(
                "description must be at least {} characters",
                MIN_DESCRIPTION_LEN
            )));
        }
        if !input.price.is_finite() || input.price < 0.0 {
            return Err(RabbitRpcError::invalid("price must be a non-negative number"));
        }

        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            description: input.description,
            price: input.price,
            stock: input.stock,
            status: ProductStatus::for_stock(input.stock),
            created_at: now,
            updated_at: now,
        };

        let product = self.products.save(product).await?;
        info!("Created product: {} (ID: {})", product.name, product.id);
        Ok(product)
    }

    pub async fn get_all_products(&self) -> Result<Vec<Product>> {
        let mut products = self.products.find_all().await?;
        products.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(products)
    }

    pub async fn get_product_by_id(&self, id: &str) -> Result<Product> {
        debug!("Getting product with ID: {}", id);
        self.products
            .find_by_id(id)
            .await?
            .ok_or_else(|| RabbitRpcError::not_found(format!("Product with ID {} not found", id)))
    }

    /// Apply a patch. Setting the same fields twice yields the same product,
    /// so retrying an update is safe.
    pub async fn update_product(&self, req: UpdateProductRequest) -> Result<Product> {
        let UpdateProductRequest {
            id,
            update_product_dto: patch,
        } = req;
        if matches!(patch.price, Some(price) if !price.is_finite() || price < 0.0) {
            return Err(RabbitRpcError::invalid("price must be a non-negative number"));
        }

        info!("Updating product: {}", id);
        self.products
            .update_by_id(&id, Box::new(move |product: &mut Product| apply_patch(product, patch)))
            .await?
            .ok_or_else(|| RabbitRpcError::not_found(format!("Product with ID {} not found", id)))
    }

    pub async fn delete_product(&self, id: &str) -> Result<Product> {
        self.products
            .delete_by_id(id)
            .await?
            .ok_or_else(|| RabbitRpcError::not_found(format!("Product with ID {} not found", id)))
    }

    /// Record an `order.created` notification. Redelivery of the same order
    /// is ignored.
    pub fn record_sale(&self, event: OrderCreated) {
        let OrderCreated {
            order_id,
            product_id,
            quantity,
        } = event;
        match self.sales.entry(order_id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                debug!("Sale for order {} already recorded", entry.key());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!("Recorded sale of {} x {} (order {})", quantity, product_id, entry.key());
                entry.insert((product_id, quantity));
            }
        }
    }

    /// Units sold of `product_id` according to the sales ledger
    pub fn units_sold(&self, product_id: &str) -> u32 {
        self.sales
            .iter()
            .filter(|sale| sale.value().0 == product_id)
            .map(|sale| sale.value().1)
            .sum()
    }
}

fn apply_patch(product: &mut Product, patch: ProductPatch) {
    if let Some(name) = patch.name {
        product.name = name;
    }
    if let Some(description) = patch.description {
        product.description = description;
    }
    if let Some(price) = patch.price {
        product.price = price;
    }
    if let Some(stock) = patch.stock {
        product.stock = stock;
        product.status = ProductStatus::for_stock(stock);
    }
    if let Some(status) = patch.status {
        product.status = status;
    }
    product.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;

    fn service() -> ProductService {
        ProductService::new(MemoryRepository::shared())
    }

    fn widget(stock: u32) -> NewProduct {
        NewProduct {
            name: "Widget".to_string(),
            description: "A sturdy widget".to_string(),
            price: 9.5,
            stock,
        }
    }

    #[tokio::test]
    async fn test_create_validates_description() {
        let products = service();
        let err = products
            .create_product(NewProduct {
                description: "tiny".to_string(),
                ..widget(1)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[tokio::test]
    async fn test_update_is_idempotent_on_final_state() {
        let products = service();
        let created = products.create_product(widget(10)).await.unwrap();

        let request = UpdateProductRequest {
            id: created.id.clone(),
            update_product_dto: ProductPatch::stock(5),
        };
        let first = products.update_product(request.clone()).await.unwrap();
        let second = products.update_product(request).await.unwrap();

        assert_eq!(first.stock, 5);
        assert_eq!(second.stock, 5);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn test_stock_drives_status() {
        let products = service();
        let created = products.create_product(widget(1)).await.unwrap();
        assert_eq!(created.status, ProductStatus::InStock);

        let sold_out = products
            .update_product(UpdateProductRequest {
                id: created.id,
                update_product_dto: ProductPatch::stock(0),
            })
            .await
            .unwrap();
        assert_eq!(sold_out.status, ProductStatus::OutOfStock);
    }

    #[tokio::test]
    async fn test_missing_product_is_not_found() {
        let products = service();
        assert_eq!(products.get_product_by_id("nope").await.unwrap_err().kind(), "not_found");
        assert_eq!(products.delete_product("nope").await.unwrap_err().kind(), "not_found");
        let err = products
            .update_product(UpdateProductRequest {
                id: "nope".to_string(),
                update_product_dto: ProductPatch::stock(1),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_sales_ledger_ignores_redelivery() {
        let products = service();
        let event = OrderCreated {
            order_id: "o1".to_string(),
            product_id: "p1".to_string(),
            quantity: 2,
        };
        products.record_sale(event.clone());
        products.record_sale(event);
        assert_eq!(products.units_sold("p1"), 2);
    }
}
