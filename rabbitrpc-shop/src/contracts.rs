//! Wire contracts of the shop services.
//!
//! Exchange and routing key names are shared by the owning service (which
//! binds them) and its callers. Queue names equal the routing key for RPC
//! operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PRODUCT_EXCHANGE: &str = "product";
pub const USER_EXCHANGE: &str = "user";
pub const ORDER_EXCHANGE: &str = "order";

/// `product.get(productId) -> Product | not_found`
pub const PRODUCT_GET: &str = "product.get";
/// `product.update({ id, updateProductDto }) -> Product | not_found`
pub const PRODUCT_UPDATE: &str = "product.update";
/// `user.get(userId) -> User | not_found`
pub const USER_GET: &str = "user.get";
/// `stock.check({ productId, quantity }) -> { available }`
pub const STOCK_CHECK: &str = "stock.check";
/// Notification `{ orderId, productId, quantity }`
pub const ORDER_CREATED: &str = "order.created";

/// Queue through which the product service follows new orders
pub const PRODUCT_ORDER_CREATED_QUEUE: &str = "product.order-created";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    InStock,
    OutOfStock,
}

impl ProductStatus {
    pub fn for_stock(stock: u32) -> Self {
        if stock == 0 {
            ProductStatus::OutOfStock
        } else {
            ProductStatus::InStock
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: u32,
    pub status: ProductStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: u32,
}

/// Partial product update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProductStatus>,
}

impl ProductPatch {
    pub fn stock(stock: u32) -> Self {
        Self {
            stock: Some(stock),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProductRequest {
    pub id: String,
    pub update_product_dto: ProductPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockCheckRequest {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCheckResponse {
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: String,
    pub product_id: String,
    pub user_id: String,
    pub quantity: u32,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub product_id: String,
    pub quantity: u32,
}

/// Result of `create_order`. Insufficient stock is reported in `message`
/// with no order, not as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
}

/// Public product fields embedded in order views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
}

impl From<Product> for ProductSummary {
    fn from(product: Product) -> Self {
        Self {
            id: product.id,
            name: product.name,
            description: product.description,
            price: product.price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(rename = "_id")]
    pub id: String,
    pub product: ProductSummary,
    pub user: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserOrderLine {
    pub product: ProductSummary,
    pub quantity: u32,
}
