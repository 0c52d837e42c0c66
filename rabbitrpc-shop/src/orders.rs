use chrono::Utc;
use futures_util::future::try_join_all;
use rabbitrpc::{ExchangeRegistry, RabbitRpcError, Result, Service};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::contracts::{
    NewOrder, Order, OrderCreated, OrderDetails, OrderReceipt, OrderStatus, ProductPatch,
    ProductStatus, StockCheckRequest, StockCheckResponse, UserOrderLine, UserSummary,
    ORDER_EXCHANGE, PRODUCT_EXCHANGE, STOCK_CHECK, USER_EXCHANGE,
};
use crate::events::{OrderEvents, ProductEvents, UserEvents};
use crate::store::RepositoryPtr;

pub const SERVICE_NAME: &str = "order-service";

pub const STOCK_NOT_AVAILABLE: &str = "Stock not available";
pub const ORDER_CREATED_MESSAGE: &str = "Order created successfully";
pub const ORDER_CANCELLED_MESSAGE: &str = "Order cancelled successfully";

/// Places orders against the product service and serves `stock.check`
pub struct OrderService {
    orders: RepositoryPtr<Order>,
    products: ProductEvents,
    users: UserEvents,
    events: OrderEvents,
}

impl OrderService {
    pub fn new(
        orders: RepositoryPtr<Order>,
        products: ProductEvents,
        users: UserEvents,
        events: OrderEvents,
    ) -> Self {
        Self {
            orders,
            products,
            users,
            events,
        }
    }

    /// Wire the service's callers from its [`Service`] client and publisher
    pub fn from_service(orders: RepositoryPtr<Order>, service: &Service) -> Self {
        let client = service.client();
        Self::new(
            orders,
            ProductEvents::new(client.clone()),
            UserEvents::new(client.clone()),
            OrderEvents::new(client, service.publisher()),
        )
    }

    pub fn registry() -> Result<ExchangeRegistry> {
        ExchangeRegistry::builder()
            .owns(ORDER_EXCHANGE)
            .consumes(PRODUCT_EXCHANGE)
            .consumes(USER_EXCHANGE)
            .build()
    }

    pub fn bind(self: &Arc<Self>, service: &mut Service) -> Result<()> {
        let orders = self.clone();
        service.respond(STOCK_CHECK, ORDER_EXCHANGE, STOCK_CHECK, move |req: StockCheckRequest| {
            let orders = orders.clone();
            async move { orders.check_stock(req).await }
        })?;
        Ok(())
    }

    /// Whether `quantity` units of the product can be ordered. An unknown
    /// product is simply unavailable.
    pub async fn check_stock(&self, req: StockCheckRequest) -> Result<StockCheckResponse> {
        let available = match self.products.get_product_by_id(&req.product_id).await? {
            Some(product) => {
                product.status != ProductStatus::OutOfStock
                    && product.stock > 0
                    && product.stock >= req.quantity
            }
            None => false,
        };
        Ok(StockCheckResponse { available })
    }

    /// Check stock, save the order, decrement stock and announce the order.
    ///
    /// Insufficient stock is not an error: the receipt carries
    /// [`STOCK_NOT_AVAILABLE`] and no order.
    pub async fn create_order(&self, input: NewOrder, user_id: &str) -> Result<OrderReceipt> {
        if input.quantity == 0 {
            return Err(RabbitRpcError::invalid("quantity must be at least 1"));
        }

        let product = self
            .products
            .get_product_by_id(&input.product_id)
            .await?
            .ok_or_else(|| RabbitRpcError::not_found(format!("Product with ID {} not found", input.product_id)))?;

        if product.status == ProductStatus::OutOfStock
            || product.stock == 0
            || product.stock < input.quantity
        {
            return Ok(OrderReceipt {
                message: STOCK_NOT_AVAILABLE.to_string(),
                order: None,
            });
        }

        let order = self
            .orders
            .save(Order {
                id: Uuid::new_v4().to_string(),
                product_id: input.product_id,
                user_id: user_id.to_string(),
                quantity: input.quantity,
                status: OrderStatus::Pending,
                created_at: Utc::now(),
            })
            .await?;

        self.products
            .update_product(&order.product_id, ProductPatch::stock(product.stock - order.quantity))
            .await?
            .ok_or_else(|| RabbitRpcError::not_found(format!("Product with ID {} not found", order.product_id)))?;

        let event = OrderCreated {
            order_id: order.id.clone(),
            product_id: order.product_id.clone(),
            quantity: order.quantity,
        };
        if let Err(e) = self.events.publish_order_created(&event).await {
            warn!("Order {} saved but the notification failed: {}", order.id, e);
        }

        info!("Created order {} for user {}", order.id, user_id);
        Ok(OrderReceipt {
            message: ORDER_CREATED_MESSAGE.to_string(),
            order: Some(order),
        })
    }

    /// Order joined with its product and the ordering user's name
    pub async fn get_order_by_id(&self, id: &str) -> Result<OrderDetails> {
        let order = self.find_order(id).await?;

        let (product, user) = tokio::try_join!(
            self.products.get_product_by_id(&order.product_id),
            self.users.get_user_by_id(&order.user_id),
        )?;
        let product = product.ok_or_else(|| RabbitRpcError::not_found("Product not found"))?;
        let user = user.ok_or_else(|| RabbitRpcError::not_found("User not found"))?;

        Ok(OrderDetails {
            id: order.id,
            product: product.into(),
            user: UserSummary {
                name: user.username,
            },
        })
    }

    /// Return the ordered units to stock and delete the order
    pub async fn cancel_order(&self, id: &str) -> Result<String> {
        let order = self.find_order(id).await?;

        let product = self
            .products
            .get_product_by_id(&order.product_id)
            .await?
            .ok_or_else(|| RabbitRpcError::not_found("Product not found"))?;
        let restocked = product.stock.checked_add(order.quantity).ok_or_else(|| {
            RabbitRpcError::conflict(format!(
                "Restocking {} units would overflow stock of product {}",
                order.quantity, product.id
            ))
        })?;
        self.products
            .update_product(&order.product_id, ProductPatch::stock(restocked))
            .await?;
        self.orders.delete_by_id(id).await?;

        info!("Cancelled order {}", id);
        Ok(ORDER_CANCELLED_MESSAGE.to_string())
    }

    pub async fn get_all_orders_by_user(&self, user_id: &str) -> Result<Vec<UserOrderLine>> {
        let mut orders: Vec<Order> = self
            .orders
            .find_all()
            .await?
            .into_iter()
            .filter(|order| order.user_id == user_id)
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let lines = orders.into_iter().map(|order| async move {
            let product = self
                .products
                .get_product_by_id(&order.product_id)
                .await?
                .ok_or_else(|| RabbitRpcError::not_found("Product not found"))?;
            Ok::<_, RabbitRpcError>(UserOrderLine {
                product: product.into(),
                quantity: order.quantity,
            })
        });
        try_join_all(lines).await
    }

    async fn find_order(&self, id: &str) -> Result<Order> {
        self.orders
            .find_by_id(id)
            .await?
            .ok_or_else(|| RabbitRpcError::not_found("Order not found"))
    }
}
