use anyhow::Result;
use rabbitrpc_shop::{bootstrap, orders, MemoryRepository, OrderService};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing("order_service");
    tracing::info!("Starting Order Service...");

    let mut service = bootstrap::service(orders::SERVICE_NAME, OrderService::registry()?).await?;

    let orders = Arc::new(OrderService::from_service(MemoryRepository::shared(), &service));
    orders.bind(&mut service)?;

    service.run().await?;
    Ok(())
}
