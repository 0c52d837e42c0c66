use anyhow::Result;
use rabbitrpc_shop::{bootstrap, products, MemoryRepository, ProductService};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing("product_service");
    tracing::info!("Starting Product Service...");

    let mut service = bootstrap::service(products::SERVICE_NAME, ProductService::registry()?).await?;

    let products = Arc::new(ProductService::new(MemoryRepository::shared()));
    products.bind(&mut service)?;

    service.run().await?;
    Ok(())
}
