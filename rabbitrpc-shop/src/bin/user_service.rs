use anyhow::Result;
use rabbitrpc_shop::{bootstrap, users, MemoryCache, MemoryRepository, UserService};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing("user_service");
    tracing::info!("Starting User Service...");

    let mut service = bootstrap::service(users::SERVICE_NAME, UserService::registry()?).await?;

    let users = Arc::new(UserService::new(
        MemoryRepository::shared(),
        MemoryCache::shared(),
    ));
    users.bind(&mut service)?;

    service.run().await?;
    Ok(())
}
