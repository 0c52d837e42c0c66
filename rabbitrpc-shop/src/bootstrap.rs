use rabbitrpc::{AmqpTransport, ExchangeRegistry, Service, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(target: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,rabbitrpc_shop=debug,rabbitrpc=debug", target).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load settings, connect to the broker and create the service shell
pub async fn service(service_name: &str, registry: ExchangeRegistry) -> anyhow::Result<Service> {
    let settings = Settings::load(service_name)?;
    tracing::info!("Configuration loaded for {}", settings.service_name);

    let transport = AmqpTransport::connect(settings.broker.clone()).await?;
    tracing::info!("Connected to RabbitMQ");

    Ok(Service::new(settings, transport, registry).await?)
}
