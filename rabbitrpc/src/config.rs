use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::error::Result;

/// Prefix of the environment variables read by [`Settings::load`]
pub const ENV_PREFIX: &str = "RABBITRPC";

/// RPC and consumer tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default deadline for `request`
    pub request_timeout_ms: u64,
    /// Max in-flight messages per RPC queue
    pub prefetch_count: u16,
    /// Max in-flight messages per subscriber queue
    pub subscribe_prefetch_count: u16,
    /// Publish requests and events with delivery mode 2
    pub persistent_messages: bool,
    /// How long an abandoned correlation id stays reserved
    pub correlation_grace_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            prefetch_count: 10,
            subscribe_prefetch_count: 10,
            persistent_messages: false,
            correlation_grace_ms: 120_000,
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn correlation_grace(&self) -> Duration {
        Duration::from_millis(self.correlation_grace_ms)
    }
}

/// Everything a service process needs to join the mesh
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service_name: String,
    #[serde(default)]
    pub broker: ConnectionConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
}

impl Settings {
    /// Defaults for `service_name`, no file or environment lookup
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            broker: ConnectionConfig::default(),
            rpc: RpcConfig::default(),
        }
    }

    /// Layered configuration: built-in defaults, then `config.toml` and
    /// `config/<service>.toml` when present, then `RABBITRPC__*` environment
    /// variables (`RABBITRPC__BROKER__URL`, `RABBITRPC__RPC__PREFETCH_COUNT`, ...)
    pub fn load(service_name: &str) -> Result<Self> {
        let broker = ConnectionConfig::default();
        let rpc = RpcConfig::default();

        let config = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("broker.url", broker.url)?
            .set_default("rpc.request_timeout_ms", rpc.request_timeout_ms as i64)?
            .set_default("rpc.prefetch_count", rpc.prefetch_count as i64)?
            .set_default("rpc.subscribe_prefetch_count", rpc.subscribe_prefetch_count as i64)?
            .set_default("rpc.persistent_messages", rpc.persistent_messages)?
            .add_source(File::with_name("config").required(false))
            .add_source(File::with_name(&format!("config/{}", service_name)).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_uses_defaults() {
        let settings = Settings::load("test-service").unwrap();
        assert_eq!(settings.service_name, "test-service");
        assert_eq!(settings.rpc.prefetch_count, 10);
        assert_eq!(settings.rpc.request_timeout(), Duration::from_secs(30));
        assert!(settings.broker.url.starts_with("amqp://"));
    }

    #[test]
    fn test_new_matches_defaults() {
        let settings = Settings::new("order-service");
        assert_eq!(settings.broker.max_retries, 5);
        assert!(!settings.rpc.persistent_messages);
    }
}
