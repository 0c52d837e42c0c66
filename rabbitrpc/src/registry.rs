use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::error::{RabbitRpcError, Result};
use crate::transport::{ExchangeKind, ExchangeSpec, Transport};

/// Whether a service exposes data on an exchange or only talks to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeRole {
    Owns,
    Consumes,
}

/// One declared exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeEntry {
    pub spec: ExchangeSpec,
    pub role: ExchangeRole,
}

/// Static per-service declaration of the exchanges it owns and consumes.
///
/// Built once at startup and immutable afterwards; [`ExchangeRegistry::declare`]
/// asserts every entry on the broker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExchangeRegistry {
    exchanges: BTreeMap<String, ExchangeEntry>,
}

impl ExchangeRegistry {
    pub fn builder() -> ExchangeRegistryBuilder {
        ExchangeRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&ExchangeEntry> {
        self.exchanges.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    /// Exchanges this service exposes
    pub fn owned(&self) -> impl Iterator<Item = &ExchangeEntry> {
        self.exchanges
            .values()
            .filter(|entry| entry.role == ExchangeRole::Owns)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Assert (declare-if-absent) every exchange. Consumed exchanges are
    /// asserted too, so publishing to them never hits a missing exchange.
    pub async fn declare(&self, transport: &dyn Transport) -> Result<()> {
        for entry in self.exchanges.values() {
            if let Err(e) = transport.declare_exchange(&entry.spec).await {
                error!(
                    exchange = %entry.spec.name,
                    kind = ?entry.spec.kind,
                    error = %e,
                    "Rabbit Assert Error - exchange"
                );
                return Err(RabbitRpcError::Assertion {
                    exchange: entry.spec.name.clone(),
                    routing_key: String::new(),
                    queue: String::new(),
                    reason: e.to_string(),
                });
            }
        }

        info!("Declared {} exchange(s)", self.exchanges.len());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ExchangeRegistryBuilder {
    exchanges: BTreeMap<String, ExchangeEntry>,
    error: Option<RabbitRpcError>,
}

impl ExchangeRegistryBuilder {
    /// Durable direct exchange owned by this service
    pub fn owns(self, name: impl Into<String>) -> Self {
        self.with(ExchangeSpec::new(name, ExchangeKind::Direct), ExchangeRole::Owns)
    }

    /// Durable direct exchange owned by another service
    pub fn consumes(self, name: impl Into<String>) -> Self {
        self.with(
            ExchangeSpec::new(name, ExchangeKind::Direct),
            ExchangeRole::Consumes,
        )
    }

    /// Add an exchange with explicit settings. Declaring the same name twice
    /// with different settings is reported by [`build`](Self::build). Owning
    /// wins over consuming.
    pub fn with(mut self, spec: ExchangeSpec, role: ExchangeRole) -> Self {
        if spec.name.is_empty() {
            self.error
                .get_or_insert_with(|| RabbitRpcError::config_error("exchange name is empty"));
            return self;
        }

        match self.exchanges.get_mut(&spec.name) {
            Some(existing) if existing.spec != spec => {
                self.error.get_or_insert_with(|| {
                    RabbitRpcError::config_error(format!(
                        "exchange '{}' registered with conflicting settings",
                        spec.name
                    ))
                });
            }
            Some(existing) => {
                if role == ExchangeRole::Owns {
                    existing.role = ExchangeRole::Owns;
                }
            }
            None => {
                self.exchanges
                    .insert(spec.name.clone(), ExchangeEntry { spec, role });
            }
        }
        self
    }

    pub fn build(self) -> Result<ExchangeRegistry> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(ExchangeRegistry {
                exchanges: self.exchanges,
            }),
        }
    }
}
