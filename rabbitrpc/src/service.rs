use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

use crate::client::RpcClient;
use crate::config::Settings;
use crate::error::{RabbitRpcError, Result};
use crate::events::{EventPublisher, SubscribeOptions};
use crate::policy::RouteContext;
use crate::registry::ExchangeRegistry;
use crate::server::{HandlerTable, RpcServer, ServerConfig, ServerHandle};
use crate::transport::TransportPtr;

/// Service operational status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Handlers are being registered
    Starting,
    /// Every binding is asserted and consuming
    Running,
    /// Consumers were stopped
    Stopped,
    /// Startup or a consumer failed
    Error(String),
}

/// Service statistics for monitoring
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub service_name: String,
    pub status: ServiceStatus,
    /// Registered bindings, or live consumers once running
    pub bindings: usize,
    pub pending_calls: usize,
    pub connected: bool,
}

/// One service process on the mesh.
///
/// Owns the explicit wiring of a process: the shared transport, the
/// exchanges it owns or consumes, its handler table, an RPC client for
/// calling other services and an event publisher.
pub struct Service {
    settings: Settings,
    transport: TransportPtr,
    registry: Arc<ExchangeRegistry>,
    table: HandlerTable,
    routes: Vec<RouteContext>,
    client: RpcClient,
    publisher: EventPublisher,
    status: Arc<RwLock<ServiceStatus>>,
}

impl Service {
    /// Create the service and start its RPC client
    pub async fn new(
        settings: Settings,
        transport: TransportPtr,
        registry: ExchangeRegistry,
    ) -> Result<Self> {
        info!("Creating service: {}", settings.service_name);

        let client = RpcClient::start(transport.clone(), &settings.rpc).await?;
        let publisher = EventPublisher::new(transport.clone(), settings.rpc.persistent_messages);

        Ok(Self {
            settings,
            transport,
            registry: Arc::new(registry),
            table: HandlerTable::new(),
            routes: Vec::new(),
            client,
            publisher,
            status: Arc::new(RwLock::new(ServiceStatus::Starting)),
        })
    }

    /// See [`HandlerTable::respond`]
    pub fn respond<F, Fut, Req, Resp>(
        &mut self,
        routing_key: &str,
        exchange: &str,
        queue: &str,
        handler: F,
    ) -> Result<&mut Self>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.table.respond(routing_key, exchange, queue, handler)?;
        Ok(self)
    }

    /// See [`HandlerTable::subscribe_queue`]
    pub fn subscribe_queue<F, Fut, Req>(
        &mut self,
        routing_key: &str,
        exchange: &str,
        queue: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<&mut Self>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
    {
        self.table
            .subscribe_queue(routing_key, exchange, queue, options, handler)?;
        Ok(self)
    }

    pub fn client(&self) -> RpcClient {
        self.client.clone()
    }

    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ExchangeRegistry {
        &self.registry
    }

    /// Assert every binding and attach consumers. Fails if any binding cannot
    /// be asserted; nothing consumes in that case.
    pub async fn start(&mut self) -> Result<ServerHandle> {
        if *self.status.read() != ServiceStatus::Starting {
            return Err(RabbitRpcError::config_error(format!(
                "service {} was already started",
                self.settings.service_name
            )));
        }
        info!("Starting service: {}", self.settings.service_name);

        let server = RpcServer::new(
            self.transport.clone(),
            self.registry.clone(),
            std::mem::take(&mut self.table),
            ServerConfig {
                service_name: self.settings.service_name.clone(),
                prefetch: self.settings.rpc.prefetch_count,
                subscribe_prefetch: self.settings.rpc.subscribe_prefetch_count,
            },
        );

        match server.start().await {
            Ok(handle) => {
                self.routes = handle.routes().to_vec();
                *self.status.write() = ServiceStatus::Running;
                info!(
                    "Service {} is running with {} binding(s)",
                    self.settings.service_name,
                    self.routes.len()
                );
                Ok(handle)
            }
            Err(e) => {
                *self.status.write() = ServiceStatus::Error(e.to_string());
                Err(e)
            }
        }
    }

    /// Start and block until a consumer stops
    pub async fn run(mut self) -> Result<()> {
        let handle = self.start().await?;
        let result = handle.wait().await;

        match &result {
            Ok(()) => *self.status.write() = ServiceStatus::Stopped,
            Err(e) => {
                error!("Service {} stopped: {}", self.settings.service_name, e);
                *self.status.write() = ServiceStatus::Error(e.to_string());
            }
        }
        result
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    pub fn stats(&self) -> ServiceStats {
        let status = self.status();
        let bindings = match status {
            ServiceStatus::Starting => self.table.len(),
            _ => self.routes.len(),
        };

        ServiceStats {
            service_name: self.settings.service_name.clone(),
            status,
            bindings,
            pending_calls: self.client.pending_calls(),
            connected: self.transport.is_connected(),
        }
    }

    /// Running, connected and still able to receive replies
    pub fn is_healthy(&self) -> bool {
        self.status() == ServiceStatus::Running
            && self.transport.is_connected()
            && self.client.is_listening()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("service_name", &self.settings.service_name)
            .field("status", &self.status())
            .field("registry", &self.registry)
            .field("table", &self.table)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::{json, Value};

    async fn product_service(transport: &MemoryTransport) -> Service {
        let registry = ExchangeRegistry::builder().owns("product").build().unwrap();
        let mut service = Service::new(
            Settings::new("product-service"),
            Arc::new(transport.clone()),
            registry,
        )
        .await
        .unwrap();

        service
            .respond("product.get", "product", "product.get", |id: String| async move {
                Ok(json!({ "_id": id, "stock": 10 }))
            })
            .unwrap();
        service
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let transport = MemoryTransport::new();
        let mut service = product_service(&transport).await;

        assert_eq!(service.status(), ServiceStatus::Starting);
        assert_eq!(service.stats().bindings, 1);

        let handle = service.start().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Running);
        assert!(service.is_healthy());
        assert_eq!(handle.routes()[0].queue, "product.get");

        let product: Value = service
            .client()
            .request("product.get", "product", &"p1")
            .await
            .unwrap();
        assert_eq!(product, json!({ "_id": "p1", "stock": 10 }));

        let stats = service.stats();
        assert_eq!(stats.bindings, 1);
        assert_eq!(stats.pending_calls, 0);
        assert!(stats.connected);

        assert!(service.start().await.is_err());
        handle.abort();
    }

    #[tokio::test]
    async fn test_run_surfaces_connection_loss() {
        let transport = MemoryTransport::new();
        let service = product_service(&transport).await;
        let status = service.status.clone();

        let running = tokio::spawn(service.run());
        while *status.read() != ServiceStatus::Running {
            tokio::task::yield_now().await;
        }

        transport.disconnect();
        let err = running.await.unwrap().unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(*status.read(), ServiceStatus::Error(_)));
    }
}
