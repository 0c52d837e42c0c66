//! # rabbitrpc - RPC over a message broker
//!
//! Turns RabbitMQ's fire-and-forget delivery into call/return between
//! services, alongside a plain publish/subscribe path for notifications.
//!
//! - [`RpcClient::request`] publishes on an exchange/routing key and waits for
//!   the reply carrying the same correlation id.
//! - [`HandlerTable::respond`] binds a typed handler to a durable queue; its
//!   return value is published back to the caller.
//! - [`EventPublisher::publish`] and [`HandlerTable::subscribe_queue`] cover
//!   notifications where nobody waits for an answer.
//! - Failed messages are rejected without requeue (optionally dead-lettered),
//!   and queue assertion failures abort startup.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rabbitrpc::{AmqpTransport, ExchangeRegistry, Service, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load("product-service")?;
//!     let transport = AmqpTransport::connect(settings.broker.clone()).await?;
//!     let registry = ExchangeRegistry::builder().owns("product").build()?;
//!
//!     let mut service = Service::new(settings, transport, registry).await?;
//!     service.respond("product.get", "product", "product.get", |id: String| async move {
//!         Ok(serde_json::json!({ "_id": id, "stock": 10 }))
//!     })?;
//!
//!     service.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod events;
pub mod memory;
pub mod message;
pub mod policy;
pub mod registry;
pub mod server;
pub mod service;
pub mod transport;

pub use client::{RequestOptions, RpcClient};
pub use config::{RpcConfig, Settings};
pub use connection::{AmqpTransport, ConnectionConfig};
pub use error::{RabbitRpcError, Result};
pub use events::{EventPublisher, PublishOptions, SubscribeOptions};
pub use memory::{MemoryTransport, QueueStats};
pub use message::{Envelope, ErrorBody, MessageProperties, ReplyEnvelope};
pub use policy::{MessageState, RouteContext};
pub use registry::{ExchangeRegistry, ExchangeRole};
pub use server::{HandlerKind, HandlerTable, MessageHandler, RpcServer, ServerConfig, ServerHandle};
pub use service::{Service, ServiceStats, ServiceStatus};
pub use transport::{Delivery, ExchangeKind, ExchangeSpec, QueueOptions, Transport, TransportPtr};
