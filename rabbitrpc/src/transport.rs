//! Broker seam.
//!
//! Everything above this module talks to a [`Transport`]: the lapin-backed
//! [`AmqpTransport`](crate::connection::AmqpTransport) in production, the
//! in-process [`MemoryTransport`](crate::memory::MemoryTransport) in tests.
//! One transport is constructed per process and shared as a [`TransportPtr`].

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::message::MessageProperties;

/// Shared, process-wide broker handle
pub type TransportPtr = Arc<dyn Transport>;

/// Stream of inbound deliveries for one consumer
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Exchange routing model
///
/// Direct: routing key === queue purpose.
/// Topic: routing key + wildcards.
/// Fanout: broadcast.
/// Headers: match headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

/// Exchange declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// Queue declaration options. Durable unless explicitly configured otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Rejected messages are re-published to this exchange
    /// (`x-dead-letter-exchange`) instead of being dropped
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering (`x-dead-letter-routing-key`);
    /// defaults to the message's original routing key
    pub dead_letter_routing_key: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }
}

impl QueueOptions {
    /// Private, non-durable queue removed with its consumer. Used for replies.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from its queue
    async fn ack(&self) -> Result<()>;

    /// Refuse the message; `requeue = false` drops or dead-letters it
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: MessageProperties,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            properties,
            body,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Operations the framework needs from a message broker
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Declare an exchange if absent; fails if it exists with other settings
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    /// Declare a queue if absent and return its actual name. An empty name
    /// asks the broker to generate one.
    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message. The empty exchange routes directly to the queue
    /// named by `routing_key`. Unroutable messages are silently dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Start consuming a queue with manual acknowledgement. `prefetch` bounds
    /// the number of unacknowledged deliveries held by this consumer.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    fn is_connected(&self) -> bool;
}
