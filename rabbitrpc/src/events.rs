use serde::Serialize;
use tracing::debug;

use crate::error::{RabbitRpcError, Result};
use crate::message::{Envelope, MessageProperties};
use crate::transport::{QueueOptions, TransportPtr};

/// Per-publish overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Ask the broker to persist the message (delivery mode 2)
    pub persistent: bool,
}

/// Fire-and-forget publisher: no reply, no correlation tracking, no retry.
/// Publishing to an exchange nobody listens on succeeds.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    transport: TransportPtr,
    persistent: bool,
}

impl EventPublisher {
    pub fn new(transport: TransportPtr, persistent: bool) -> Self {
        Self {
            transport,
            persistent,
        }
    }

    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<()> {
        let options = PublishOptions {
            persistent: self.persistent,
        };
        self.publish_with(exchange, routing_key, payload, options)
            .await
    }

    /// Publish failures are returned to the caller as-is
    pub async fn publish_with<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<()> {
        if exchange.is_empty() {
            return Err(RabbitRpcError::InvalidMessage {
                reason: "events must be published to a named exchange".to_string(),
            });
        }

        let body = Envelope::event(exchange, routing_key, payload)?.to_bytes()?;
        self.transport
            .publish(
                exchange,
                routing_key,
                body,
                MessageProperties::event().with_persistent(options.persistent),
            )
            .await?;

        debug!("Published event {}/{}", exchange, routing_key);
        Ok(())
    }
}

/// Queue settings for a subscriber binding. Queues are durable unless
/// `durable` is explicitly `Some(false)`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub durable: Option<bool>,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl SubscribeOptions {
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable.unwrap_or(true),
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            dead_letter_routing_key: self.dead_letter_routing_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::{ExchangeKind, ExchangeSpec, Transport};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_subscribe_queues_default_to_durable() {
        assert!(SubscribeOptions::default().queue_options().durable);

        let transient = SubscribeOptions {
            durable: Some(false),
            ..SubscribeOptions::default()
        };
        assert!(!transient.queue_options().durable);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_succeeds() {
        let transport = Arc::new(MemoryTransport::new());
        transport
            .declare_exchange(&ExchangeSpec::new("order", ExchangeKind::Direct))
            .await
            .unwrap();

        let publisher = EventPublisher::new(transport, true);
        publisher
            .publish(
                "order",
                "order.created",
                &json!({"orderId": "o1", "productId": "p1", "quantity": 2}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_is_visible() {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = EventPublisher::new(transport.clone(), false);

        assert!(publisher.publish("", "order.created", &1).await.is_err());

        transport.disconnect();
        let err = publisher.publish("order", "order.created", &1).await.unwrap_err();
        assert!(err.is_transport());
    }
}
