//! In-process broker.
//!
//! Behaves like a single RabbitMQ vhost for the subset of AMQP the framework
//! uses: direct/topic/fanout exchanges, the default exchange, durable-flag
//! equivalence checks, round-robin consumers, manual ack/reject with requeue
//! and dead-lettering. Used by the test suites and for running several
//! services inside one process.
//!
//! Prefetch is not enforced here; consumers bound their own concurrency.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RabbitRpcError, Result};
use crate::message::MessageProperties;
use crate::transport::{
    Acknowledger, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec, QueueOptions, Transport,
};

/// Per-queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages routed into the queue (requeues excluded)
    pub enqueued: u64,
    /// Deliveries handed to consumers, redeliveries included
    pub delivered: u64,
    pub acked: u64,
    /// Rejections without requeue
    pub rejected: u64,
    pub requeued: u64,
    /// Rejected messages re-published to the dead-letter exchange
    pub dead_lettered: u64,
    /// Messages waiting for a consumer
    pub ready: usize,
    pub consumers: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Vec<u8>,
}

struct ConsumerSlot {
    tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    bindings: Vec<(String, String)>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    stats: QueueStats,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            bindings: Vec::new(),
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            stats: QueueStats::default(),
        }
    }

    /// Hand the message to the next live consumer, or park it
    fn offer(&mut self, broker: &Weak<Broker>, queue: &str, message: StoredMessage, front: bool) {
        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            self.next_consumer = idx + 1;

            let delivery = make_delivery(broker, queue, message.clone());
            if self.consumers[idx].tx.send(delivery).is_ok() {
                self.stats.delivered += 1;
                return;
            }

            let gone = self.consumers.remove(idx);
            debug!("Dropped closed consumer {} on queue {}", gone.tag, queue);
        }

        if front {
            self.ready.push_front(message);
        } else {
            self.ready.push_back(message);
        }
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            consumers: self.consumers.len(),
            ..self.stats
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
}

impl BrokerState {
    /// Names of the queues a message published to `exchange` reaches
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let spec = self.exchanges.get(exchange).ok_or_else(|| {
            RabbitRpcError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        Ok(self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue.bindings.iter().any(|(bound, key)| {
                    bound == exchange
                        && match spec.kind {
                            ExchangeKind::Direct => key == routing_key,
                            ExchangeKind::Topic => topic_matches(key, routing_key),
                            ExchangeKind::Fanout | ExchangeKind::Headers => true,
                        }
                })
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn deliver(&mut self, broker: &Weak<Broker>, message: StoredMessage) -> Result<usize> {
        let targets = self.route(&message.exchange, &message.routing_key)?;
        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.stats.enqueued += 1;
                queue.offer(broker, name, message.clone(), false);
            }
        }
        Ok(targets.len())
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

struct Broker {
    state: Mutex<BrokerState>,
    connected: AtomicBool,
}

fn make_delivery(broker: &Weak<Broker>, queue: &str, message: StoredMessage) -> Delivery {
    let acker = MemoryAcker {
        broker: broker.clone(),
        queue: queue.to_string(),
        message: message.clone(),
        settled: AtomicBool::new(false),
    };
    Delivery::new(
        message.exchange,
        message.routing_key,
        message.redelivered,
        message.properties,
        message.body,
        Box::new(acker),
    )
}

struct MemoryAcker {
    broker: Weak<Broker>,
    queue: String,
    message: StoredMessage,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn begin_settle(&self) -> Result<Arc<Broker>> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| RabbitRpcError::transport("broker is gone"))?;
        if !broker.connected.load(Ordering::SeqCst) {
            return Err(RabbitRpcError::transport("connection closed"));
        }
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(RabbitRpcError::Broker(
                "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            ));
        }
        Ok(broker)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let broker = self.begin_settle()?;
        let mut state = broker.state.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.stats.acked += 1;
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let broker = self.begin_settle()?;
        let weak = Arc::downgrade(&broker);
        let mut state = broker.state.lock();

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Ok(());
        };

        if requeue {
            queue.stats.requeued += 1;
            let mut message = self.message.clone();
            message.redelivered = true;
            queue.offer(&weak, &self.queue, message, true);
            return Ok(());
        }

        queue.stats.rejected += 1;
        let Some(dead_letter_exchange) = queue.options.dead_letter_exchange.clone() else {
            return Ok(());
        };
        queue.stats.dead_lettered += 1;
        let routing_key = queue
            .options
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| self.message.routing_key.clone());

        let dead = StoredMessage {
            exchange: dead_letter_exchange,
            routing_key,
            redelivered: false,
            ..self.message.clone()
        };
        // A missing dead-letter exchange drops the message, as RabbitMQ does
        if let Err(e) = state.deliver(&weak, dead) {
            debug!("Dead-lettering from {} failed: {}", self.queue, e);
        }
        Ok(())
    }
}

/// In-process [`Transport`]; clones share the same broker
#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<Broker>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker {
                state: Mutex::new(BrokerState::default()),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Counters for `queue`, if it exists
    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = self.broker.state.lock();
        state.queues.get(queue).map(QueueState::snapshot)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.broker.state.lock().exchanges.contains_key(exchange)
    }

    /// Simulate losing the connection: every consumer stream ends, exclusive
    /// queues vanish and further operations fail with a transport error.
    pub fn disconnect(&self) {
        self.broker.connected.store(false, Ordering::SeqCst);
        let mut state = self.broker.state.lock();
        state.queues.retain(|_, queue| !queue.options.exclusive);
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.broker.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RabbitRpcError::transport("connection closed"))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.ensure_connected()?;
        if exchange.name.is_empty() {
            return Err(RabbitRpcError::Broker(
                "ACCESS_REFUSED - the default exchange cannot be declared".to_string(),
            ));
        }

        let mut state = self.broker.state.lock();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(RabbitRpcError::Broker(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<String> {
        self.ensure_connected()?;
        let name = if queue.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue.to_string()
        };

        let mut state = self.broker.state.lock();
        match state.queues.get(&name) {
            Some(existing) if &existing.options != options => {
                Err(RabbitRpcError::Broker(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    name
                )))
            }
            Some(_) => Ok(name),
            None => {
                state
                    .queues
                    .insert(name.clone(), QueueState::new(options.clone()));
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitRpcError::Broker(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
            RabbitRpcError::Broker(format!("NOT_FOUND - no queue '{}'", queue))
        })?;

        let binding = (exchange.to_string(), routing_key.to_string());
        if !queue_state.bindings.contains(&binding) {
            queue_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.ensure_connected()?;
        let weak = Arc::downgrade(&self.broker);
        let mut state = self.broker.state.lock();
        let routed = state.deliver(
            &weak,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                properties,
                body,
            },
        )?;

        if routed == 0 {
            debug!("Message to {}/{} was unroutable", exchange, routing_key);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_connected()?;
        let weak = Arc::downgrade(&self.broker);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.broker.state.lock();
            let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
                RabbitRpcError::Broker(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            queue_state.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                tx,
            });

            let backlog: Vec<StoredMessage> = queue_state.ready.drain(..).collect();
            for message in backlog {
                queue_state.offer(&weak, queue, message, false);
            }
        }

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(Box::pin(stream))
    }

    fn is_connected(&self) -> bool {
        self.broker.connected.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.broker.state.lock();
        f.debug_struct("MemoryTransport")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn setup(transport: &MemoryTransport, options: QueueOptions) {
        transport
            .declare_exchange(&ExchangeSpec::new("product", ExchangeKind::Direct))
            .await
            .unwrap();
        transport.declare_queue("product.get", &options).await.unwrap();
        transport
            .bind_queue("product.get", "product", "product.get")
            .await
            .unwrap();
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.v2"));
        assert!(topic_matches("order.#", "order.created.v2"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("product.get", "product.update"));
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_dropped() {
        let transport = MemoryTransport::new();
        transport
            .declare_exchange(&ExchangeSpec::new("order", ExchangeKind::Direct))
            .await
            .unwrap();

        transport
            .publish("order", "order.created", b"{}".to_vec(), MessageProperties::event())
            .await
            .unwrap();

        let err = transport
            .publish("missing", "x", Vec::new(), MessageProperties::event())
            .await
            .unwrap_err();
        assert!(matches!(err, RabbitRpcError::Broker(_)));
    }

    #[tokio::test]
    async fn test_conflicting_queue_declaration_is_refused() {
        let transport = MemoryTransport::new();
        setup(&transport, QueueOptions::default()).await;

        let non_durable = QueueOptions {
            durable: false,
            ..QueueOptions::default()
        };
        let err = transport
            .declare_queue("product.get", &non_durable)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PRECONDITION_FAILED"));

        // Same options again is a no-op
        transport
            .declare_queue("product.get", &QueueOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_backlog_is_delivered_on_consume() {
        let transport = MemoryTransport::new();
        setup(&transport, QueueOptions::default()).await;

        transport
            .publish("product", "product.get", b"1".to_vec(), MessageProperties::event())
            .await
            .unwrap();
        assert_eq!(transport.queue_stats("product.get").unwrap().ready, 1);

        let mut stream = transport.consume("product.get", "c1", 10).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"1");
        delivery.ack().await.unwrap();

        let stats = transport.queue_stats("product.get").unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_and_double_settle_fails() {
        let transport = MemoryTransport::new();
        setup(&transport, QueueOptions::default()).await;
        let mut stream = transport.consume("product.get", "c1", 10).await.unwrap();

        transport
            .publish("product", "product.get", b"1".to_vec(), MessageProperties::event())
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.reject(true).await.unwrap();
        assert!(first.ack().await.is_err());

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.ack().await.unwrap();

        let stats = transport.queue_stats("product.get").unwrap();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test]
    async fn test_reject_dead_letters_when_configured() {
        let transport = MemoryTransport::new();
        transport
            .declare_exchange(&ExchangeSpec::new("product.dlx", ExchangeKind::Fanout))
            .await
            .unwrap();
        transport
            .declare_queue("product.dead", &QueueOptions::default())
            .await
            .unwrap();
        transport
            .bind_queue("product.dead", "product.dlx", "")
            .await
            .unwrap();
        setup(
            &transport,
            QueueOptions::default().with_dead_letter("product.dlx", None),
        )
        .await;

        let mut stream = transport.consume("product.get", "c1", 10).await.unwrap();
        transport
            .publish("product", "product.get", b"1".to_vec(), MessageProperties::event())
            .await
            .unwrap();
        stream.next().await.unwrap().unwrap().reject(false).await.unwrap();

        assert_eq!(transport.queue_stats("product.get").unwrap().dead_lettered, 1);
        assert_eq!(transport.queue_stats("product.dead").unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let transport = MemoryTransport::new();
        setup(&transport, QueueOptions::default()).await;
        let reply_queue = transport
            .declare_queue("", &QueueOptions::exclusive())
            .await
            .unwrap();
        assert!(reply_queue.starts_with("amq.gen-"));

        let mut stream = transport.consume("product.get", "c1", 10).await.unwrap();
        transport.disconnect();

        assert!(stream.next().await.is_none());
        assert!(!transport.is_connected());
        assert!(transport.queue_stats(&reply_queue).is_none());
        assert!(transport
            .publish("product", "product.get", Vec::new(), MessageProperties::event())
            .await
            .unwrap_err()
            .is_transport());
    }
}
