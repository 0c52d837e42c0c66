use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RabbitRpcError, Result, KIND_INVALID_PAYLOAD};
use crate::events::SubscribeOptions;
use crate::message::{Envelope, ErrorBody, MessageProperties, ReplyEnvelope};
use crate::policy::{self, MessageState, RouteContext};
use crate::registry::ExchangeRegistry;
use crate::transport::{Delivery, DeliveryStream, QueueOptions, Transport, TransportPtr};

/// How a binding treats its messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Request/response: the return value is published to the reply queue
    Rpc,
    /// Notification: no reply
    Subscribe,
}

/// Trait for implementing message handlers
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded payload and produce the reply payload
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value>;

    /// Get handler name for debugging
    fn name(&self) -> &str {
        "MessageHandler"
    }
}

/// Typed function-based handler
pub struct FunctionHandler<F, Req> {
    name: String,
    handler: F,
    _request: PhantomData<fn(Req)>,
}

impl<F, Req> FunctionHandler<F, Req> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
            _request: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> MessageHandler for FunctionHandler<F, Req>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value> {
        let request: Req = serde_json::from_value(payload)
            .map_err(|e| RabbitRpcError::handler(KIND_INVALID_PAYLOAD, e))?;
        let response = (self.handler)(request).await?;
        Ok(serde_json::to_value(response)?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// One (exchange, routing key, queue) → handler entry
#[derive(Clone)]
pub struct Binding {
    pub kind: HandlerKind,
    pub route: RouteContext,
    pub options: QueueOptions,
    handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("kind", &self.kind)
            .field("route", &self.route)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Registration table built at startup: which handler serves which
/// exchange/routing key, and through which queue
#[derive(Debug, Default)]
pub struct HandlerTable {
    bindings: Vec<Binding>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `routing_key` on `exchange` through a durable `queue`
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
        self.respond_with_options(routing_key, exchange, queue, QueueOptions::default(), handler)
    }

    pub fn respond_with_options<F, Fut, Req, Resp>(
        &mut self,
        routing_key: &str,
        exchange: &str,
        queue: &str,
        options: QueueOptions,
        handler: F,
    ) -> Result<&mut Self>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        let handler = Arc::new(FunctionHandler::new(routing_key, handler));
        self.register(
            HandlerKind::Rpc,
            RouteContext::new(routing_key, exchange, queue),
            options,
            handler,
        )?;
        Ok(self)
    }

    /// Receive notifications for `routing_key` on `exchange` through `queue`
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
        let handler = Arc::new(FunctionHandler::new(routing_key, handler));
        self.register(
            HandlerKind::Subscribe,
            RouteContext::new(routing_key, exchange, queue),
            options.queue_options(),
            handler,
        )?;
        Ok(self)
    }

    /// Add a binding. Rejects empty names, a second RPC handler for the same
    /// exchange/routing key, and reuse of a queue.
    pub fn register(
        &mut self,
        kind: HandlerKind,
        route: RouteContext,
        options: QueueOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if route.exchange.is_empty() || route.queue.is_empty() {
            return Err(RabbitRpcError::config_error(format!(
                "binding {} needs an exchange and a queue",
                route
            )));
        }
        if kind == HandlerKind::Rpc && route.routing_key.is_empty() {
            return Err(RabbitRpcError::config_error(format!(
                "RPC binding on '{}' needs a routing key",
                route.exchange
            )));
        }

        for existing in &self.bindings {
            if existing.route.queue == route.queue {
                return Err(RabbitRpcError::config_error(format!(
                    "queue '{}' is already bound to {}",
                    route.queue, existing.route
                )));
            }
            if kind == HandlerKind::Rpc
                && existing.kind == HandlerKind::Rpc
                && existing.route.exchange == route.exchange
                && existing.route.routing_key == route.routing_key
            {
                return Err(RabbitRpcError::config_error(format!(
                    "routing key '{}' already has an RPC handler on '{}'",
                    route.routing_key, route.exchange
                )));
            }
        }

        info!("Registered {:?} handler for {}", kind, route);
        self.bindings.push(Binding {
            kind,
            route,
            options,
            handler,
        });
        Ok(())
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Consumer tuning for [`RpcServer`]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Prefix of consumer tags
    pub service_name: String,
    /// Max in-flight messages per RPC queue
    pub prefetch: u16,
    /// Max in-flight messages per subscriber queue
    pub subscribe_prefetch: u16,
}

/// Owns the queue lifecycle of every binding in a [`HandlerTable`]
pub struct RpcServer {
    transport: TransportPtr,
    registry: Arc<ExchangeRegistry>,
    table: HandlerTable,
    config: ServerConfig,
}

impl RpcServer {
    pub fn new(
        transport: TransportPtr,
        registry: Arc<ExchangeRegistry>,
        table: HandlerTable,
        config: ServerConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            table,
            config,
        }
    }

    /// Assert exchanges, queues and bindings, then attach consumers.
    ///
    /// Every assertion runs before the first consumer starts, so a failure
    /// aborts startup without leaving the service half-wired.
    pub async fn start(self) -> Result<ServerHandle> {
        self.registry.declare(self.transport.as_ref()).await?;

        let mut asserted = Vec::with_capacity(self.table.len());
        for binding in self.table.bindings {
            let queue = assert_binding(self.transport.as_ref(), &self.registry, &binding).await?;
            asserted.push((binding, queue));
        }

        let mut tasks = Vec::with_capacity(asserted.len());
        let mut routes = Vec::with_capacity(asserted.len());
        for (binding, queue) in asserted {
            let prefetch = match binding.kind {
                HandlerKind::Rpc => self.config.prefetch,
                HandlerKind::Subscribe => self.config.subscribe_prefetch,
            }
            .max(1);
            let consumer_tag = format!(
                "{}-{}-{}",
                self.config.service_name,
                queue,
                Uuid::new_v4().simple()
            );
            let deliveries = self
                .transport
                .consume(&queue, &consumer_tag, prefetch)
                .await
                .map_err(|e| policy::assertion_failure(&binding.route, &queue, e))?;

            routes.push(binding.route.clone());
            tasks.push(tokio::spawn(consume(
                deliveries,
                self.transport.clone(),
                Arc::new(binding),
                prefetch,
            )));
        }

        info!(
            "Service {} is consuming {} queue(s)",
            self.config.service_name,
            tasks.len()
        );
        Ok(ServerHandle { tasks, routes })
    }
}

async fn assert_binding(
    transport: &dyn Transport,
    registry: &ExchangeRegistry,
    binding: &Binding,
) -> Result<String> {
    let ctx = &binding.route;
    if !registry.contains(&ctx.exchange) {
        return Err(policy::assertion_failure(
            ctx,
            &ctx.queue,
            RabbitRpcError::config_error(format!("exchange '{}' is not registered", ctx.exchange)),
        ));
    }

    let queue = transport
        .declare_queue(&ctx.queue, &binding.options)
        .await
        .map_err(|e| policy::assertion_failure(ctx, &ctx.queue, e))?;
    transport
        .bind_queue(&queue, &ctx.exchange, &ctx.routing_key)
        .await
        .map_err(|e| policy::assertion_failure(ctx, &queue, e))?;

    debug!("Asserted queue {} for {}", queue, ctx);
    Ok(queue)
}

/// Consumer loop: each delivery runs as its own task, at most `prefetch` at
/// a time. Returns a transport error once the stream ends.
async fn consume(
    mut deliveries: DeliveryStream,
    transport: TransportPtr,
    binding: Arc<Binding>,
    prefetch: u16,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(prefetch as usize));
    info!("Consumer started for {}", binding.route);

    while let Some(next) = deliveries.next().await {
        match next {
            Ok(delivery) => {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let transport = transport.clone();
                let binding = binding.clone();
                tokio::spawn(async move {
                    process_delivery(transport.as_ref(), &binding, delivery).await;
                    drop(permit);
                });
            }
            Err(e) => {
                error!(queue = %binding.route.queue, "Error receiving message: {}", e);
            }
        }
    }

    warn!("Consumer stopped for {}", binding.route);
    Err(RabbitRpcError::transport(format!(
        "consumer for queue '{}' closed",
        binding.route.queue
    )))
}

/// Run one message through its handler and settle it
pub(crate) async fn process_delivery(
    transport: &dyn Transport,
    binding: &Binding,
    delivery: Delivery,
) -> MessageState {
    let ctx = &binding.route;
    debug!(state = ?MessageState::Received, route = %ctx, redelivered = delivery.redelivered);

    let reply_to = match binding.kind {
        HandlerKind::Rpc => delivery.properties.reply_to.clone(),
        HandlerKind::Subscribe => None,
    };

    let envelope = match Envelope::from_bytes(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            let cause = RabbitRpcError::handler(KIND_INVALID_PAYLOAD, e.reply_message());
            if let (Some(reply_to), Some(id)) = (&reply_to, &delivery.properties.correlation_id) {
                send_reply(transport, ctx, reply_to, ReplyEnvelope::failure(id, ErrorBody::from(&cause))).await;
            }
            return policy::reject(ctx, &delivery, &cause).await;
        }
    };
    let correlation_id = delivery
        .properties
        .correlation_id
        .clone()
        .or_else(|| envelope.correlation_id.clone());

    debug!(state = ?MessageState::Processing, route = %ctx, correlation_id = ?correlation_id);
    let started = Instant::now();
    let outcome = match AssertUnwindSafe(binding.handler.handle(envelope.payload))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(RabbitRpcError::internal(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };

    let reply = match (&reply_to, &correlation_id) {
        (Some(reply_to), Some(id)) => Some((reply_to, id)),
        _ => None,
    };

    match outcome {
        Ok(value) => {
            if let Some((reply_to, id)) = reply {
                send_reply(transport, ctx, reply_to, ReplyEnvelope::success(id, value)).await;
            }
            debug!("Handled {} in {}ms", ctx, started.elapsed().as_millis());
            policy::acknowledge(ctx, &delivery).await
        }
        Err(e) => {
            if let Some((reply_to, id)) = reply {
                send_reply(transport, ctx, reply_to, ReplyEnvelope::failure(id, ErrorBody::from(&e))).await;
            }
            policy::reject(ctx, &delivery, &e).await
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Publish a reply through the default exchange. A failed reply publish is
/// logged only; the waiting caller will time out.
async fn send_reply(transport: &dyn Transport, ctx: &RouteContext, reply_to: &str, reply: ReplyEnvelope) {
    let properties = MessageProperties::reply(reply.correlation_id.clone());
    let result = match reply.to_bytes() {
        Ok(body) => transport.publish("", reply_to, body, properties).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(
            exchange = %ctx.exchange,
            routing_key = %ctx.routing_key,
            reply_to = %reply_to,
            error = %e,
            "Failed to publish reply"
        );
    }
}

/// Running consumers of an [`RpcServer`]
#[derive(Debug)]
pub struct ServerHandle {
    tasks: Vec<JoinHandle<Result<()>>>,
    routes: Vec<RouteContext>,
}

impl ServerHandle {
    /// Bindings that have a live consumer
    pub fn routes(&self) -> &[RouteContext] {
        &self.routes
    }

    /// Wait until a consumer stops and return its error
    pub async fn wait(self) -> Result<()> {
        let consumers = self.tasks.into_iter().map(|task| async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(RabbitRpcError::from(e)),
            }
        });
        futures_util::future::try_join_all(consumers).await?;
        Ok(())
    }

    /// Stop every consumer loop
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
