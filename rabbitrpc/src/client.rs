use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::correlation::PendingCalls;
use crate::error::{RabbitRpcError, Result};
use crate::message::{Envelope, MessageProperties, ReplyEnvelope};
use crate::transport::{DeliveryStream, QueueOptions, TransportPtr};

/// Per-call overrides for [`RpcClient::request_with`]
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Caller-chosen correlation id; a fresh UUID when `None`
    pub correlation_id: Option<String>,
    /// Deadline for the reply; the client default when `None`
    pub timeout: Option<Duration>,
    /// Ask the broker to persist the request
    pub persistent: bool,
}

impl RequestOptions {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Turns the broker's fire-and-forget delivery into call/return.
///
/// Each client owns an exclusive reply queue and a dispatcher task that
/// matches replies to waiting callers by correlation id. Cloning is cheap and
/// clones share the reply queue.
///
/// ```rust,no_run
/// # use rabbitrpc::{MemoryTransport, RpcClient, RpcConfig};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() -> rabbitrpc::Result<()> {
/// let transport = Arc::new(MemoryTransport::new());
/// let client = RpcClient::start(transport, &RpcConfig::default()).await?;
/// let product: serde_json::Value = client.request("product.get", "product", &"p1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RpcClient {
    transport: TransportPtr,
    pending: PendingCalls,
    reply_queue: String,
    default_timeout: Duration,
    persistent: bool,
    listening: Arc<AtomicBool>,
}

impl RpcClient {
    /// Declare the reply queue and start dispatching replies
    pub async fn start(transport: TransportPtr, config: &RpcConfig) -> Result<Self> {
        let requested = format!("rabbitrpc.reply.{}", Uuid::new_v4());
        let reply_queue = transport
            .declare_queue(&requested, &QueueOptions::exclusive())
            .await?;
        let consumer_tag = format!("{}-replies", reply_queue);
        let replies = transport
            .consume(&reply_queue, &consumer_tag, config.prefetch_count)
            .await?;

        let client = Self {
            transport,
            pending: PendingCalls::new(config.correlation_grace()),
            reply_queue,
            default_timeout: config.request_timeout(),
            persistent: config.persistent_messages,
            listening: Arc::new(AtomicBool::new(true)),
        };

        tokio::spawn(dispatch_replies(
            replies,
            client.pending.clone(),
            client.listening.clone(),
            client.reply_queue.clone(),
        ));
        info!("RPC client ready, replies on {}", client.reply_queue);

        Ok(client)
    }

    /// Call `routing_key` on `exchange` and wait for the correlated reply
    pub async fn request<Req, Resp>(
        &self,
        routing_key: &str,
        exchange: &str,
        payload: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.request_with(routing_key, exchange, payload, RequestOptions::default())
            .await
    }

    /// Call with explicit options.
    ///
    /// Fails with:
    /// - `Remote` when the handler ran and reported an error,
    /// - `Timeout` when no reply arrived in time. The remote side may still
    ///   have done the work; check idempotently before retrying,
    /// - a transport error when the connection dropped before a reply.
    pub async fn request_with<Req, Resp>(
        &self,
        routing_key: &str,
        exchange: &str,
        payload: &Req,
        options: RequestOptions,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        if routing_key.is_empty() || exchange.is_empty() {
            return Err(RabbitRpcError::InvalidMessage {
                reason: "routing key and exchange must not be empty".to_string(),
            });
        }

        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout_duration = options.timeout.unwrap_or(self.default_timeout);
        let body = Envelope::request(exchange, routing_key, payload, &correlation_id)?.to_bytes()?;

        let (guard, response_rx) = self.pending.register(&correlation_id)?;
        if !self.is_listening() {
            return Err(RabbitRpcError::transport("reply consumer is not running"));
        }

        let properties = MessageProperties::request(&correlation_id, &self.reply_queue)
            .with_persistent(options.persistent || self.persistent);
        self.transport
            .publish(exchange, routing_key, body, properties)
            .await?;

        debug!(
            "Sent RPC request to {}/{} (correlation_id: {})",
            exchange, routing_key, correlation_id
        );

        let outcome = match timeout(timeout_duration, response_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RabbitRpcError::transport("response channel closed")),
            Err(_) => {
                warn!(
                    "RPC call {}/{} timed out (correlation_id: {})",
                    exchange, routing_key, correlation_id
                );
                Err(RabbitRpcError::Timeout {
                    correlation_id: correlation_id.clone(),
                    timeout_ms: timeout_duration.as_millis() as u64,
                })
            }
        };
        drop(guard);

        let value = outcome?.into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    /// Number of calls currently waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Whether the reply dispatcher is still running
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

/// Dispatch replies one at a time; replies are acknowledged after dispatch
async fn dispatch_replies(
    mut replies: DeliveryStream,
    pending: PendingCalls,
    listening: Arc<AtomicBool>,
    reply_queue: String,
) {
    debug!("Reply dispatcher started for {}", reply_queue);

    while let Some(next) = replies.next().await {
        match next {
            Ok(delivery) => {
                match ReplyEnvelope::from_bytes(&delivery.body) {
                    Ok(reply) => {
                        pending.resolve(reply);
                    }
                    Err(e) => {
                        error!("Error deserializing reply on {}: {}", reply_queue, e);
                    }
                }

                if let Err(e) = delivery.ack().await {
                    error!("Failed to acknowledge reply: {}", e);
                }
            }
            Err(e) => {
                error!("Error receiving reply: {}", e);
            }
        }
    }

    listening.store(false, Ordering::SeqCst);
    let failed = pending.fail_all("connection lost before a reply arrived");
    warn!(
        "Reply dispatcher stopped for {}; failed {} outstanding call(s)",
        reply_queue, failed
    );
}
