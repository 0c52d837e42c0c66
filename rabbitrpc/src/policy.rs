//! Error/recovery policy shared by RPC and subscriber bindings.
//!
//! Every inbound message moves `Received → Processing → {Acked | Rejected}`.
//! Handler failures are contained to their message: it is rejected without
//! requeue, since redelivering would fail the same way and could repeat
//! non-idempotent side effects. A queue configured with a dead-letter
//! exchange parks rejected messages there instead of dropping them.
//!
//! Queue/exchange assertion failures are a separate, boot-time condition:
//! logged with the full routing context and returned to abort the binding.

use serde::Serialize;
use std::fmt;
use tracing::{debug, error};

use crate::error::RabbitRpcError;
use crate::transport::Delivery;

/// Where a binding lives on the broker; attached to every policy log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteContext {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

impl RouteContext {
    pub fn new(
        routing_key: impl Into<String>,
        exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            queue: queue.into(),
        }
    }
}

impl fmt::Display for RouteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -> {}", self.exchange, self.routing_key, self.queue)
    }
}

/// Lifecycle of one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Processing,
    /// Handler succeeded; removed from the queue
    Acked,
    /// Handler failed; rejected with requeue disabled
    Rejected,
}

impl MessageState {
    /// Next state after processing finished with `success`
    pub fn settle(self, success: bool) -> Self {
        debug_assert_eq!(self, MessageState::Processing);
        if success {
            MessageState::Acked
        } else {
            MessageState::Rejected
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Acked | MessageState::Rejected)
    }
}

/// Acknowledge a successfully handled message
pub async fn acknowledge(ctx: &RouteContext, delivery: &Delivery) -> MessageState {
    if let Err(e) = delivery.ack().await {
        error!(
            exchange = %ctx.exchange,
            routing_key = %ctx.routing_key,
            queue = %ctx.queue,
            error = %e,
            "Failed to acknowledge message"
        );
    }
    MessageState::Processing.settle(true)
}

/// Log the failure with its routing context and reject the message without
/// requeueing it
pub async fn reject(ctx: &RouteContext, delivery: &Delivery, cause: &RabbitRpcError) -> MessageState {
    error!(
        routing_key = %ctx.routing_key,
        error = %cause,
        "Rabbit Error - {}",
        ctx.routing_key
    );
    debug!(
        exchange = %ctx.exchange,
        routing_key = %ctx.routing_key,
        queue = %ctx.queue,
        redelivered = delivery.redelivered,
        "Error Related Info"
    );

    if let Err(e) = delivery.reject(false).await {
        error!(
            queue = %ctx.queue,
            error = %e,
            "Failed to reject message"
        );
    }
    MessageState::Processing.settle(false)
}

/// Log a failed queue/exchange assertion and turn it into an
/// [`RabbitRpcError::Assertion`] naming the queue
pub fn assertion_failure(ctx: &RouteContext, queue_name: &str, cause: RabbitRpcError) -> RabbitRpcError {
    error!(
        routing_key = %ctx.routing_key,
        queue = %queue_name,
        error = %cause,
        "Rabbit Assert Error - {} - {}",
        ctx.routing_key,
        queue_name
    );
    debug!(
        exchange = %ctx.exchange,
        routing_key = %ctx.routing_key,
        queue = %ctx.queue,
        "Error Related Info"
    );

    RabbitRpcError::Assertion {
        exchange: ctx.exchange.clone(),
        routing_key: ctx.routing_key.clone(),
        queue: queue_name.to_string(),
        reason: cause.to_string(),
    }
}
