use serde::{Deserialize, Serialize};

use crate::error::{RabbitRpcError, Result};

/// Content type stamped on every message we publish
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Broker-level message properties, independent of the AMQP client in use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Token linking a reply to its request
    pub correlation_id: Option<String>,
    /// Queue the reply must be published to (via the default exchange)
    pub reply_to: Option<String>,
    /// Ask the broker to store the message on disk (delivery mode 2)
    pub persistent: bool,
    pub content_type: Option<String>,
}

impl MessageProperties {
    /// Properties of an outgoing RPC request
    pub fn request(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            persistent: false,
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
        }
    }

    /// Properties of a reply to `correlation_id`
    pub fn reply(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
            persistent: false,
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
        }
    }

    /// Properties of a fire-and-forget event
    pub fn event() -> Self {
        Self {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            ..Self::default()
        }
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Outbound message body for both RPC requests and events.
///
/// Wire shape: `{ "exchange", "routingKey", "payload", "correlationId" }`.
/// Events carry no correlation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Build an RPC request envelope
    pub fn request(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: &impl Serialize,
        correlation_id: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: serde_json::to_value(payload)?,
            correlation_id: Some(correlation_id.into()),
        })
    }

    /// Build a fire-and-forget event envelope
    pub fn event(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self> {
        Ok(Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: serde_json::to_value(payload)?,
            correlation_id: None,
        })
    }

    /// Serialize envelope to bytes for transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize envelope from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RabbitRpcError::InvalidMessage {
            reason: format!("undecodable envelope: {}", e),
        })
    }
}

/// Structured failure carried by an error reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&RabbitRpcError> for ErrorBody {
    fn from(err: &RabbitRpcError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.reply_message(),
        }
    }
}

impl From<ErrorBody> for RabbitRpcError {
    fn from(body: ErrorBody) -> Self {
        RabbitRpcError::Remote {
            kind: body.kind,
            message: body.message,
        }
    }
}

/// Reply body.
///
/// Wire shape: `{ "correlationId", "payload" }` on success or
/// `{ "correlationId", "error": { "kind", "message" } }` on remote failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ReplyEnvelope {
    pub fn success(correlation_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(correlation_id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RabbitRpcError::InvalidMessage {
            reason: format!("undecodable reply: {}", e),
        })
    }

    /// Success payload or the remote error. A `null` payload is omitted on the
    /// wire and comes back as `Value::Null`.
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.payload.unwrap_or(serde_json::Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_wire_shape() {
        let envelope = Envelope::request("product", "product.get", &"p1", "corr-1").unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(
            wire,
            json!({
                "exchange": "product",
                "routingKey": "product.get",
                "payload": "p1",
                "correlationId": "corr-1"
            })
        );
    }

    #[test]
    fn test_event_envelope_has_no_correlation_id() {
        let envelope = Envelope::event("order", "order.created", &json!({"orderId": "o1"})).unwrap();
        let wire = String::from_utf8(envelope.to_bytes().unwrap()).unwrap();
        assert!(!wire.contains("correlationId"));
    }

    #[test]
    fn test_error_reply_becomes_remote_error() {
        let reply = ReplyEnvelope::failure(
            "corr-2",
            ErrorBody {
                kind: "not_found".to_string(),
                message: "Product with ID p9 not found".to_string(),
            },
        );
        let decoded = ReplyEnvelope::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert!(decoded.is_error());

        let err = decoded.into_result().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_null_payload_reply() {
        let reply = ReplyEnvelope::success("corr-3", serde_json::Value::Null);
        let decoded = ReplyEnvelope::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.into_result().unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn test_garbage_is_invalid_message() {
        let err = Envelope::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, RabbitRpcError::InvalidMessage { .. }));
    }
}
