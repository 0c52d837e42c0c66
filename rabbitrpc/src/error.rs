use thiserror::Error;

/// Result type alias for rabbitrpc operations
pub type Result<T> = std::result::Result<T, RabbitRpcError>;

/// Handler error kind for a missing entity
pub const KIND_NOT_FOUND: &str = "not_found";
/// Handler error kind for a request the handler refuses to process
pub const KIND_INVALID: &str = "invalid";
/// Handler error kind for a request that conflicts with current state
pub const KIND_CONFLICT: &str = "conflict";
/// Handler error kind for unexpected failures inside a handler
pub const KIND_INTERNAL: &str = "internal";
/// Error kind replied when a request payload cannot be decoded
pub const KIND_INVALID_PAYLOAD: &str = "invalid_payload";

/// Error types for the RPC-over-broker framework
#[derive(Error, Debug)]
pub enum RabbitRpcError {
    /// AMQP client errors (connection or channel lost, protocol failures)
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// Connection/channel gone before the operation could complete
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker refused a channel-level operation
    #[error("Broker refused operation: {0}")]
    Broker(String),

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No reply arrived before the deadline. The remote side may still have
    /// completed the work, so the outcome is unknown.
    #[error("RPC call {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    /// The remote handler ran and reported a failure
    #[error("Remote error [{kind}]: {message}")]
    Remote { kind: String, message: String },

    /// Failure raised by a local handler; travels to the caller as `Remote`
    #[error("Handler error [{kind}]: {message}")]
    Handler { kind: String, message: String },

    /// Boot-time exchange/queue declaration failure
    #[error(
        "Failed to assert queue '{queue}' (exchange '{exchange}', routing key '{routing_key}'): {reason}"
    )]
    Assertion {
        exchange: String,
        routing_key: String,
        queue: String,
        reason: String,
    },

    /// Invalid message format or arguments
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// A correlation id was reused while still outstanding or recently abandoned
    #[error("Correlation id '{0}' is already in use")]
    DuplicateCorrelationId(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tokio join errors
    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<config::ConfigError> for RabbitRpcError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl RabbitRpcError {
    /// Create a handler error with an explicit kind
    pub fn handler(kind: impl Into<String>, message: impl ToString) -> Self {
        Self::Handler {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(message: impl ToString) -> Self {
        Self::handler(KIND_NOT_FOUND, message)
    }

    pub fn invalid(message: impl ToString) -> Self {
        Self::handler(KIND_INVALID, message)
    }

    pub fn conflict(message: impl ToString) -> Self {
        Self::handler(KIND_CONFLICT, message)
    }

    pub fn internal(message: impl ToString) -> Self {
        Self::handler(KIND_INTERNAL, message)
    }

    /// Create a new config error
    pub fn config_error<T: ToString>(message: T) -> Self {
        Self::Config(message.to_string())
    }

    /// Create a new transport error
    pub fn transport<T: ToString>(message: T) -> Self {
        Self::Transport(message.to_string())
    }

    /// Short, stable name of the error class. Used as the `kind` of error
    /// replies and in log fields.
    pub fn kind(&self) -> &str {
        match self {
            Self::Connection(_) | Self::Transport(_) => "transport",
            Self::Broker(_) => "broker",
            Self::Serialization(_) => "serialization",
            Self::Timeout { .. } => "timeout",
            Self::Remote { kind, .. } | Self::Handler { kind, .. } => kind,
            Self::Assertion { .. } => "assertion",
            Self::InvalidMessage { .. } => "invalid_message",
            Self::DuplicateCorrelationId(_) => "duplicate_correlation_id",
            Self::Config(_) => "config",
            Self::Join(_) => "internal",
        }
    }

    /// Message without the variant prefix, as carried in error replies
    pub fn reply_message(&self) -> String {
        match self {
            Self::Remote { message, .. } | Self::Handler { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Connection or channel level failure; never retried by the framework
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Transport(_) | Self::Broker(_)
        )
    }

    /// Ambiguous outcome: the remote side may or may not have completed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The remote handler executed and reported a failure
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Remote failure of kind `not_found`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote { kind, .. } if kind == KIND_NOT_FOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_and_transport_are_distinguishable() {
        let remote = RabbitRpcError::Remote {
            kind: KIND_NOT_FOUND.to_string(),
            message: "Product with ID p9 not found".to_string(),
        };
        assert!(remote.is_remote());
        assert!(remote.is_not_found());
        assert!(!remote.is_transport());

        let transport = RabbitRpcError::transport("connection reset");
        assert!(transport.is_transport());
        assert!(!transport.is_remote());
        assert_eq!(transport.kind(), "transport");
    }

    #[test]
    fn handler_kind_is_carried_verbatim() {
        let err = RabbitRpcError::conflict("stock changed");
        assert_eq!(err.kind(), KIND_CONFLICT);
        assert_eq!(err.reply_message(), "stock changed");
    }
}
