use rabbitrpc::RabbitRpcError;
use thiserror::Error;

/// Persistence collaborator failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// A unique field already holds this value
    #[error("Duplicate value for {field}: {value}")]
    Duplicate { field: &'static str, value: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for RabbitRpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { .. } => RabbitRpcError::conflict(err),
        }
    }
}

/// Cache collaborator failures. Callers log these and carry on.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache value for '{key}' is unreadable: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
