//! Error types for the operator.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by provider clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Resource does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider asked us to back off.
    #[error("throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// Conflicting operation already in progress on the resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other request or transport failure.
    #[error("request failed: {0}")]
    Request(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Errors constructing or using the node config encrypter.
#[derive(Debug, Error, PartialEq)]
pub enum EncrypterError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid initial vector length: expected {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Top-level operator error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("encrypter: {0}")]
    Encrypter(#[from] EncrypterError),

    /// Invalid or missing configuration.
    #[error("config: {0}")]
    Config(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Provider error behind this error, if any.
    pub fn provider(&self) -> Option<&ProviderError> {
        match self {
            Error::Provider(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for operator operations.
pub type Result<T> = std::result::Result<T, Error>;
