use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Race condition: {0}")]
    RaceCondition(String),

    #[error("Unsupported derivation: {0}")]
    UnsupportedDerivation(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Bitcoin error: {0}")]
    Bitcoin(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Single-message validation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(vec![msg.into()])
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
