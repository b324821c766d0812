use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlipstakeError>;

#[derive(Error, Debug)]
pub enum FlipstakeError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Vault error: {0}")]
    Vault(String),

    #[error("Esplora error: {0}")]
    Esplora(String),

    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Insufficient funds: need {need}, have {available}")]
    InsufficientFunds { need: u64, available: u64 },

    #[error("Wager not found: {id}")]
    WagerNotFound { id: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid transaction signature: {0}")]
    InvalidSignature(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlipstakeError {
    pub fn vault(msg: impl Into<String>) -> Self {
        Self::Vault(msg.into())
    }

    pub fn esplora(msg: impl Into<String>) -> Self {
        Self::Esplora(msg.into())
    }

    pub fn chain_unavailable(msg: impl Into<String>) -> Self {
        Self::ChainUnavailable(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Lookup failures that may succeed on a later attempt.
    ///
    /// Transfers are never classified as transient: a failed broadcast may
    /// still have reached the network, so it must not be resubmitted blindly.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Esplora(_) | Self::ChainUnavailable(_))
    }
}
