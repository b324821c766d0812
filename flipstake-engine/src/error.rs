use flipstake_core::FlipstakeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Core error: {0}")]
    Core(FlipstakeError),

    /// Network lookup failed or the transaction is not final yet. Nothing
    /// was mutated; the call may be repeated.
    #[error("Network temporarily unavailable: {0}")]
    TransientChain(String),

    #[error("{0}")]
    Validation(String),

    #[error("Wager {wager_id} is no longer available")]
    Conflict { wager_id: String },

    /// Settlement stopped after the outcome was recorded. The wager stays in
    /// `Settling` until it is recovered.
    #[error("Settlement of {wager_id} is pending: {reason}")]
    SettlementPending { wager_id: String, reason: String },

    #[error("Wager not found: {0}")]
    WagerNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<FlipstakeError> for EngineError {
    fn from(err: FlipstakeError) -> Self {
        match err {
            e if e.is_transient() => EngineError::TransientChain(e.to_string()),
            FlipstakeError::WagerNotFound { id } => EngineError::WagerNotFound(id),
            FlipstakeError::InvalidAddress(addr) => {
                EngineError::Validation(format!("invalid address: {}", addr))
            }
            FlipstakeError::InvalidSignature(sig) => {
                EngineError::Validation(format!("malformed signature: {}", sig))
            }
            e => EngineError::Core(e),
        }
    }
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn conflict(wager_id: impl Into<String>) -> Self {
        Self::Conflict {
            wager_id: wager_id.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientChain(_))
    }

    /// Message safe to show to a participant.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Conflict { .. } => "This wager is no longer available".to_string(),
            Self::TransientChain(_) => {
                "The network is not ready yet, please try again shortly".to_string()
            }
            Self::SettlementPending { wager_id, .. } => {
                format!("Wager {} is processing", wager_id)
            }
            Self::WagerNotFound(id) => format!("Wager {} was not found", id),
            Self::Core(_) | Self::Internal(_) => {
                "Something went wrong, please try again later".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_core_errors_map_to_transient() {
        let err: EngineError = FlipstakeError::chain_unavailable("timeout").into();
        assert!(err.is_transient());

        let err: EngineError = FlipstakeError::transfer("broadcast rejected").into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err: EngineError = FlipstakeError::vault("bad mac on key blob").into();
        assert!(!err.user_message().contains("mac"));

        let err = EngineError::SettlementPending {
            wager_id: "wager_abc".to_string(),
            reason: "broadcast rejected: missing inputs".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("wager_abc"));
        assert!(!msg.contains("missing inputs"));
    }

    #[test]
    fn test_validation_is_verbatim() {
        let err = EngineError::validation("signature already used");
        assert_eq!(err.user_message(), "signature already used");
        assert_eq!(err.to_string(), "signature already used");
    }
}
