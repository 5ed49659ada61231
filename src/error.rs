//! Error types for the federator

use thiserror::Error;

/// Main error type for the federator
#[derive(Error, Debug)]
pub enum FederatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC error on chain {chain_id}: {message}")]
    Rpc { chain_id: u64, message: String },

    #[error("Timeout on chain {chain_id} waiting for {operation}")]
    RpcTimeout { chain_id: u64, operation: String },

    #[error("Confirmation policy error: {0}")]
    Policy(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Transfer {0} already processed")]
    AlreadyProcessed(String),

    #[error("Insufficient confirmations: have {have}, need {need}")]
    InsufficientConfirmations { have: u64, need: u64 },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Transaction reverted on chain {chain_id}: {reason}")]
    Reverted { chain_id: u64, reason: String },

    #[error("Transaction id mismatch: local {local}, destination {remote}")]
    IdentityMismatch { local: String, remote: String },

    #[error("Checkpoint storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FederatorError {
    /// Transient errors are retried on the next scheduled tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FederatorError::Rpc { .. }
                | FederatorError::RpcTimeout { .. }
                | FederatorError::Storage(_)
                | FederatorError::Database(_)
        )
    }

    /// Benign conditions never abort a batch
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            FederatorError::AlreadyProcessed(_) | FederatorError::InsufficientConfirmations { .. }
        )
    }

    /// Check if error should reach the operator alert sink
    pub fn should_alert(&self) -> bool {
        !self.is_benign()
    }

    /// Static label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            FederatorError::Config(_) => "config",
            FederatorError::Rpc { .. } => "rpc",
            FederatorError::RpcTimeout { .. } => "rpc_timeout",
            FederatorError::Policy(_) => "policy",
            FederatorError::InvalidEvent(_) => "invalid_event",
            FederatorError::AlreadyProcessed(_) => "already_processed",
            FederatorError::InsufficientConfirmations { .. } => "insufficient_confirmations",
            FederatorError::Signing(_) => "signing",
            FederatorError::Reverted { .. } => "reverted",
            FederatorError::IdentityMismatch { .. } => "identity_mismatch",
            FederatorError::Storage(_) => "storage",
            FederatorError::Database(_) => "database",
            FederatorError::Internal(_) => "internal",
        }
    }
}

/// Result type for federator operations
pub type FederatorResult<T> = Result<T, FederatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FederatorError::Rpc {
            chain_id: 30,
            message: "connection refused".into()
        }
        .is_transient());
        assert!(FederatorError::RpcTimeout {
            chain_id: 1,
            operation: "eth_getLogs".into()
        }
        .is_transient());
        assert!(!FederatorError::Signing("bad key".into()).is_transient());
        assert!(!FederatorError::Reverted {
            chain_id: 1,
            reason: "unknown token".into()
        }
        .is_transient());
    }

    #[test]
    fn test_benign_errors_do_not_alert() {
        let processed = FederatorError::AlreadyProcessed("0xab".into());
        assert!(processed.is_benign());
        assert!(!processed.should_alert());

        let waiting = FederatorError::InsufficientConfirmations { have: 5, need: 10 };
        assert!(waiting.is_benign());
        assert!(!waiting.should_alert());

        assert!(FederatorError::Policy("no table for chain 4".into()).should_alert());
    }
}
