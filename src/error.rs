//! Error types for the settlement relayer

use thiserror::Error;

/// Main error type for job orchestration and settlement
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No job manager registered for job {name}")]
    UnknownJob { name: String },

    #[error("Invalid payload for job {name}: {message}")]
    InvalidPayload { name: String, message: String },

    #[error("Service not configured: {0}")]
    MissingService(&'static str),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction {tx_hash} reverted on chain {chain_id}")]
    TransactionReverted { chain_id: u64, tx_hash: String },

    #[error("Attestation error: {0}")]
    Attestation(String),

    #[error("Indexer error: {0}")]
    Indexer(String),

    #[error("Destination swap error: {0}")]
    Swap(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// Check if the store should apply the job's retry policy.
    ///
    /// Configuration-class errors cannot be fixed by running the job again,
    /// so the job is dropped instead.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SettlementError::Config(_)
                | SettlementError::UnknownJob { .. }
                | SettlementError::InvalidPayload { .. }
                | SettlementError::MissingService(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SettlementError::TransactionReverted { .. } | SettlementError::Swap(_)
        )
    }
}

/// Result type for settlement operations
pub type SettlementResult<T> = Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_not_retryable() {
        let unknown = SettlementError::UnknownJob {
            name: "MYSTERY".to_string(),
        };
        assert!(!unknown.is_retryable());
        assert!(!SettlementError::MissingService("mint executor").is_retryable());
        assert!(!SettlementError::InvalidPayload {
            name: "EXECUTE_CCTP_MINT".to_string(),
            message: "missing attestation".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(SettlementError::Transaction("nonce too low".to_string()).is_retryable());
        assert!(SettlementError::ChainConnection {
            chain_id: 10,
            message: "connection reset".to_string(),
        }
        .is_retryable());
        assert!(SettlementError::Timeout {
            operation: "receipt".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_alerting_errors() {
        assert!(SettlementError::Swap("slippage".to_string()).should_alert());
        assert!(!SettlementError::Attestation("503".to_string()).should_alert());
    }
}
