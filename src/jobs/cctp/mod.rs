//! CCTP burn, attest, mint settlement
//!
//! A transfer starts once the burn is mined on the source chain. From there:
//! 1. [`CheckCctpAttestationManager`] polls the attestation service, re-adding
//!    itself with a delay while the attestation is pending
//! 2. [`ExecuteCctpMintManager`] relays the message and attestation to the
//!    destination chain's message transmitter
//! 3. [`CctpDestinationSwapManager`] optionally swaps the minted funds into the
//!    token the transfer was originally meant to deliver

pub mod attestation;
pub mod destination_swap;
pub mod mint;

pub use attestation::CheckCctpAttestationManager;
pub use destination_swap::{CctpDestinationSwapManager, DestinationSwapData};
pub use mint::ExecuteCctpMintManager;

use crate::error::SettlementResult;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token the transfer was meant to deliver before bridging through USDC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDescriptor {
    pub address: Address,
    pub chain_id: u32,
    pub decimals: u8,
}

/// Swap to run on the destination chain once the mint lands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSwapContext {
    /// Prepared swap quote, carried opaquely
    pub swap_quote: Value,
    pub wallet_address: Address,
    pub original_output_token: TokenDescriptor,
}

/// Payload threaded through the attestation and mint jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CctpTransfer {
    pub destination_chain_id: u32,
    pub message_hash: B256,
    pub message_body: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_swap_context: Option<DestinationSwapContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Mint transaction already submitted for this transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
}

impl CctpTransfer {
    pub fn chain_id(&self) -> u64 {
        self.destination_chain_id as u64
    }

    pub fn correlation(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or("-")
    }
}

/// Attestation service answer for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AttestationStatus {
    Pending,
    Complete { attestation: Bytes },
}

impl AttestationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AttestationStatus::Pending => "pending",
            AttestationStatus::Complete { .. } => "complete",
        }
    }
}

/// Fetches attestations for burned messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttestationFetcher: Send + Sync {
    async fn fetch(&self, message_hash: B256) -> SettlementResult<AttestationStatus>;
}

/// Relays attested messages on the destination chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MintExecutor: Send + Sync {
    /// Submit `receiveMessage` and return the transaction hash without waiting
    async fn mint(&self, chain_id: u64, message_body: Bytes, attestation: Bytes)
        -> SettlementResult<B256>;

    /// Wait until the transaction is mined; a revert is an error
    async fn wait_for_receipt(&self, chain_id: u64, tx_hash: B256) -> SettlementResult<()>;
}

/// Outcome of a destination swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapExecution {
    pub tx_hash: B256,
    pub final_amount: U256,
}

/// Runs a prepared swap quote from the given wallet
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DestinationSwapExecutor: Send + Sync {
    async fn execute_swap(
        &self,
        chain_id: u64,
        wallet: Address,
        quote: Value,
    ) -> SettlementResult<SwapExecution>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy_primitives::{address, b256, bytes};
    use serde_json::json;

    pub(crate) fn transfer() -> CctpTransfer {
        CctpTransfer {
            destination_chain_id: 8453,
            message_hash: b256!("abc0000000000000000000000000000000000000000000000000000000000abc"),
            message_body: bytes!("0102"),
            attestation: None,
            destination_swap_context: None,
            correlation_id: Some("rebalance-1".to_string()),
            tx_hash: None,
        }
    }

    pub(crate) fn swap_context() -> DestinationSwapContext {
        DestinationSwapContext {
            swap_quote: json!({ "id": "quote-1", "fromAmount": "1000000" }),
            wallet_address: address!("1111111111111111111111111111111111111111"),
            original_output_token: TokenDescriptor {
                address: address!("2222222222222222222222222222222222222222"),
                chain_id: 8453,
                decimals: 6,
            },
        }
    }

    #[test]
    fn test_transfer_payload_uses_camel_case_hex() {
        let value = serde_json::to_value(transfer()).unwrap();
        assert_eq!(value["destinationChainId"], 8453);
        assert_eq!(value["messageBody"], "0x0102");
        assert!(value["messageHash"].as_str().unwrap().starts_with("0xabc"));
        assert!(value.get("attestation").is_none());
    }

    #[test]
    fn test_attestation_status_wire_format() {
        let pending: AttestationStatus = serde_json::from_value(json!({ "status": "pending" })).unwrap();
        assert_eq!(pending, AttestationStatus::Pending);

        let complete: AttestationStatus =
            serde_json::from_value(json!({ "status": "complete", "attestation": "0xdead" })).unwrap();
        assert_eq!(
            complete,
            AttestationStatus::Complete { attestation: bytes!("dead") }
        );
    }
}
