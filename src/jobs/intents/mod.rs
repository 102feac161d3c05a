//! Batched intent settlement: proving fulfilled intents back to their source
//! chain and withdrawing rewards for proven intents.

pub mod send_batch;
pub mod withdraws;

pub use send_batch::{CheckSendBatchManager, ExecuteSendBatchManager};
pub use withdraws::{CheckWithdrawsManager, ExecuteWithdrawsManager};

use crate::error::SettlementResult;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One fulfilled intent waiting to be proven
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProveItem {
    pub hash: B256,
    pub prover: Address,
    /// Chain the intent was created on
    pub source: u32,
}

/// Payload of an execute-send-batch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBatchData {
    /// Chain the proofs are sent from
    pub chain_id: u32,
    pub intent_source_address: Address,
    pub inbox: Address,
    pub proves: Vec<ProveItem>,
    /// Routes already proven by an earlier attempt of this job
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sent_routes: Vec<SentRoute>,
}

/// A `(prover, source)` route whose prove transaction was mined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentRoute {
    pub prover: Address,
    pub source: u32,
    pub tx_hash: B256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAmount {
    pub token: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub creator: Address,
    pub prover: Address,
    pub deadline: U256,
    pub native_value: U256,
    pub tokens: Vec<TokenAmount>,
}

/// One proven intent whose reward can be withdrawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawItem {
    pub route_hash: B256,
    /// Chain the intent was fulfilled on
    #[serde(default)]
    pub destination: u64,
    pub reward: Reward,
}

/// Payload of an execute-withdraws job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawsData {
    /// Chain holding the intent source
    pub chain_id: u32,
    pub intent_source_address: Address,
    pub intents: Vec<WithdrawItem>,
}

/// Prove as reported by the indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedProve {
    pub hash: B256,
    pub prover: Address,
    /// Source chain of the intent
    pub chain_id: u32,
    /// Chain the intent was fulfilled on
    pub destination_chain_id: u32,
}

/// Withdrawable intent as reported by the indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedWithdrawal {
    pub route_hash: B256,
    pub source: u64,
    pub destination: u64,
    pub reward: Reward,
}

/// Source of work for the batch scans
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchIndexer: Send + Sync {
    async fn next_sendable_batch(&self, intent_source: Address) -> SettlementResult<Vec<IndexedProve>>;

    async fn next_withdrawable_batch(
        &self,
        intent_source: Address,
    ) -> SettlementResult<Vec<IndexedWithdrawal>>;
}

/// Submits batch transactions and waits for them to be mined
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Prove `intent_hashes` from `chain_id` back to `source_domain` through `prover`
    async fn prove(
        &self,
        chain_id: u64,
        portal: Address,
        prover: Address,
        source_domain: u64,
        intent_hashes: Vec<B256>,
    ) -> SettlementResult<B256>;

    async fn batch_withdraw(
        &self,
        chain_id: u64,
        portal: Address,
        intents: Vec<WithdrawItem>,
    ) -> SettlementResult<B256>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy_primitives::{address, B256};
    use serde_json::json;

    pub(crate) fn hash(n: u8) -> B256 {
        B256::with_last_byte(n)
    }

    pub(crate) fn reward() -> Reward {
        Reward {
            creator: address!("3333333333333333333333333333333333333333"),
            prover: address!("4444444444444444444444444444444444444444"),
            deadline: U256::from(1_900_000_000u64),
            native_value: U256::ZERO,
            tokens: vec![TokenAmount {
                token: address!("5555555555555555555555555555555555555555"),
                amount: U256::from(10u64).pow(U256::from(24u64)),
            }],
        }
    }

    #[test]
    fn test_large_amounts_survive_serialization() {
        let item = WithdrawItem {
            route_hash: hash(1),
            destination: 10,
            reward: reward(),
        };
        let value = serde_json::to_value(&item).unwrap();
        let back: WithdrawItem = serde_json::from_value(value).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_send_batch_payload_field_names() {
        let data = SendBatchData {
            chain_id: 10,
            intent_source_address: address!("6666666666666666666666666666666666666666"),
            inbox: address!("7777777777777777777777777777777777777777"),
            proves: vec![ProveItem {
                hash: hash(1),
                prover: address!("4444444444444444444444444444444444444444"),
                source: 8453,
            }],
            sent_routes: Vec::new(),
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["chainId"], json!(10));
        assert!(value.get("intentSourceAddress").is_some());
        assert_eq!(value["proves"][0]["source"], json!(8453));
        assert!(value.get("sentRoutes").is_none());
    }
}
