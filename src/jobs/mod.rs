//! Job kinds and the manager contract
//!
//! Every job kind the relayer knows is a [`JobName`] variant. A processor
//! dispatches a claimed job to the single [`JobManager`] that recognizes it;
//! names outside the enum are configuration errors and are never retried.

pub mod balances;
pub mod cctp;
pub mod intents;

use crate::error::{SettlementError, SettlementResult};
use crate::queue::{Job, WorkQueue};
use crate::services::Services;

use alloy_primitives::{keccak256, B256};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Closed set of job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobName {
    CheckCctpAttestation,
    ExecuteCctpMint,
    CctpDestinationSwap,
    CheckSendBatch,
    CheckWithdraws,
    ExecuteSendBatch,
    ExecuteWithdraws,
    CheckBalances,
}

impl JobName {
    pub const ALL: [JobName; 8] = [
        JobName::CheckCctpAttestation,
        JobName::ExecuteCctpMint,
        JobName::CctpDestinationSwap,
        JobName::CheckSendBatch,
        JobName::CheckWithdraws,
        JobName::ExecuteSendBatch,
        JobName::ExecuteWithdraws,
        JobName::CheckBalances,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::CheckCctpAttestation => "CHECK_CCTP_ATTESTATION",
            JobName::ExecuteCctpMint => "EXECUTE_CCTP_MINT",
            JobName::CctpDestinationSwap => "CCTP_DESTINATION_SWAP",
            JobName::CheckSendBatch => "CHECK_SEND_BATCH",
            JobName::CheckWithdraws => "CHECK_WITHDRAWS",
            JobName::ExecuteSendBatch => "EXECUTE_SEND_BATCH",
            JobName::ExecuteWithdraws => "EXECUTE_WITHDRAWS",
            JobName::CheckBalances => "CHECK_BALANCES",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobName::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SettlementError::UnknownJob {
                name: s.to_string(),
            })
    }
}

impl Job {
    /// Job kind, if the name is one the relayer knows
    pub fn kind(&self) -> Option<JobName> {
        self.name.parse().ok()
    }

    /// Correlation id threaded through multi-step transfers
    pub fn correlation_id(&self) -> Option<&str> {
        self.data_str("correlationId")
    }
}

/// What a job manager can reach while running
pub trait ProcessorContext: Send + Sync {
    /// Queue the processor pulls from; follow-up jobs go here
    fn queue(&self) -> &dyn WorkQueue;

    /// Shared business services
    fn services(&self) -> &Services;
}

/// Strategy for one job kind
#[async_trait]
pub trait JobManager: Send + Sync {
    fn kind(&self) -> JobName;

    fn recognizes(&self, job: &Job) -> bool {
        job.kind() == Some(self.kind())
    }

    /// Run the job's action. The returned value becomes the job's return value.
    async fn execute(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value>;

    /// Chain follow-up work after a successful execution
    async fn on_success(&self, _job: &Job, _ctx: &dyn ProcessorContext) -> SettlementResult<()> {
        Ok(())
    }

    /// Observe a failed attempt. `terminal` is set once no retry will follow.
    async fn on_failure(
        &self,
        job: &Job,
        _ctx: &dyn ProcessorContext,
        err: &SettlementError,
        terminal: bool,
    ) {
        error!(
            "{} job {} failed (attempt {}, terminal: {}): {}",
            job.name,
            job.id,
            job.attempts_made + 1,
            terminal,
            err
        );
    }
}

/// `<action>-<hash>-<chainId>`
pub fn single_item_job_id(action: &str, hash: &B256, chain_id: u64) -> String {
    format!("{}-{}-{}", action, hash, chain_id)
}

/// keccak256 over the packed hashes, in the order given
pub fn batch_job_id(hashes: &[B256]) -> String {
    let mut packed = Vec::with_capacity(hashes.len() * 32);
    for hash in hashes {
        packed.extend_from_slice(hash.as_slice());
    }
    keccak256(&packed).to_string()
}

/// Managers served by the liquidity queue
pub fn liquidity_managers(attestation_repoll_delay: Duration) -> Vec<Arc<dyn JobManager>> {
    vec![
        Arc::new(cctp::CheckCctpAttestationManager::new(attestation_repoll_delay)),
        Arc::new(cctp::ExecuteCctpMintManager),
        Arc::new(cctp::CctpDestinationSwapManager),
        Arc::new(balances::CheckBalancesManager),
    ]
}

/// Managers served by the intent-processor queue
pub fn intent_processor_managers() -> Vec<Arc<dyn JobManager>> {
    vec![
        Arc::new(intents::CheckSendBatchManager),
        Arc::new(intents::CheckWithdrawsManager),
        Arc::new(intents::ExecuteSendBatchManager),
        Arc::new(intents::ExecuteWithdrawsManager),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobOptions;
    use alloy_primitives::b256;
    use serde_json::json;

    fn job_named(name: &str) -> Job {
        Job {
            id: "1".to_string(),
            name: name.to_string(),
            data: json!({ "correlationId": "c-1" }),
            options: JobOptions::default(),
            attempts_made: 0,
            returnvalue: None,
        }
    }

    #[test]
    fn test_job_names_round_trip() {
        for kind in JobName::ALL {
            assert_eq!(kind.as_str().parse::<JobName>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_name_is_configuration_error() {
        let err = "REBALANCE".parse::<JobName>().unwrap_err();
        assert!(matches!(err, SettlementError::UnknownJob { .. }));
        assert!(!err.is_retryable());
        assert_eq!(job_named("REBALANCE").kind(), None);
    }

    #[test]
    fn test_correlation_id_read_from_payload() {
        assert_eq!(job_named("EXECUTE_CCTP_MINT").correlation_id(), Some("c-1"));
    }

    #[test]
    fn test_single_item_job_id_format() {
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000ab");
        assert_eq!(
            single_item_job_id("execute-cctp-mint", &hash, 8453),
            "execute-cctp-mint-0x00000000000000000000000000000000000000000000000000000000000000ab-8453"
        );
    }

    #[test]
    fn test_batch_job_id_is_order_sensitive() {
        let one = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let two = b256!("0000000000000000000000000000000000000000000000000000000000000002");

        assert_eq!(batch_job_id(&[one, two]), batch_job_id(&[one, two]));
        assert_ne!(batch_job_id(&[one, two]), batch_job_id(&[two, one]));
    }

    #[test]
    fn test_batch_job_id_matches_packed_keccak() {
        let one = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        assert_eq!(batch_job_id(&[one]), keccak256(one).to_string());
    }

    #[test]
    fn test_queue_manager_sets_partition_job_kinds() {
        let mut kinds: Vec<JobName> = liquidity_managers(Duration::from_secs(30))
            .iter()
            .chain(intent_processor_managers().iter())
            .map(|m| m.kind())
            .collect();
        let total = kinds.len();
        kinds.sort_by_key(|k| k.as_str());
        kinds.dedup();

        assert_eq!(kinds.len(), total);
        assert_eq!(kinds.len(), JobName::ALL.len());
    }

    #[test]
    fn test_each_job_recognized_by_exactly_one_manager() {
        let managers = liquidity_managers(Duration::from_secs(30));
        for kind in JobName::ALL {
            let job = job_named(kind.as_str());
            let matches = managers.iter().filter(|m| m.recognizes(&job)).count();
            assert!(matches <= 1, "{} matched {} managers", kind, matches);
        }
    }
}
