//! Mint job: relay an attested message on the destination chain

use super::destination_swap::{CctpDestinationSwapManager, DestinationSwapData};
use super::CctpTransfer;
use crate::error::{SettlementError, SettlementResult};
use crate::jobs::{single_item_job_id, JobManager, JobName, ProcessorContext};
use crate::queue::{AddOutcome, Backoff, Job, JobOptions, NewJob, WorkQueue};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

const MINT_ACTION: &str = "execute-cctp-mint";

pub struct ExecuteCctpMintManager;

impl ExecuteCctpMintManager {
    /// Deterministic id: one mint per message and destination chain
    pub fn job_id(transfer: &CctpTransfer) -> String {
        single_item_job_id(MINT_ACTION, &transfer.message_hash, transfer.chain_id())
    }

    fn options(transfer: &CctpTransfer) -> JobOptions {
        JobOptions::default()
            .with_job_id(Self::job_id(transfer))
            .with_attempts(3)
            .with_backoff(Backoff::exponential(10_000))
            .remove_on_fail(false)
    }

    pub async fn start(
        queue: &dyn WorkQueue,
        transfer: &CctpTransfer,
    ) -> SettlementResult<AddOutcome> {
        let job = NewJob::from_payload(
            JobName::ExecuteCctpMint.as_str(),
            transfer,
            Self::options(transfer),
        )?;
        queue.add(job).await
    }
}

#[async_trait]
impl JobManager for ExecuteCctpMintManager {
    fn kind(&self) -> JobName {
        JobName::ExecuteCctpMint
    }

    async fn execute(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value> {
        let mut transfer: CctpTransfer = job.payload()?;
        let mints = ctx.services().mints()?;

        // a previous attempt already submitted the mint
        if let Some(tx_hash) = transfer.tx_hash {
            info!(
                "[{}] reusing mint transaction {} for {}",
                transfer.correlation(),
                tx_hash,
                transfer.message_hash
            );
            mints.wait_for_receipt(transfer.chain_id(), tx_hash).await?;
            return Ok(json!({ "txHash": tx_hash }));
        }

        let attestation = transfer
            .attestation
            .clone()
            .ok_or_else(|| SettlementError::InvalidPayload {
                name: job.name.clone(),
                message: format!("no attestation for message {}", transfer.message_hash),
            })?;

        let tx_hash = mints
            .mint(
                transfer.chain_id(),
                transfer.message_body.clone(),
                attestation,
            )
            .await?;
        info!(
            "[{}] mint submitted on chain {}: {}",
            transfer.correlation(),
            transfer.destination_chain_id,
            tx_hash
        );

        transfer.tx_hash = Some(tx_hash);
        ctx.queue()
            .update_data(&job.id, serde_json::to_value(&transfer)?)
            .await?;

        mints.wait_for_receipt(transfer.chain_id(), tx_hash).await?;
        Ok(json!({ "txHash": tx_hash }))
    }

    async fn on_success(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<()> {
        let transfer: CctpTransfer = job.payload()?;
        info!(
            "[{}] mint complete for {} on chain {}",
            transfer.correlation(),
            transfer.message_hash,
            transfer.destination_chain_id
        );

        let Some(swap) = transfer.destination_swap_context.clone() else {
            return Ok(());
        };

        let attestation = transfer
            .attestation
            .clone()
            .ok_or_else(|| SettlementError::InvalidPayload {
                name: job.name.clone(),
                message: "destination swap needs the attestation".to_string(),
            })?;

        let mint_tx_hash = job
            .returnvalue
            .as_ref()
            .and_then(|v| v.get("txHash"))
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let data = DestinationSwapData {
            message_hash: transfer.message_hash,
            message_body: Some(transfer.message_body.clone()),
            attestation,
            destination_chain_id: transfer.destination_chain_id,
            swap_quote: swap.swap_quote,
            wallet_address: swap.wallet_address,
            original_output_token: swap.original_output_token,
            mint_tx_hash,
            correlation_id: transfer.correlation_id.clone(),
        };

        info!(
            "[{}] scheduling destination swap for wallet {}",
            transfer.correlation(),
            data.wallet_address
        );
        CctpDestinationSwapManager::start(ctx.queue(), &data).await?;
        Ok(())
    }

    async fn on_failure(
        &self,
        job: &Job,
        _ctx: &dyn ProcessorContext,
        err: &SettlementError,
        terminal: bool,
    ) {
        let Ok(transfer) = job.payload::<CctpTransfer>() else {
            error!("Mint job {} failed with unreadable payload: {}", job.id, err);
            return;
        };

        let swap_pending = transfer.destination_swap_context.is_some();
        if needs_alert(err, terminal) {
            error!(
                "[{}] MINT ALERT: chain {}, message {}, tx {:?}, swap pending: {}, attempt {}/{}, terminal: {}: {}",
                transfer.correlation(),
                transfer.destination_chain_id,
                transfer.message_hash,
                transfer.tx_hash,
                swap_pending,
                job.attempts_made + 1,
                job.options.attempts,
                terminal,
                err
            );
        } else {
            warn!(
                "[{}] mint attempt failed: chain {}, message {}, swap pending: {}, attempt {}/{}: {}",
                transfer.correlation(),
                transfer.destination_chain_id,
                transfer.message_hash,
                swap_pending,
                job.attempts_made + 1,
                job.options.attempts,
                err
            );
        }
    }
}

/// Exhausted mints and reverted mint transactions are both alert-worthy
fn needs_alert(err: &SettlementError, terminal: bool) -> bool {
    terminal || err.should_alert()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::cctp::tests::{swap_context, transfer};
    use crate::jobs::cctp::MockMintExecutor;
    use crate::processor::{handle_job, Processor};
    use crate::queue::{JobState, MemoryQueue};
    use crate::services::Services;
    use alloy_primitives::{b256, bytes, B256};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const MINT_TX: B256 = b256!("1000000000000000000000000000000000000000000000000000000000000001");

    fn attested() -> CctpTransfer {
        let mut transfer = transfer();
        transfer.attestation = Some(bytes!("dead"));
        transfer
    }

    fn processor_with(queue: Arc<MemoryQueue>, mints: MockMintExecutor) -> Processor {
        Processor::new(
            queue,
            vec![
                Arc::new(ExecuteCctpMintManager) as Arc<dyn JobManager>,
                Arc::new(CctpDestinationSwapManager),
            ],
            Services::default().with_mints(Arc::new(mints)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_mint_collapses_to_one_entry() {
        let queue = MemoryQueue::new("liquidity");

        let first = ExecuteCctpMintManager::start(&queue, &attested()).await.unwrap();
        let second = ExecuteCctpMintManager::start(&queue, &attested()).await.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.job_id(), second.job_id());
        assert!(first.job_id().starts_with("execute-cctp-mint-0xabc"));
        assert!(first.job_id().ends_with("-8453"));
        assert_eq!(queue.jobs_named("EXECUTE_CCTP_MINT").await.len(), 1);
    }

    #[tokio::test]
    async fn test_mint_records_tx_hash_and_completes() {
        let queue = Arc::new(MemoryQueue::new("liquidity"));
        let mut mints = MockMintExecutor::new();
        mints
            .expect_mint()
            .times(1)
            .returning(|chain_id, body, attestation| {
                assert_eq!(chain_id, 8453);
                assert_eq!(body, bytes!("0102"));
                assert_eq!(attestation, bytes!("dead"));
                Ok(MINT_TX)
            });
        mints.expect_wait_for_receipt().times(1).returning(|_, _| Ok(()));
        let processor = processor_with(queue.clone(), mints);

        let added = ExecuteCctpMintManager::start(queue.as_ref(), &attested()).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        handle_job(&processor, job).await;

        let (stored, state) = queue.get(added.job_id()).await.unwrap();
        assert_eq!(state, JobState::Completed);
        assert_eq!(stored.data["txHash"], serde_json::to_value(MINT_TX).unwrap());
        assert!(queue.jobs_named("CCTP_DESTINATION_SWAP").await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_waits_on_submitted_tx_instead_of_minting_again() {
        let queue = Arc::new(MemoryQueue::new("liquidity"));
        let waits = Arc::new(AtomicUsize::new(0));
        let counter = waits.clone();

        let mut mints = MockMintExecutor::new();
        mints.expect_mint().times(1).returning(|_, _, _| Ok(MINT_TX));
        mints.expect_wait_for_receipt().returning(move |_, tx_hash| {
            assert_eq!(tx_hash, MINT_TX);
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Err(SettlementError::Timeout {
                    operation: "mint receipt".to_string(),
                }),
                _ => Ok(()),
            }
        });
        let processor = processor_with(queue.clone(), mints);

        let added = ExecuteCctpMintManager::start(queue.as_ref(), &attested()).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        handle_job(&processor, job).await;

        queue.promote().await;
        let retry = queue.claim().await.unwrap().unwrap();
        assert_eq!(retry.attempts_made, 1);
        handle_job(&processor, retry).await;

        assert_eq!(waits.load(Ordering::SeqCst), 2);
        let (_, state) = queue.get(added.job_id()).await.unwrap();
        assert_eq!(state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_swap_context_chains_exactly_one_destination_swap() {
        let queue = Arc::new(MemoryQueue::new("liquidity"));
        let mut mints = MockMintExecutor::new();
        mints.expect_mint().returning(|_, _, _| Ok(MINT_TX));
        mints.expect_wait_for_receipt().returning(|_, _| Ok(()));
        let processor = processor_with(queue.clone(), mints);

        let mut transfer = attested();
        transfer.destination_swap_context = Some(swap_context());
        ExecuteCctpMintManager::start(queue.as_ref(), &transfer).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        handle_job(&processor, job).await;

        let swaps = queue.jobs_named("CCTP_DESTINATION_SWAP").await;
        assert_eq!(swaps.len(), 1);
        let swap: DestinationSwapData = swaps[0].0.payload().unwrap();
        assert_eq!(swap.attestation, bytes!("dead"));
        assert_eq!(swap.message_hash, transfer.message_hash);
        assert_eq!(swap.wallet_address, swap_context().wallet_address);
        assert_eq!(swap.mint_tx_hash, Some(MINT_TX));
        assert_eq!(swap.correlation_id.as_deref(), Some("rebalance-1"));
    }

    #[test]
    fn test_reverted_mint_alerts_before_last_attempt() {
        let reverted = SettlementError::TransactionReverted {
            chain_id: 8453,
            tx_hash: MINT_TX.to_string(),
        };
        assert!(needs_alert(&reverted, false));

        let timeout = SettlementError::Timeout {
            operation: "mint receipt".to_string(),
        };
        assert!(!needs_alert(&timeout, false));
        assert!(needs_alert(&timeout, true));
    }

    #[tokio::test]
    async fn test_missing_attestation_is_not_retried() {
        let queue = Arc::new(MemoryQueue::new("liquidity"));
        let processor = processor_with(queue.clone(), MockMintExecutor::new());

        let added = ExecuteCctpMintManager::start(queue.as_ref(), &transfer()).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        handle_job(&processor, job).await;

        let (_, state) = queue.get(added.job_id()).await.unwrap();
        assert_eq!(state, JobState::Failed);
    }
}
