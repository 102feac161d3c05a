//! Destination swap after a CCTP mint

use super::TokenDescriptor;
use crate::error::{SettlementError, SettlementResult};
use crate::jobs::{JobManager, JobName, ProcessorContext};
use crate::queue::{AddOutcome, Backoff, Job, JobOptions, NewJob, WorkQueue};

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

/// Payload of the destination swap job. `walletAddress` is the group key on
/// the liquidity queue, so swaps for one wallet never run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSwapData {
    pub message_hash: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_body: Option<Bytes>,
    pub attestation: Bytes,
    pub destination_chain_id: u32,
    pub swap_quote: Value,
    pub wallet_address: Address,
    pub original_output_token: TokenDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint_tx_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

pub struct CctpDestinationSwapManager;

impl CctpDestinationSwapManager {
    fn options() -> JobOptions {
        JobOptions::default()
            .with_attempts(3)
            .with_backoff(Backoff::exponential(15_000))
            .remove_on_complete(true)
            // failed swaps stay visible for manual recovery
            .remove_on_fail(false)
    }

    pub async fn start(
        queue: &dyn WorkQueue,
        data: &DestinationSwapData,
    ) -> SettlementResult<AddOutcome> {
        let job = NewJob::from_payload(
            JobName::CctpDestinationSwap.as_str(),
            data,
            Self::options(),
        )?;
        queue.add(job).await
    }
}

#[async_trait]
impl JobManager for CctpDestinationSwapManager {
    fn kind(&self) -> JobName {
        JobName::CctpDestinationSwap
    }

    async fn execute(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value> {
        let data: DestinationSwapData = job.payload()?;
        debug!(
            "[{}] destination swap on chain {} for wallet {}",
            data.correlation_id.as_deref().unwrap_or("-"),
            data.destination_chain_id,
            data.wallet_address
        );

        let result = ctx
            .services()
            .destination_swaps()?
            .execute_swap(
                data.destination_chain_id as u64,
                data.wallet_address,
                data.swap_quote.clone(),
            )
            .await?;

        info!(
            "[{}] destination swap complete: tx {}, delivered {} of {}",
            data.correlation_id.as_deref().unwrap_or("-"),
            result.tx_hash,
            result.final_amount,
            data.original_output_token.address
        );

        Ok(json!({
            "txHash": result.tx_hash,
            "finalAmount": result.final_amount.to_string(),
        }))
    }

    async fn on_failure(
        &self,
        job: &Job,
        _ctx: &dyn ProcessorContext,
        err: &SettlementError,
        terminal: bool,
    ) {
        let Ok(data) = job.payload::<DestinationSwapData>() else {
            error!("Destination swap job {} failed with unreadable payload: {}", job.id, err);
            return;
        };

        error!(
            "STRANDED FUNDS ALERT: destination swap failed. wallet {}, chain {}, target token {}, \
             message {}, mint tx {:?}, amount {}, attempt {}/{}, terminal: {}: {}",
            data.wallet_address,
            data.destination_chain_id,
            data.original_output_token.address,
            data.message_hash,
            data.mint_tx_hash,
            data.swap_quote
                .get("fromAmount")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("?"),
            job.attempts_made + 1,
            job.options.attempts,
            terminal,
            err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::cctp::tests::{swap_context, transfer};
    use crate::jobs::cctp::{MockDestinationSwapExecutor, SwapExecution};
    use crate::processor::grouped::WALLET_ADDRESS_FIELD;
    use crate::processor::{handle_job, GroupedProcessor, JobProcessor, Processor};
    use crate::queue::{JobState, MemoryQueue};
    use crate::services::Services;
    use alloy_primitives::{b256, bytes, U256};
    use std::sync::Arc;
    use std::time::Duration;

    fn data() -> DestinationSwapData {
        let context = swap_context();
        DestinationSwapData {
            message_hash: transfer().message_hash,
            message_body: None,
            attestation: bytes!("dead"),
            destination_chain_id: 8453,
            swap_quote: context.swap_quote,
            wallet_address: context.wallet_address,
            original_output_token: context.original_output_token,
            mint_tx_hash: None,
            correlation_id: None,
        }
    }

    fn grouped_with(queue: Arc<MemoryQueue>, swaps: MockDestinationSwapExecutor) -> GroupedProcessor {
        let inner = Processor::new(
            queue,
            vec![Arc::new(CctpDestinationSwapManager) as Arc<dyn JobManager>],
            Services::default().with_destination_swaps(Arc::new(swaps)),
        )
        .unwrap();
        GroupedProcessor::new(inner, WALLET_ADDRESS_FIELD, Duration::from_secs(5))
    }

    #[test]
    fn test_wallet_address_is_top_level_group_key() {
        let value = serde_json::to_value(data()).unwrap();
        assert!(value.get("walletAddress").is_some());
    }

    #[tokio::test]
    async fn test_swap_returns_tx_hash_and_final_amount() {
        let queue = Arc::new(MemoryQueue::new("liquidity"));
        let mut swaps = MockDestinationSwapExecutor::new();
        swaps.expect_execute_swap().times(1).returning(|chain_id, _, quote| {
            assert_eq!(chain_id, 8453);
            assert_eq!(quote["id"], "quote-1");
            Ok(SwapExecution {
                tx_hash: b256!("2000000000000000000000000000000000000000000000000000000000000002"),
                final_amount: U256::from(998_500u64),
            })
        });
        let processor = grouped_with(queue.clone(), swaps);

        CctpDestinationSwapManager::start(queue.as_ref(), &data()).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        let outcome = processor.process(&job).await.unwrap();

        let value = outcome.into_returnvalue();
        assert_eq!(value["finalAmount"], "998500");
        assert!(value["txHash"].as_str().unwrap().starts_with("0x2"));
    }

    #[tokio::test]
    async fn test_failed_swap_is_kept_after_last_attempt() {
        let queue = Arc::new(MemoryQueue::new("liquidity"));
        let mut swaps = MockDestinationSwapExecutor::new();
        swaps
            .expect_execute_swap()
            .returning(|_, _, _| Err(SettlementError::Swap("quote expired".to_string())));
        let processor = grouped_with(queue.clone(), swaps);

        CctpDestinationSwapManager::start(queue.as_ref(), &data()).await.unwrap();
        for _ in 0..3 {
            queue.promote().await;
            let job = queue.claim().await.unwrap().unwrap();
            handle_job(&processor, job).await;
        }

        assert_eq!(queue.count_in_state(JobState::Failed).await, 1);
        assert!(processor.active_groups().await.is_empty());
    }
}
