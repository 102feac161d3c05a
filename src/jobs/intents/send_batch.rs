//! Send batch jobs: prove fulfilled intents in bulk

use super::{SendBatchData, SentRoute};
use crate::error::SettlementResult;
use crate::jobs::{batch_job_id, JobManager, JobName, ProcessorContext};
use crate::queue::{Backoff, Job, JobOptions, NewJob};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Scans the indexer for sendable proves and fans them out as execute jobs
pub struct CheckSendBatchManager;

#[async_trait]
impl JobManager for CheckSendBatchManager {
    fn kind(&self) -> JobName {
        JobName::CheckSendBatch
    }

    async fn execute(&self, _job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value> {
        let batches = ctx.services().settlement()?.next_send_batches().await?;
        if batches.is_empty() {
            debug!("No sendable batches");
            return Ok(json!({ "batches": 0, "added": 0 }));
        }

        let jobs = batches
            .iter()
            .map(ExecuteSendBatchManager::job)
            .collect::<SettlementResult<Vec<_>>>()?;
        let outcomes = ctx.queue().add_bulk(jobs).await?;
        let added = outcomes.iter().filter(|o| !o.is_duplicate()).count();

        info!(
            "Send batch scan: {} batches, {} new jobs",
            batches.len(),
            added
        );
        Ok(json!({ "batches": batches.len(), "added": added }))
    }
}

/// Sends one batch of proves
pub struct ExecuteSendBatchManager;

impl ExecuteSendBatchManager {
    /// Job id is the keccak of the batch's hashes in payload order
    pub fn job(data: &SendBatchData) -> SettlementResult<NewJob> {
        let hashes: Vec<B256> = data.proves.iter().map(|p| p.hash).collect();
        let options = JobOptions::default()
            .with_job_id(batch_job_id(&hashes))
            .with_attempts(3)
            .with_backoff(Backoff::exponential(1_000));
        NewJob::from_payload(JobName::ExecuteSendBatch.as_str(), data, options)
    }
}

#[async_trait]
impl JobManager for ExecuteSendBatchManager {
    fn kind(&self) -> JobName {
        JobName::ExecuteSendBatch
    }

    async fn execute(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value> {
        let mut data: SendBatchData = job.payload()?;
        let executor = ctx.services().batch_executor()?;

        // one prove call per (prover, source chain)
        let mut routes: BTreeMap<(Address, u32), Vec<B256>> = BTreeMap::new();
        for prove in &data.proves {
            routes
                .entry((prove.prover, prove.source))
                .or_default()
                .push(prove.hash);
        }

        for ((prover, source), hashes) in routes {
            if data
                .sent_routes
                .iter()
                .any(|r| r.prover == prover && r.source == source)
            {
                debug!(
                    "Route {} via {} already proven on chain {}, skipping",
                    source, prover, data.chain_id
                );
                continue;
            }

            debug!(
                "Proving {} intents on chain {} to {} via {}",
                hashes.len(),
                data.chain_id,
                source,
                prover
            );
            let tx_hash = executor
                .prove(data.chain_id as u64, data.inbox, prover, source as u64, hashes)
                .await?;

            // a retry must not prove this route again
            data.sent_routes.push(SentRoute {
                prover,
                source,
                tx_hash,
            });
            ctx.queue()
                .update_data(&job.id, serde_json::to_value(&data)?)
                .await?;
        }

        let tx_hashes: Vec<B256> = data.sent_routes.iter().map(|r| r.tx_hash).collect();
        info!(
            "Send batch of {} proves on chain {} mined in {} transactions",
            data.proves.len(),
            data.chain_id,
            tx_hashes.len()
        );
        Ok(json!({ "txHashes": tx_hashes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::intents::tests::hash;
    use crate::jobs::intents::{BatchIndexer, IndexedProve, MockBatchExecutor, MockBatchIndexer, ProveItem};
    use crate::config::IntentSourceConfig;
    use crate::processor::{handle_job, Processor};
    use crate::queue::{JobState, MemoryQueue, WorkQueue};
    use crate::services::{IntentSettlementService, Services};
    use crate::error::SettlementError;
    use alloy_primitives::{address, Bytes};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SOURCE: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const INBOX: Address = address!("cccccccccccccccccccccccccccccccccccccccc");
    const PROVER_1: Address = address!("1111111111111111111111111111111111111111");
    const PROVER_2: Address = address!("2222222222222222222222222222222222222222");

    fn batch(proves: Vec<ProveItem>) -> SendBatchData {
        SendBatchData {
            chain_id: 10,
            intent_source_address: SOURCE,
            inbox: INBOX,
            proves,
            sent_routes: Vec::new(),
        }
    }

    fn item(n: u8, prover: Address, source: u32) -> ProveItem {
        ProveItem {
            hash: hash(n),
            prover,
            source,
        }
    }

    #[test]
    fn test_same_batch_content_same_job_id() {
        let a = ExecuteSendBatchManager::job(&batch(vec![item(1, PROVER_1, 1), item(2, PROVER_1, 1)])).unwrap();
        let b = ExecuteSendBatchManager::job(&batch(vec![item(1, PROVER_1, 1), item(2, PROVER_1, 1)])).unwrap();
        let reordered =
            ExecuteSendBatchManager::job(&batch(vec![item(2, PROVER_1, 1), item(1, PROVER_1, 1)])).unwrap();

        assert_eq!(a.options.job_id, b.options.job_id);
        // ordering is not normalized
        assert_ne!(a.options.job_id, reordered.options.job_id);
        assert_eq!(a.options.attempts, 3);
        assert_eq!(a.options.backoff, Some(Backoff::exponential(1_000)));
    }

    #[tokio::test]
    async fn test_execute_proves_once_per_route() {
        let queue = Arc::new(MemoryQueue::new("intent-processor"));
        let mut executor = MockBatchExecutor::new();
        executor
            .expect_prove()
            .times(2)
            .returning(|chain_id, portal, prover, _, hashes| {
                assert_eq!(chain_id, 10);
                assert_eq!(portal, INBOX);
                if prover == PROVER_1 {
                    assert_eq!(hashes, vec![hash(1), hash(3)]);
                } else {
                    assert_eq!(hashes, vec![hash(2)]);
                }
                Ok(hash(0xff))
            });
        let processor = Processor::new(
            queue.clone(),
            vec![Arc::new(ExecuteSendBatchManager) as Arc<dyn JobManager>],
            Services::default().with_batch_executor(Arc::new(executor)),
        )
        .unwrap();

        let data = batch(vec![item(1, PROVER_1, 8453), item(2, PROVER_2, 8453), item(3, PROVER_1, 8453)]);
        queue.add(ExecuteSendBatchManager::job(&data).unwrap()).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        let id = job.id.clone();
        handle_job(&processor, job).await;

        let (stored, state) = queue.get(&id).await.unwrap();
        assert_eq!(state, JobState::Completed);
        assert_eq!(stored.returnvalue.unwrap()["txHashes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_skips_routes_already_proven() {
        let queue = Arc::new(MemoryQueue::new("intent-processor"));
        let first_route = Arc::new(AtomicUsize::new(0));
        let second_route = Arc::new(AtomicUsize::new(0));

        let mut executor = MockBatchExecutor::new();
        let (first, second) = (first_route.clone(), second_route.clone());
        executor.expect_prove().returning(move |_, _, prover, _, _| {
            if prover == PROVER_1 {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(hash(0xa1))
            } else if second.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SettlementError::Transaction("nonce too low".to_string()))
            } else {
                Ok(hash(0xa2))
            }
        });
        let processor = Processor::new(
            queue.clone(),
            vec![Arc::new(ExecuteSendBatchManager) as Arc<dyn JobManager>],
            Services::default().with_batch_executor(Arc::new(executor)),
        )
        .unwrap();

        let data = batch(vec![item(1, PROVER_1, 8453), item(2, PROVER_2, 8453)]);
        queue.add(ExecuteSendBatchManager::job(&data).unwrap()).await.unwrap();

        let job = queue.claim().await.unwrap().unwrap();
        let id = job.id.clone();
        handle_job(&processor, job).await;

        let (stored, state) = queue.get(&id).await.unwrap();
        assert_eq!(state, JobState::Delayed);
        assert_eq!(stored.data["sentRoutes"].as_array().unwrap().len(), 1);

        queue.promote().await;
        let retry = queue.claim().await.unwrap().unwrap();
        assert_eq!(retry.id, id);
        handle_job(&processor, retry).await;

        let (stored, state) = queue.get(&id).await.unwrap();
        assert_eq!(state, JobState::Completed);
        assert_eq!(first_route.load(Ordering::SeqCst), 1);
        assert_eq!(second_route.load(Ordering::SeqCst), 2);
        assert_eq!(
            stored.returnvalue.unwrap()["txHashes"],
            json!([hash(0xa1), hash(0xa2)])
        );
    }

    #[tokio::test]
    async fn test_scan_fans_out_and_dedups_repeat_scans() {
        let queue = Arc::new(MemoryQueue::new("intent-processor"));
        let mut indexer = MockBatchIndexer::new();
        indexer.expect_next_sendable_batch().returning(|_| {
            Ok(vec![
                IndexedProve { hash: hash(1), prover: PROVER_1, chain_id: 8453, destination_chain_id: 10 },
                IndexedProve { hash: hash(2), prover: PROVER_1, chain_id: 8453, destination_chain_id: 137 },
            ])
        });
        let indexer: Arc<dyn BatchIndexer> = Arc::new(indexer);
        let settlement = IntentSettlementService::new(
            indexer,
            vec![IntentSourceConfig {
                source_address: SOURCE,
                inbox: INBOX,
                chain_id: 8453,
                prove_fee_wei: 0,
                prover_data: Bytes::new(),
            }],
            10,
            10,
        );
        let processor = Processor::new(
            queue.clone(),
            vec![
                Arc::new(CheckSendBatchManager) as Arc<dyn JobManager>,
                Arc::new(ExecuteSendBatchManager),
            ],
            Services::default().with_settlement(Arc::new(settlement)),
        )
        .unwrap();

        for _ in 0..2 {
            queue
                .add(NewJob::new("CHECK_SEND_BATCH", json!({}), JobOptions::default().remove_on_complete(true)))
                .await
                .unwrap();
        }
        for _ in 0..2 {
            let scan = queue.claim().await.unwrap().unwrap();
            assert_eq!(scan.name, "CHECK_SEND_BATCH");
            handle_job(&processor, scan).await;
        }

        let executes = queue.jobs_named("EXECUTE_SEND_BATCH").await;
        assert_eq!(executes.len(), 2);
        assert!(executes.iter().all(|(_, state)| *state == JobState::Waiting));
    }
}
