//! Withdraw jobs: claim rewards for proven intents in bulk

use super::WithdrawsData;
use crate::error::SettlementResult;
use crate::jobs::{batch_job_id, JobManager, JobName, ProcessorContext};
use crate::queue::{Backoff, Job, JobOptions, NewJob};

use alloy_primitives::B256;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

pub struct CheckWithdrawsManager;

#[async_trait]
impl JobManager for CheckWithdrawsManager {
    fn kind(&self) -> JobName {
        JobName::CheckWithdraws
    }

    async fn execute(&self, _job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value> {
        let batches = ctx.services().settlement()?.next_withdrawal_batches().await?;
        if batches.is_empty() {
            debug!("No withdrawable intents");
            return Ok(json!({ "batches": 0, "added": 0 }));
        }

        let jobs = batches
            .iter()
            .map(ExecuteWithdrawsManager::job)
            .collect::<SettlementResult<Vec<_>>>()?;
        let added = ctx
            .queue()
            .add_bulk(jobs)
            .await?
            .iter()
            .filter(|o| !o.is_duplicate())
            .count();

        info!("Withdrawal scan: {} batches, {} new jobs", batches.len(), added);
        Ok(json!({ "batches": batches.len(), "added": added }))
    }
}

pub struct ExecuteWithdrawsManager;

impl ExecuteWithdrawsManager {
    pub fn job(data: &WithdrawsData) -> SettlementResult<NewJob> {
        let hashes: Vec<B256> = data.intents.iter().map(|i| i.route_hash).collect();
        let options = JobOptions::default()
            .with_job_id(batch_job_id(&hashes))
            .with_attempts(3)
            .with_backoff(Backoff::exponential(1_000));
        NewJob::from_payload(JobName::ExecuteWithdraws.as_str(), data, options)
    }
}

#[async_trait]
impl JobManager for ExecuteWithdrawsManager {
    fn kind(&self) -> JobName {
        JobName::ExecuteWithdraws
    }

    async fn execute(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value> {
        let data: WithdrawsData = job.payload()?;
        let count = data.intents.len();

        let tx_hash = ctx
            .services()
            .batch_executor()?
            .batch_withdraw(data.chain_id as u64, data.intent_source_address, data.intents)
            .await?;

        info!(
            "Withdrew {} intents on chain {}: {}",
            count, data.chain_id, tx_hash
        );
        Ok(json!({ "txHash": tx_hash, "withdrawn": count }))
    }
}
