//! Attestation polling job

use super::mint::ExecuteCctpMintManager;
use super::{AttestationStatus, CctpTransfer};
use crate::error::{SettlementError, SettlementResult};
use crate::jobs::{JobManager, JobName, ProcessorContext};
use crate::metrics;
use crate::queue::{AddOutcome, Backoff, Job, JobOptions, NewJob, WorkQueue};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

/// Delay between polls while the attestation is pending
pub const DEFAULT_REPOLL_DELAY: Duration = Duration::from_secs(30);

pub struct CheckCctpAttestationManager {
    repoll_delay: Duration,
}

impl Default for CheckCctpAttestationManager {
    fn default() -> Self {
        Self::new(DEFAULT_REPOLL_DELAY)
    }
}

impl CheckCctpAttestationManager {
    pub fn new(repoll_delay: Duration) -> Self {
        Self { repoll_delay }
    }

    fn options(delay: Duration) -> JobOptions {
        JobOptions::default()
            .with_attempts(3)
            .with_backoff(Backoff::exponential(10_000))
            .with_delay(delay)
            .remove_on_complete(true)
    }

    /// Start polling for a burned message
    pub async fn start(
        queue: &dyn WorkQueue,
        transfer: &CctpTransfer,
        delay: Duration,
    ) -> SettlementResult<AddOutcome> {
        let job = NewJob::from_payload(
            JobName::CheckCctpAttestation.as_str(),
            transfer,
            Self::options(delay),
        )?;
        queue.add(job).await
    }
}

#[async_trait]
impl JobManager for CheckCctpAttestationManager {
    fn kind(&self) -> JobName {
        JobName::CheckCctpAttestation
    }

    async fn execute(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value> {
        let transfer: CctpTransfer = job.payload()?;

        let status = ctx
            .services()
            .attestations()?
            .fetch(transfer.message_hash)
            .await?;

        metrics::record_attestation_poll(status.label());
        debug!(
            "[{}] attestation for {} is {}",
            transfer.correlation(),
            transfer.message_hash,
            status.label()
        );

        Ok(serde_json::to_value(&status)?)
    }

    async fn on_success(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<()> {
        let status: AttestationStatus = job.returned()?;
        let mut transfer: CctpTransfer = job.payload()?;

        match status {
            AttestationStatus::Pending => {
                debug!(
                    "[{}] attestation pending for {}, polling again in {:?}",
                    transfer.correlation(),
                    transfer.message_hash,
                    self.repoll_delay
                );
                let again = NewJob::new(
                    job.name.clone(),
                    job.data.clone(),
                    Self::options(self.repoll_delay),
                );
                ctx.queue().add(again).await?;
            }
            AttestationStatus::Complete { attestation } => {
                info!(
                    "[{}] attestation complete for {}, scheduling mint on chain {}",
                    transfer.correlation(),
                    transfer.message_hash,
                    transfer.destination_chain_id
                );
                transfer.attestation = Some(attestation);
                let outcome = ExecuteCctpMintManager::start(ctx.queue(), &transfer).await?;
                if outcome.is_duplicate() {
                    debug!("Mint job {} already queued", outcome.job_id());
                }
            }
        }

        Ok(())
    }

    async fn on_failure(
        &self,
        job: &Job,
        _ctx: &dyn ProcessorContext,
        err: &SettlementError,
        terminal: bool,
    ) {
        let transfer = job.payload::<CctpTransfer>().ok();
        error!(
            "[{}] attestation check failed for {} on chain {} (attempt {}, terminal: {}): {}",
            job.correlation_id().unwrap_or("-"),
            transfer
                .as_ref()
                .map(|t| t.message_hash.to_string())
                .unwrap_or_else(|| "?".to_string()),
            transfer
                .as_ref()
                .map(|t| t.destination_chain_id.to_string())
                .unwrap_or_else(|| "?".to_string()),
            job.attempts_made + 1,
            terminal,
            err
        );
    }
}
