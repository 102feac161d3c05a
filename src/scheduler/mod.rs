//! Recurring triggers
//!
//! Two flavours:
//! - [`RecurringTrigger`] installs a scheduler inside the work queue itself,
//!   which then materializes a scan job every interval.
//! - [`cron::CronJobManager`] is a process-local loop that enqueues a
//!   deduplicated job on every tick.

pub mod cron;

pub use cron::{CronJobManager, CronJobRegistry};

use crate::error::SettlementResult;
use crate::jobs::JobName;
use crate::queue::{JobOptions, NewJob, WorkQueue};

use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Queue-backed recurring trigger for one scan job
#[derive(Debug, Clone)]
pub struct RecurringTrigger {
    scheduler_id: String,
    job: JobName,
    every: Duration,
}

impl RecurringTrigger {
    pub fn new(scheduler_id: impl Into<String>, job: JobName, every: Duration) -> Self {
        Self {
            scheduler_id: scheduler_id.into(),
            job,
            every,
        }
    }

    pub fn check_withdraws(every: Duration) -> Self {
        Self::new("job-scheduler-check-withdraws", JobName::CheckWithdraws, every)
    }

    pub fn check_send_batch(every: Duration) -> Self {
        Self::new("job-scheduler-check-send-batch", JobName::CheckSendBatch, every)
    }

    pub fn scheduler_id(&self) -> &str {
        &self.scheduler_id
    }

    /// Job materialized on every iteration
    pub fn template(&self) -> NewJob {
        NewJob::new(
            self.job.as_str(),
            json!({}),
            JobOptions::default().remove_on_complete(true),
        )
    }

    /// Replace any scheduler producing this job with a fresh one
    pub async fn install(&self, queue: &dyn WorkQueue) -> SettlementResult<()> {
        let removed = queue.remove_schedulers(self.job.as_str()).await?;
        if removed > 0 {
            debug!(
                "Removed {} existing schedulers for {} on {}",
                removed,
                self.job,
                queue.name()
            );
        }

        queue
            .upsert_scheduler(&self.scheduler_id, self.every, self.template())
            .await?;
        info!(
            "Installed {} on {}: {} every {:?}",
            self.scheduler_id,
            queue.name(),
            self.job,
            self.every
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let queue = MemoryQueue::new("intent-processor");
        let trigger = RecurringTrigger::check_send_batch(Duration::from_secs(60));

        trigger.install(&queue).await.unwrap();
        trigger.install(&queue).await.unwrap();

        assert_eq!(
            queue.scheduler_ids().await,
            vec!["job-scheduler-check-send-batch".to_string()]
        );
    }

    #[tokio::test]
    async fn test_install_replaces_schedulers_under_other_ids() {
        let queue = MemoryQueue::new("intent-processor");
        queue
            .upsert_scheduler(
                "legacy-withdraw-scan",
                Duration::from_secs(10),
                RecurringTrigger::check_withdraws(Duration::from_secs(10)).template(),
            )
            .await
            .unwrap();

        RecurringTrigger::check_withdraws(Duration::from_secs(30))
            .install(&queue)
            .await
            .unwrap();

        assert_eq!(
            queue.scheduler_ids().await,
            vec!["job-scheduler-check-withdraws".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_materializes_scan_jobs() {
        let queue = MemoryQueue::new("intent-processor");
        RecurringTrigger::check_withdraws(Duration::from_secs(30))
            .install(&queue)
            .await
            .unwrap();

        assert!(queue.claim().await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(30)).await;

        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(job.name, "CHECK_WITHDRAWS");
        assert!(job.options.remove_on_complete);
    }
}
