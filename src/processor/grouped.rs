//! Grouped jobs processor
//!
//! Allows at most one active job per group value, where the group is read from
//! a field of the job payload. A job whose group is busy is not run; it goes
//! back to delayed under its own id and returns a delayed marker.
//!
//! The active set lives in this instance only. Two processor instances sharing
//! a queue do not see each other's groups.

use super::{is_delayed, JobProcessor, ProcessOutcome, Processor};
use crate::error::{SettlementError, SettlementResult};
use crate::metrics;
use crate::queue::{Job, WorkQueue};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Default payload field holding the group key
pub const WALLET_ADDRESS_FIELD: &str = "walletAddress";

pub struct GroupedProcessor {
    inner: Processor,
    group_field: String,
    requeue_delay: Duration,
    /// group value -> id of the job holding it
    active: Mutex<HashMap<String, String>>,
}

impl GroupedProcessor {
    pub fn new(inner: Processor, group_field: impl Into<String>, requeue_delay: Duration) -> Self {
        Self {
            inner,
            group_field: group_field.into(),
            requeue_delay,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Group value of a job, if its payload has one
    pub fn group_of(&self, job: &Job) -> Option<String> {
        job.data
            .get(&self.group_field)
            .and_then(Value::as_str)
            .map(str::to_lowercase)
    }

    /// Groups currently held by a running job
    pub async fn active_groups(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    /// Mark the group active for this job. Returns false if another job holds it.
    async fn try_acquire(&self, group: &str, job_id: &str) -> bool {
        let mut active = self.active.lock().await;
        match active.get(group) {
            Some(holder) if holder != job_id => false,
            _ => {
                active.insert(group.to_string(), job_id.to_string());
                true
            }
        }
    }

    async fn release(&self, job: &Job) {
        let Some(group) = self.group_of(job) else {
            return;
        };
        let mut active = self.active.lock().await;
        if active.get(&group).map(String::as_str) == Some(job.id.as_str()) {
            active.remove(&group);
        }
    }

    async fn requeue(&self, job: &Job, group: &str) -> SettlementResult<()> {
        self.inner
            .work_queue()
            .defer(&job.id, self.requeue_delay)
            .await?;
        metrics::record_group_deferral(self.inner.work_queue().name());
        debug!(
            "{}: group {} busy, deferred {} ({}) by {:?}",
            self.inner.work_queue().name(),
            group,
            job.name,
            job.id,
            self.requeue_delay
        );
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for GroupedProcessor {
    fn work_queue(&self) -> &Arc<dyn WorkQueue> {
        self.inner.work_queue()
    }

    async fn process(&self, job: &Job) -> SettlementResult<ProcessOutcome> {
        let Some(group) = self.group_of(job) else {
            return self.inner.process(job).await;
        };

        if !self.try_acquire(&group, &job.id).await {
            self.requeue(job, &group).await?;
            return Ok(ProcessOutcome::Delayed);
        }

        self.inner.process(job).await
    }

    async fn on_completed(&self, job: &Job) -> SettlementResult<()> {
        if is_delayed(job) {
            return Ok(());
        }
        self.release(job).await;
        self.inner.on_completed(job).await
    }

    async fn on_failed(&self, job: &Job, err: &SettlementError, terminal: bool) {
        self.release(job).await;
        self.inner.on_failed(job, err, terminal).await
    }
}
