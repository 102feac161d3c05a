//! Durable work queue
//!
//! The orchestration layer only talks to the [`WorkQueue`] trait. Two stores
//! implement it:
//! - [`MemoryQueue`]: process-local, used by tests and single-node setups
//! - [`PgQueue`]: PostgreSQL backed, safe for many workers across processes

pub mod job;
pub mod memory;
pub mod postgres;

pub use job::{Backoff, BackoffKind, Job, JobOptions, JobState, NewJob};
pub use memory::MemoryQueue;
pub use postgres::PgQueue;

use crate::error::SettlementResult;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Result of submitting a job
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// The job was stored and will be delivered
    Added(Job),
    /// A job with the same id is still queued or active; the submission was a no-op
    Duplicate { job_id: String },
}

impl AddOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AddOutcome::Duplicate { .. })
    }

    pub fn job_id(&self) -> &str {
        match self {
            AddOutcome::Added(job) => &job.id,
            AddOutcome::Duplicate { job_id } => job_id,
        }
    }
}

/// What the store did with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job goes back to delayed and runs again after `next_run_in`
    Retrying {
        attempts_made: u32,
        next_run_in: Duration,
    },
    /// No attempts left, or the failure was not retryable
    Exhausted { attempts_made: u32 },
}

impl FailOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Exhausted { .. })
    }
}

/// Persistent, at-least-once store of named jobs
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Queue name, used for logs and metrics
    fn name(&self) -> &str;

    /// Submit one job. A `job_id` colliding with an in-flight job yields
    /// [`AddOutcome::Duplicate`]; a finished job with that id is replaced.
    async fn add(&self, job: NewJob) -> SettlementResult<AddOutcome>;

    /// Submit many jobs at once
    async fn add_bulk(&self, jobs: Vec<NewJob>) -> SettlementResult<Vec<AddOutcome>>;

    /// Install or replace a recurring trigger that enqueues `template` every `every`
    async fn upsert_scheduler(
        &self,
        scheduler_id: &str,
        every: Duration,
        template: NewJob,
    ) -> SettlementResult<()>;

    /// Remove every recurring trigger that produces jobs named `job_name`
    async fn remove_schedulers(&self, job_name: &str) -> SettlementResult<usize>;

    /// Replace the payload of a stored job
    async fn update_data(&self, job_id: &str, data: Value) -> SettlementResult<()>;

    /// Claim the next ready job. Exactly one caller receives a given job.
    async fn claim(&self) -> SettlementResult<Option<Job>>;

    /// Put an active job back to delayed without spending an attempt
    async fn defer(&self, job_id: &str, delay: Duration) -> SettlementResult<()>;

    /// Record a successful execution
    async fn complete(&self, job: &Job, returnvalue: Value) -> SettlementResult<()>;

    /// Record a failed attempt and apply the job's retry policy
    async fn fail(&self, job: &Job, reason: &str, retryable: bool)
        -> SettlementResult<FailOutcome>;

    /// Number of active jobs with the given name
    async fn count_active(&self, job_name: &str) -> SettlementResult<usize>;

    /// Return jobs stuck in active for longer than `older_than` to waiting
    async fn recover_stalled(&self, _older_than: Duration) -> SettlementResult<usize> {
        Ok(0)
    }
}
