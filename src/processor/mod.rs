//! Job processors
//!
//! A [`Processor`] binds a fixed set of job managers to one queue and acts as
//! their [`ProcessorContext`]. [`GroupedProcessor`] layers per-group mutual
//! exclusion on top, and [`Worker`] drives either one against the store.

pub mod grouped;
pub mod worker;

pub use grouped::GroupedProcessor;
pub use worker::{handle_job, Worker, WorkerConfig};

use crate::error::{SettlementError, SettlementResult};
use crate::jobs::{JobManager, JobName, ProcessorContext};
use crate::queue::{Job, WorkQueue};
use crate::services::Services;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

const DELAYED_SENTINEL: &str = "__delayed__";
const SKIPPED_SENTINEL: &str = "__skipped__";

/// Result of handing a job to a processor
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The manager executed the job and returned a value
    Done(Value),
    /// The job was put back on the queue to run later
    Delayed,
    /// The job was not run and nothing follows from it
    Skipped,
}

impl ProcessOutcome {
    /// Value stored as the job's return value
    pub fn into_returnvalue(self) -> Value {
        match self {
            ProcessOutcome::Done(value) => value,
            ProcessOutcome::Delayed => Value::String(DELAYED_SENTINEL.to_string()),
            ProcessOutcome::Skipped => Value::String(SKIPPED_SENTINEL.to_string()),
        }
    }
}

/// Whether a completed job's return value marks a deferral rather than a real run
pub fn is_delayed(job: &Job) -> bool {
    job.returnvalue.as_ref().and_then(Value::as_str) == Some(DELAYED_SENTINEL)
}

fn is_skipped(job: &Job) -> bool {
    job.returnvalue.as_ref().and_then(Value::as_str) == Some(SKIPPED_SENTINEL)
}

/// Delivery callbacks a worker drives
#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn work_queue(&self) -> &Arc<dyn WorkQueue>;

    async fn process(&self, job: &Job) -> SettlementResult<ProcessOutcome>;

    /// Called after a successful `process`, with `job.returnvalue` set
    async fn on_completed(&self, job: &Job) -> SettlementResult<()>;

    async fn on_failed(&self, job: &Job, err: &SettlementError, terminal: bool);
}

/// Dispatches jobs from one queue to their managers
pub struct Processor {
    queue: Arc<dyn WorkQueue>,
    managers: Vec<Arc<dyn JobManager>>,
    services: Services,
    /// Kinds that must not run while another job of the same kind is active
    non_concurrent: HashSet<JobName>,
}

impl Processor {
    /// Create a processor. Fails if two managers claim the same job kind.
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        managers: Vec<Arc<dyn JobManager>>,
        services: Services,
    ) -> SettlementResult<Self> {
        let mut seen = HashSet::new();
        for manager in &managers {
            if !seen.insert(manager.kind()) {
                return Err(SettlementError::Config(format!(
                    "Job kind {} has more than one manager on queue {}",
                    manager.kind(),
                    queue.name()
                )));
            }
        }

        info!(
            "Processor for queue {} handles: {}",
            queue.name(),
            managers
                .iter()
                .map(|m| m.kind().as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            queue,
            managers,
            services,
            non_concurrent: HashSet::new(),
        })
    }

    /// Skip jobs of these kinds while another one of the same kind is active
    pub fn avoid_concurrency(mut self, kinds: impl IntoIterator<Item = JobName>) -> Self {
        self.non_concurrent.extend(kinds);
        self
    }

    pub fn kinds(&self) -> Vec<JobName> {
        self.managers.iter().map(|m| m.kind()).collect()
    }

    fn manager_for(&self, job: &Job) -> SettlementResult<&Arc<dyn JobManager>> {
        self.managers
            .iter()
            .find(|m| m.recognizes(job))
            .ok_or_else(|| SettlementError::UnknownJob {
                name: job.name.clone(),
            })
    }

    async fn overlaps_active_run(&self, job: &Job) -> SettlementResult<bool> {
        let Some(kind) = job.kind() else {
            return Ok(false);
        };
        if !self.non_concurrent.contains(&kind) {
            return Ok(false);
        }
        // the job being processed is itself active
        Ok(self.queue.count_active(&job.name).await? > 1)
    }
}

impl ProcessorContext for Processor {
    fn queue(&self) -> &dyn WorkQueue {
        self.queue.as_ref()
    }

    fn services(&self) -> &Services {
        &self.services
    }
}

#[async_trait]
impl JobProcessor for Processor {
    fn work_queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    async fn process(&self, job: &Job) -> SettlementResult<ProcessOutcome> {
        debug!("{}: process {} ({})", self.queue.name(), job.name, job.id);

        let manager = self.manager_for(job)?;

        if self.overlaps_active_run(job).await? {
            info!(
                "{}: skipping {} ({}), another run is active",
                self.queue.name(),
                job.name,
                job.id
            );
            return Ok(ProcessOutcome::Skipped);
        }

        let value = manager.execute(job, self).await?;
        Ok(ProcessOutcome::Done(value))
    }

    async fn on_completed(&self, job: &Job) -> SettlementResult<()> {
        if is_skipped(job) || is_delayed(job) {
            return Ok(());
        }

        debug!("{}: onComplete {} ({})", self.queue.name(), job.name, job.id);
        let manager = self.manager_for(job)?;
        manager.on_success(job, self).await
    }

    async fn on_failed(&self, job: &Job, err: &SettlementError, terminal: bool) {
        match self.manager_for(job) {
            Ok(manager) => manager.on_failure(job, self, err, terminal).await,
            Err(_) => error!(
                "{}: no manager for job {} ({}), dropped: {}",
                self.queue.name(),
                job.name,
                job.id,
                err
            ),
        }
    }
}
