//! Queue worker
//!
//! Claims jobs from the processor's queue with bounded concurrency and drives
//! each through `process`, then `on_completed` and `complete`, or `fail` and
//! `on_failed`.

use super::{is_delayed, JobProcessor};
use crate::config::QueueConfig;
use crate::metrics;
use crate::queue::Job;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Active jobs older than this are returned to waiting at startup
    pub stalled_after: Option<Duration>,
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stalled_after: config.stalled_after_secs.map(Duration::from_secs),
        }
    }
}

pub struct Worker {
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        processor: Arc<dyn JobProcessor>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            processor,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips, then drain in-flight jobs
    pub async fn run(mut self) {
        let queue = self.processor.work_queue().clone();
        info!(
            "Worker started on queue {} (concurrency {})",
            queue.name(),
            self.config.concurrency
        );

        if let Some(age) = self.config.stalled_after {
            match queue.recover_stalled(age).await {
                Ok(0) => {}
                Ok(n) => info!("Returned {} stalled jobs to {}", n, queue.name()),
                Err(e) => warn!("Stalled job recovery failed on {}: {}", queue.name(), e),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(result) = inflight.try_join_next() {
                if let Err(e) = result {
                    error!("Job task on {} panicked: {}", queue.name(), e);
                }
            }

            if *self.shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Semaphore closed on {}: {}", queue.name(), e);
                        break;
                    }
                },
                _ = self.shutdown.changed() => break,
            };

            match queue.claim().await {
                Ok(Some(job)) => {
                    let processor = self.processor.clone();
                    inflight.spawn(async move {
                        let _permit = permit;
                        handle_job(processor.as_ref(), job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to claim from {}: {}", queue.name(), e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }

        if !inflight.is_empty() {
            info!("Draining {} in-flight jobs on {}", inflight.len(), queue.name());
        }
        while let Some(result) = inflight.join_next().await {
            if let Err(e) = result {
                error!("Job task on {} panicked during drain: {}", queue.name(), e);
            }
        }
        info!("Worker on {} stopped", queue.name());
    }
}

/// Run one claimed job through the processor and record the outcome in the store
pub async fn handle_job(processor: &dyn JobProcessor, job: Job) {
    let queue = processor.work_queue().clone();
    let span = info_span!(
        "job",
        queue = %queue.name(),
        job_id = %job.id,
        job_name = %job.name,
        correlation_id = job.correlation_id().unwrap_or_default(),
    );

    async move {
        let mut job = job;
        let started = Instant::now();

        let result = match processor.process(&job).await {
            Ok(outcome) => {
                job.returnvalue = Some(outcome.into_returnvalue());
                processor.on_completed(&job).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) if is_delayed(&job) => {
                debug!("Job {} deferred", job.id);
            }
            Ok(()) => {
                let returnvalue = job.returnvalue.clone().unwrap_or_default();
                if let Err(e) = queue.complete(&job, returnvalue).await {
                    error!("Failed to mark job {} complete: {}", job.id, e);
                    return;
                }
                debug!("Job {} completed in {:?}", job.id, started.elapsed());
                metrics::record_job_completed(
                    queue.name(),
                    &job.name,
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(err) => {
                let terminal = match queue.fail(&job, &err.to_string(), err.is_retryable()).await {
                    Ok(outcome) => {
                        debug!("Job {} failure recorded: {:?}", job.id, outcome);
                        outcome.is_terminal()
                    }
                    Err(e) => {
                        error!("Failed to record failure of job {}: {}", job.id, e);
                        false
                    }
                };
                metrics::record_job_failed(queue.name(), &job.name, terminal);
                processor.on_failed(&job, &err, terminal).await;
            }
        }
    }
    .instrument(span)
    .await
}
