//! In-process work queue

use super::{AddOutcome, FailOutcome, Job, JobState, NewJob, WorkQueue};
use crate::error::{SettlementError, SettlementResult};
use crate::metrics;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Record {
    job: Job,
    state: JobState,
    run_at: Instant,
    seq: u64,
    scheduler_id: Option<String>,
    failed_reason: Option<String>,
}

#[derive(Debug, Clone)]
struct Scheduler {
    every: Duration,
    template: NewJob,
    next_run: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, Record>,
    schedulers: HashMap<String, Scheduler>,
    seq: u64,
}

impl Inner {
    fn insert(&mut self, new_job: NewJob, scheduler_id: Option<String>) -> AddOutcome {
        self.seq += 1;
        let id = new_job
            .options
            .job_id
            .clone()
            .unwrap_or_else(|| self.seq.to_string());

        // finished records are replaced
        if self.records.get(&id).is_some_and(|r| r.state.is_in_flight()) {
            return AddOutcome::Duplicate { job_id: id };
        }

        let delay = new_job.options.delay();
        let state = if delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };

        let job = Job {
            id: id.clone(),
            name: new_job.name,
            data: new_job.data,
            options: new_job.options,
            attempts_made: 0,
            returnvalue: None,
        };

        self.records.insert(
            id,
            Record {
                job: job.clone(),
                state,
                run_at: Instant::now() + delay,
                seq: self.seq,
                scheduler_id,
                failed_reason: None,
            },
        );

        AddOutcome::Added(job)
    }

    /// Materialize due scheduler iterations, skipping schedulers whose last
    /// iteration is still in flight
    fn run_schedulers(&mut self, now: Instant) {
        let due: Vec<(String, NewJob)> = self
            .schedulers
            .iter_mut()
            .filter(|(_, s)| s.next_run <= now)
            .map(|(id, s)| {
                s.next_run = now + s.every;
                (id.clone(), s.template.clone())
            })
            .collect();

        for (scheduler_id, mut template) in due {
            let busy = self.records.values().any(|r| {
                r.scheduler_id.as_deref() == Some(scheduler_id.as_str()) && r.state.is_in_flight()
            });
            if busy {
                debug!("Scheduler {} iteration still in flight, skipping", scheduler_id);
                continue;
            }

            template.options.job_id = Some(format!("repeat:{}:{}", scheduler_id, self.seq + 1));
            template.options.delay = 0;
            self.insert(template, Some(scheduler_id));
        }
    }
}

/// Work queue held entirely in memory
pub struct MemoryQueue {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make every delayed job ready now
    pub async fn promote(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let mut promoted = 0;
        for record in inner.records.values_mut() {
            if record.state == JobState::Delayed {
                record.state = JobState::Waiting;
                record.run_at = now;
                promoted += 1;
            }
        }
        promoted
    }

    /// Stored jobs with the given name, oldest first
    pub async fn jobs_named(&self, name: &str) -> Vec<(Job, JobState)> {
        let inner = self.inner.lock().await;
        let mut records: Vec<&Record> = inner
            .records
            .values()
            .filter(|r| r.job.name == name)
            .collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| (r.job.clone(), r.state)).collect()
    }

    /// Look up a stored job by id
    pub async fn get(&self, job_id: &str) -> Option<(Job, JobState)> {
        let inner = self.inner.lock().await;
        inner.records.get(job_id).map(|r| (r.job.clone(), r.state))
    }

    /// Reason recorded for a failed job
    pub async fn failed_reason(&self, job_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.records.get(job_id).and_then(|r| r.failed_reason.clone())
    }

    /// Number of stored jobs in the given state
    pub async fn count_in_state(&self, state: JobState) -> usize {
        let inner = self.inner.lock().await;
        inner.records.values().filter(|r| r.state == state).count()
    }

    /// Installed scheduler ids
    pub async fn scheduler_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.schedulers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, job: NewJob) -> SettlementResult<AddOutcome> {
        let name = job.name.clone();
        let outcome = self.inner.lock().await.insert(job, None);
        match &outcome {
            AddOutcome::Added(_) => metrics::record_job_enqueued(&self.name, &name),
            AddOutcome::Duplicate { .. } => metrics::record_duplicate_submission(&self.name, &name),
        }
        Ok(outcome)
    }

    async fn add_bulk(&self, jobs: Vec<NewJob>) -> SettlementResult<Vec<AddOutcome>> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            outcomes.push(self.add(job).await?);
        }
        Ok(outcomes)
    }

    async fn upsert_scheduler(
        &self,
        scheduler_id: &str,
        every: Duration,
        template: NewJob,
    ) -> SettlementResult<()> {
        if every.is_zero() {
            return Err(SettlementError::Queue(format!(
                "Scheduler {} needs a positive interval",
                scheduler_id
            )));
        }

        let mut inner = self.inner.lock().await;
        inner.schedulers.insert(
            scheduler_id.to_string(),
            Scheduler {
                every,
                template,
                next_run: Instant::now() + every,
            },
        );
        Ok(())
    }

    async fn remove_schedulers(&self, job_name: &str) -> SettlementResult<usize> {
        let mut inner = self.inner.lock().await;
        let before = inner.schedulers.len();
        inner.schedulers.retain(|_, s| s.template.name != job_name);
        Ok(before - inner.schedulers.len())
    }

    async fn update_data(&self, job_id: &str, data: Value) -> SettlementResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get_mut(job_id)
            .ok_or_else(|| SettlementError::Queue(format!("Job {} not found", job_id)))?;
        record.job.data = data;
        Ok(())
    }

    async fn claim(&self) -> SettlementResult<Option<Job>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.run_schedulers(now);

        let next = inner
            .records
            .values()
            .filter(|r| {
                matches!(r.state, JobState::Waiting | JobState::Delayed) && r.run_at <= now
            })
            .min_by_key(|r| (r.run_at, r.seq))
            .map(|r| r.job.id.clone());

        Ok(next.and_then(|id| {
            inner.records.get_mut(&id).map(|record| {
                record.state = JobState::Active;
                record.job.clone()
            })
        }))
    }

    async fn defer(&self, job_id: &str, delay: Duration) -> SettlementResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get_mut(job_id)
            .filter(|r| r.state == JobState::Active)
            .ok_or_else(|| SettlementError::Queue(format!("Job {} is not active", job_id)))?;
        record.state = JobState::Delayed;
        record.run_at = Instant::now() + delay;
        Ok(())
    }

    async fn complete(&self, job: &Job, returnvalue: Value) -> SettlementResult<()> {
        let mut inner = self.inner.lock().await;
        if job.options.remove_on_complete {
            inner.records.remove(&job.id);
            return Ok(());
        }
        if let Some(record) = inner.records.get_mut(&job.id) {
            record.state = JobState::Completed;
            record.job.returnvalue = Some(returnvalue);
        }
        Ok(())
    }

    async fn fail(
        &self,
        job: &Job,
        reason: &str,
        retryable: bool,
    ) -> SettlementResult<FailOutcome> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get_mut(&job.id)
            .ok_or_else(|| SettlementError::Queue(format!("Job {} not found", job.id)))?;

        record.job.attempts_made += 1;
        record.failed_reason = Some(reason.to_string());
        let attempts_made = record.job.attempts_made;

        if retryable && attempts_made < record.job.options.attempts {
            let next_run_in = record.job.options.retry_delay(attempts_made);
            record.state = JobState::Delayed;
            record.run_at = Instant::now() + next_run_in;
            return Ok(FailOutcome::Retrying {
                attempts_made,
                next_run_in,
            });
        }

        if record.job.options.remove_on_fail {
            inner.records.remove(&job.id);
        } else {
            record.state = JobState::Failed;
        }
        Ok(FailOutcome::Exhausted { attempts_made })
    }

    async fn count_active(&self, job_name: &str) -> SettlementResult<usize> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|r| r.state == JobState::Active && r.job.name == job_name)
            .count())
    }
}
