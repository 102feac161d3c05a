//! Process-local cron loops
//!
//! A [`CronJobManager`] enqueues the same deduplicated job on every tick. It
//! keeps no record of what it submitted: when the previous job is still
//! pending, the queue reports a duplicate and the tick is a no-op.

use crate::error::SettlementResult;
use crate::queue::{AddOutcome, NewJob, WorkQueue};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct CronJobManager {
    name: String,
    queue: Arc<dyn WorkQueue>,
    job: NewJob,
    interval: Duration,
    stop_tx: watch::Sender<bool>,
}

impl CronJobManager {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn WorkQueue>,
        job: NewJob,
        interval: Duration,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            queue,
            job,
            interval,
            stop_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit the job once
    pub async fn tick(&self) -> SettlementResult<AddOutcome> {
        let outcome = self.queue.add(self.job.clone()).await?;
        match &outcome {
            AddOutcome::Added(job) => debug!("Cron {} enqueued {}", self.name, job.id),
            AddOutcome::Duplicate { job_id } => {
                debug!("Cron {}: {} still pending", self.name, job_id)
            }
        }
        Ok(outcome)
    }

    /// Tick immediately, then every interval until stopped
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Cron {} started (every {:?})", self.name, self.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!("Cron {} failed to enqueue: {}", self.name, e);
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Cron {} stopped", self.name);
        })
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Owns the running cron loops, one per key
#[derive(Default)]
pub struct CronJobRegistry {
    managers: DashMap<String, (Arc<CronJobManager>, JoinHandle<()>)>,
}

impl CronJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `manager` under its name, stopping any loop it replaces
    pub fn register(&self, manager: CronJobManager) {
        let manager = Arc::new(manager);
        let handle = manager.clone().start();
        if let Some((previous, _)) = self
            .managers
            .insert(manager.name().to_string(), (manager, handle))
        {
            previous.stop();
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.managers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Stop every loop and wait for them to exit
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.managers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, (manager, handle))) = self.managers.remove(&name) {
                manager.stop();
                if let Err(e) = handle.await {
                    warn!("Cron {} task ended abnormally: {}", name, e);
                }
            }
        }
    }
}
