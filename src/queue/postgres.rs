//! PostgreSQL work queue

use super::{AddOutcome, FailOutcome, Job, JobOptions, JobState, NewJob, WorkQueue};
use crate::config::StoreConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::metrics;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect a pool for the queue tables
pub async fn connect(config: &StoreConfig) -> SettlementResult<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| SettlementError::Config("store.url is required for postgres".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect(url)
        .await?;

    Ok(pool)
}

/// Create queue tables
pub async fn run_migrations(pool: &PgPool) -> SettlementResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_jobs (
            queue TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT NOT NULL,
            data JSONB NOT NULL,
            opts JSONB NOT NULL,
            state VARCHAR(16) NOT NULL,
            attempts_made INTEGER NOT NULL DEFAULT 0,
            run_at TIMESTAMPTZ NOT NULL,
            scheduler_id TEXT,
            returnvalue JSONB,
            failed_reason TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (queue, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_ready
        ON queue_jobs (queue, state, run_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_schedulers (
            queue TEXT NOT NULL,
            id TEXT NOT NULL,
            job_name TEXT NOT NULL,
            every_ms BIGINT NOT NULL,
            template JSONB NOT NULL,
            next_run_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (queue, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Queue migrations complete");
    Ok(())
}

/// Work queue stored in PostgreSQL
pub struct PgQueue {
    name: String,
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: NewJob,
        scheduler_id: Option<&str>,
    ) -> SettlementResult<AddOutcome> {
        let id = job
            .options
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let state = if job.options.delay == 0 {
            JobState::Waiting
        } else {
            JobState::Delayed
        };
        let opts = serde_json::to_value(&job.options)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO queue_jobs (queue, id, name, data, opts, state, run_at, scheduler_id)
            VALUES ($1, $2, $3, $4, $5, $6, NOW() + ($7::BIGINT * INTERVAL '1 millisecond'), $8)
            ON CONFLICT (queue, id) DO UPDATE SET
                name = EXCLUDED.name,
                data = EXCLUDED.data,
                opts = EXCLUDED.opts,
                state = EXCLUDED.state,
                attempts_made = 0,
                run_at = EXCLUDED.run_at,
                scheduler_id = EXCLUDED.scheduler_id,
                returnvalue = NULL,
                failed_reason = NULL,
                created_at = NOW(),
                updated_at = NOW()
            WHERE queue_jobs.state IN ('completed', 'failed')
            RETURNING id
            "#,
        )
        .bind(&self.name)
        .bind(&id)
        .bind(&job.name)
        .bind(&job.data)
        .bind(&opts)
        .bind(state.as_str())
        .bind(job.options.delay as i64)
        .bind(scheduler_id)
        .fetch_optional(&mut **tx)
        .await?;

        if inserted.is_none() {
            metrics::record_duplicate_submission(&self.name, &job.name);
            return Ok(AddOutcome::Duplicate { job_id: id });
        }

        metrics::record_job_enqueued(&self.name, &job.name);
        Ok(AddOutcome::Added(Job {
            id,
            name: job.name,
            data: job.data,
            options: job.options,
            attempts_made: 0,
            returnvalue: None,
        }))
    }

    /// Enqueue due scheduler iterations inside the claim transaction
    async fn run_schedulers(&self, tx: &mut Transaction<'_, Postgres>) -> SettlementResult<()> {
        let due = sqlx::query(
            r#"
            SELECT id, every_ms, template FROM queue_schedulers
            WHERE queue = $1 AND next_run_at <= NOW()
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(&self.name)
        .fetch_all(&mut **tx)
        .await?;

        for row in due {
            let scheduler_id: String = row.try_get("id")?;
            let every_ms: i64 = row.try_get("every_ms")?;
            let template: Value = row.try_get("template")?;

            sqlx::query(
                r#"
                UPDATE queue_schedulers
                SET next_run_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond')
                WHERE queue = $1 AND id = $2
                "#,
            )
            .bind(&self.name)
            .bind(&scheduler_id)
            .bind(every_ms)
            .execute(&mut **tx)
            .await?;

            let busy: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM queue_jobs
                    WHERE queue = $1 AND scheduler_id = $2
                    AND state IN ('waiting', 'delayed', 'active')
                )
                "#,
            )
            .bind(&self.name)
            .bind(&scheduler_id)
            .fetch_one(&mut **tx)
            .await?;

            if busy {
                debug!("Scheduler {} iteration still in flight, skipping", scheduler_id);
                continue;
            }

            let mut job: NewJob = serde_json::from_value(template)?;
            job.options.job_id = Some(iteration_id(&scheduler_id, chrono::Utc::now().timestamp_millis()));
            job.options.delay = 0;
            self.insert(tx, job, Some(&scheduler_id)).await?;
        }

        Ok(())
    }
}

fn iteration_id(scheduler_id: &str, millis: i64) -> String {
    format!("repeat:{}:{}", scheduler_id, millis)
}

fn job_from_row(row: &PgRow) -> SettlementResult<Job> {
    let opts: Value = row.try_get("opts")?;
    let options: JobOptions = serde_json::from_value(opts)?;
    let attempts_made: i32 = row.try_get("attempts_made")?;

    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        data: row.try_get("data")?,
        options,
        attempts_made: attempts_made.max(0) as u32,
        returnvalue: row.try_get("returnvalue")?,
    })
}

#[async_trait]
impl WorkQueue for PgQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, job: NewJob) -> SettlementResult<AddOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.insert(&mut tx, job, None).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn add_bulk(&self, jobs: Vec<NewJob>) -> SettlementResult<Vec<AddOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            outcomes.push(self.insert(&mut tx, job, None).await?);
        }
        tx.commit().await?;
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

        let every_ms = every.as_millis() as i64;
        sqlx::query(
            r#"
            INSERT INTO queue_schedulers (queue, id, job_name, every_ms, template, next_run_at)
            VALUES ($1, $2, $3, $4, $5, NOW() + ($4::BIGINT * INTERVAL '1 millisecond'))
            ON CONFLICT (queue, id) DO UPDATE SET
                job_name = EXCLUDED.job_name,
                every_ms = EXCLUDED.every_ms,
                template = EXCLUDED.template,
                next_run_at = EXCLUDED.next_run_at
            "#,
        )
        .bind(&self.name)
        .bind(scheduler_id)
        .bind(&template.name)
        .bind(every_ms)
        .bind(serde_json::to_value(&template)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_schedulers(&self, job_name: &str) -> SettlementResult<usize> {
        let result = sqlx::query("DELETE FROM queue_schedulers WHERE queue = $1 AND job_name = $2")
            .bind(&self.name)
            .bind(job_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn update_data(&self, job_id: &str, data: Value) -> SettlementResult<()> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET data = $3, updated_at = NOW() WHERE queue = $1 AND id = $2",
        )
        .bind(&self.name)
        .bind(job_id)
        .bind(&data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SettlementError::Queue(format!("Job {} not found", job_id)));
        }
        Ok(())
    }

    async fn claim(&self) -> SettlementResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        self.run_schedulers(&mut tx).await?;

        let row = sqlx::query(
            r#"
            UPDATE queue_jobs SET state = 'active', updated_at = NOW()
            WHERE (queue, id) = (
                SELECT queue, id FROM queue_jobs
                WHERE queue = $1 AND state IN ('waiting', 'delayed') AND run_at <= NOW()
                ORDER BY run_at, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, name, data, opts, attempts_made, returnvalue
            "#,
        )
        .bind(&self.name)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn defer(&self, job_id: &str, delay: Duration) -> SettlementResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'delayed',
                run_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE queue = $1 AND id = $2 AND state = 'active'
            "#,
        )
        .bind(&self.name)
        .bind(job_id)
        .bind(delay.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SettlementError::Queue(format!("Job {} is not active", job_id)));
        }
        Ok(())
    }

    async fn complete(&self, job: &Job, returnvalue: Value) -> SettlementResult<()> {
        if job.options.remove_on_complete {
            sqlx::query("DELETE FROM queue_jobs WHERE queue = $1 AND id = $2")
                .bind(&self.name)
                .bind(&job.id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE queue_jobs SET state = 'completed', returnvalue = $3, updated_at = NOW()
            WHERE queue = $1 AND id = $2
            "#,
        )
        .bind(&self.name)
        .bind(&job.id)
        .bind(&returnvalue)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(
        &self,
        job: &Job,
        reason: &str,
        retryable: bool,
    ) -> SettlementResult<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let attempts_made: i32 = sqlx::query_scalar(
            r#"
            UPDATE queue_jobs
            SET attempts_made = attempts_made + 1, failed_reason = $3, updated_at = NOW()
            WHERE queue = $1 AND id = $2
            RETURNING attempts_made
            "#,
        )
        .bind(&self.name)
        .bind(&job.id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| SettlementError::Queue(format!("Job {} not found", job.id)))?;
        let attempts_made = attempts_made.max(0) as u32;

        let outcome = if retryable && attempts_made < job.options.attempts {
            let next_run_in = job.options.retry_delay(attempts_made);
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET state = 'delayed', run_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond')
                WHERE queue = $1 AND id = $2
                "#,
            )
            .bind(&self.name)
            .bind(&job.id)
            .bind(next_run_in.as_millis() as i64)
            .execute(&mut *tx)
            .await?;

            FailOutcome::Retrying {
                attempts_made,
                next_run_in,
            }
        } else {
            let statement = if job.options.remove_on_fail {
                "DELETE FROM queue_jobs WHERE queue = $1 AND id = $2"
            } else {
                "UPDATE queue_jobs SET state = 'failed' WHERE queue = $1 AND id = $2"
            };
            sqlx::query(statement)
                .bind(&self.name)
                .bind(&job.id)
                .execute(&mut *tx)
                .await?;

            FailOutcome::Exhausted { attempts_made }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn count_active(&self, job_name: &str) -> SettlementResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = $1 AND name = $2 AND state = 'active'",
        )
        .bind(&self.name)
        .bind(job_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as usize)
    }

    async fn recover_stalled(&self, older_than: Duration) -> SettlementResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs SET state = 'waiting', run_at = NOW(), updated_at = NOW()
            WHERE queue = $1 AND state = 'active'
            AND updated_at < NOW() - ($2::BIGINT * INTERVAL '1 millisecond')
            "#,
        )
        .bind(&self.name)
        .bind(older_than.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected() as usize;
        if recovered > 0 {
            warn!("Recovered {} stalled jobs on queue {}", recovered, self.name);
        }
        Ok(recovered)
    }
}
