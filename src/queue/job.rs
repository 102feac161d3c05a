//! Job records and delivery options

use crate::error::{SettlementError, SettlementResult};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Retry delay strategy applied between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    pub delay: u64,
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
        }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
        }
    }

    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => Duration::from_millis(self.delay),
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(self.delay.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Delivery options attached to a job at submission time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Caller-supplied identifier used for deduplication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    /// Delay before the first attempt, in milliseconds
    #[serde(default)]
    pub delay: u64,
    #[serde(default)]
    pub remove_on_complete: bool,
    #[serde(default)]
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            attempts: 1,
            backoff: None,
            delay: 0,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

impl JobOptions {
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay.as_millis() as u64;
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = remove;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay)
    }

    /// Delay before retrying after `attempts_made` failures
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff
            .map(|b| b.delay_for(attempts_made))
            .unwrap_or_default()
    }
}

/// A job as submitted by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub options: JobOptions,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: Value, options: JobOptions) -> Self {
        Self {
            name: name.into(),
            data,
            options,
        }
    }

    /// Build a job from a typed payload
    pub fn from_payload<T: Serialize>(
        name: impl Into<String>,
        payload: &T,
        options: JobOptions,
    ) -> SettlementResult<Self> {
        Ok(Self::new(name, serde_json::to_value(payload)?, options))
    }
}

/// Lifecycle state of a stored job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Whether a job in this state still blocks a submission with the same id
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed | JobState::Active)
    }
}

impl std::str::FromStr for JobState {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(SettlementError::Queue(format!("Unknown job state: {}", other))),
        }
    }
}

/// A job as held by the store and handed to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub options: JobOptions,
    pub attempts_made: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returnvalue: Option<Value>,
}

impl Job {
    /// Deserialize the payload into its typed form
    pub fn payload<T: DeserializeOwned>(&self) -> SettlementResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| SettlementError::InvalidPayload {
            name: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// Deserialize the return value recorded on completion
    pub fn returned<T: DeserializeOwned>(&self) -> SettlementResult<T> {
        let value = self
            .returnvalue
            .clone()
            .ok_or_else(|| SettlementError::InvalidPayload {
                name: self.name.clone(),
                message: "job has no return value".to_string(),
            })?;
        serde_json::from_value(value).map_err(|e| SettlementError::InvalidPayload {
            name: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// Read a string field from the payload
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// Same payload and options, ready to be submitted again
    pub fn resubmission(&self) -> NewJob {
        NewJob::new(self.name.clone(), self.data.clone(), self.options.clone())
    }
}
