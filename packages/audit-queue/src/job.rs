//! Job model.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Retry budget used when a job does not set one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub tenant_id: Option<String>,

    pub status: JobStatus,
    /// Higher is served first
    pub priority: i32,
    /// Current try, starting at 1
    pub attempt: i32,
    pub max_attempts: i32,

    /// Lease expiry while running; earliest retry time while queued
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,

    /// Redacted failure summary
    pub last_error: Option<String>,
    pub result_summary: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh `queued` record for `new`.
    pub fn from_new(new: NewJob, tenant_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: new.job_type,
            payload: new.payload,
            tenant_id,
            status: JobStatus::Queued,
            priority: new.priority,
            attempt: 1,
            max_attempts: new.max_attempts,
            locked_until: None,
            locked_by: None,
            last_error: None,
            result_summary: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether a claim at `now` may pick this job up.
    ///
    /// Queued jobs wait out their retry delay. Running jobs are reclaimable
    /// once their lease has expired.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => {
                self.locked_until.map_or(true, |t| t <= now) && self.attempt <= self.max_attempts
            }
            JobStatus::Running => {
                self.lease_expired_at(now) && self.attempt <= self.max_attempts
            }
            _ => false,
        }
    }

    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.locked_until.map_or(true, |t| t < now)
    }

    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.locked_by.as_deref() == Some(worker_id)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Input for enqueueing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(StoreError::InvalidJob("job_type must not be empty".into()));
        }
        if self.max_attempts < 1 {
            return Err(StoreError::InvalidJob(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        Ok(())
    }
}

/// What `fail` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued as `attempt`, claimable from `retry_at`
    Retrying {
        attempt: i32,
        retry_at: DateTime<Utc>,
    },
    /// Terminal `failed`
    Failed,
    /// The caller no longer held the job; nothing was written
    NotHeld,
}

/// Exponential delay before a transiently failed job may run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(3600), // Max 1 hour
        }
    }
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// No delay; retries are claimable immediately.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay after `failed_attempt` (1-based) failed: `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, failed_attempt: i32) -> Duration {
        let exponent = (failed_attempt.max(1) - 1).min(31) as u32;
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    pub(crate) fn retry_at(&self, now: DateTime<Utc>, failed_attempt: i32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(failed_attempt))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
