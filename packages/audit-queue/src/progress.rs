//! Progress events and the reporter handed to job handlers.

use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{HandlerError, StoreResult};
use crate::job::JobStatus;
use crate::store::{JobStore, ProgressLog};

/// Event types written by the worker itself.
pub mod event_types {
    pub const INITIALIZING: &str = "initializing";
    pub const COMPLETED: &str = "completed";
    pub const RETRYING: &str = "retrying";
    pub const FAILED: &str = "failed";
    pub const CANCELED: &str = "canceled";
}

/// A recorded stage transition.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt: i32,
    pub event_type: String,
    pub message: String,
    /// 0 to 100, non-decreasing within an attempt
    pub progress_pct: i16,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProgressEvent {
    pub job_id: Uuid,
    pub attempt: i32,
    pub event_type: String,
    pub message: String,
    pub progress_pct: i16,
}

/// Per-attempt handle for reporting stages and checking for cancellation.
///
/// Cloning shares the same attempt state. Percentages never go backwards
/// within an attempt: a lower value is recorded as the highest seen so far.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    job_id: Uuid,
    attempt: i32,
    worker_id: String,
    jobs: Arc<dyn JobStore>,
    log: Arc<dyn ProgressLog>,
    lease_lost: CancellationToken,
    pct: AtomicI16,
}

impl ProgressReporter {
    pub fn new(
        job_id: Uuid,
        attempt: i32,
        worker_id: impl Into<String>,
        jobs: Arc<dyn JobStore>,
        log: Arc<dyn ProgressLog>,
        lease_lost: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                job_id,
                attempt,
                worker_id: worker_id.into(),
                jobs,
                log,
                lease_lost,
                pct: AtomicI16::new(0),
            }),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.inner.job_id
    }

    pub fn attempt(&self) -> i32 {
        self.inner.attempt
    }

    /// Highest percentage recorded in this attempt.
    pub fn current_pct(&self) -> u8 {
        self.inner.pct.load(Ordering::SeqCst) as u8
    }

    /// Fires when the lease could not be renewed.
    pub fn lease_token(&self) -> &CancellationToken {
        &self.inner.lease_lost
    }

    /// Check for cancellation or lost lease, then record a stage.
    ///
    /// Handlers call this at every stage boundary and stop on error.
    pub async fn stage(
        &self,
        event_type: &str,
        message: impl Into<String>,
        pct: u8,
    ) -> Result<ProgressEvent, HandlerError> {
        self.checkpoint().await?;
        Ok(self.record(event_type, message, pct).await?)
    }

    /// Cooperative cancellation point.
    pub async fn checkpoint(&self) -> Result<(), HandlerError> {
        let job = self.inner.jobs.get(self.inner.job_id).await?;

        match job {
            Some(job) if job.status == JobStatus::Canceled => {
                debug!(job_id = %self.inner.job_id, "cancellation observed");
                Err(HandlerError::Canceled)
            }
            Some(job) if job.is_held_by(&self.inner.worker_id) && !self.inner.lease_lost.is_cancelled() => {
                if job.attempt != self.inner.attempt {
                    warn!(
                        job_id = %self.inner.job_id,
                        attempt = self.inner.attempt,
                        current = job.attempt,
                        "job moved to a newer attempt"
                    );
                    return Err(HandlerError::LeaseLost);
                }
                Ok(())
            }
            _ => Err(HandlerError::LeaseLost),
        }
    }

    /// Append an event without the cooperative checks.
    pub(crate) async fn record(
        &self,
        event_type: &str,
        message: impl Into<String>,
        pct: u8,
    ) -> StoreResult<ProgressEvent> {
        let requested = i16::from(pct.min(100));
        let previous = self.inner.pct.fetch_max(requested, Ordering::SeqCst);
        let progress_pct = previous.max(requested);

        self.inner
            .log
            .append(NewProgressEvent {
                job_id: self.inner.job_id,
                attempt: self.inner.attempt,
                event_type: event_type.to_string(),
                message: message.into(),
                progress_pct,
            })
            .await
    }
}
