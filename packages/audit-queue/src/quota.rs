//! Quota-gated job admission and caller-facing queries.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{EnqueueError, EnqueueResult, QuotaError, StoreError, StoreResult};
use crate::job::{Job, NewJob};
use crate::progress::ProgressEvent;
use crate::store::{JobStore, ProgressLog};

/// Verdict of the external quota service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny(String),
}

/// External policy consulted before a job is admitted.
#[async_trait]
pub trait QuotaPolicy: Send + Sync {
    async fn check_quota(&self, tenant_id: &str, action: &str)
        -> Result<QuotaDecision, QuotaError>;
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl QuotaPolicy for AllowAll {
    async fn check_quota(&self, _: &str, _: &str) -> Result<QuotaDecision, QuotaError> {
        Ok(QuotaDecision::Allow)
    }
}

/// Entry point for callers: enqueue, cancel and observe jobs.
pub struct JobClient {
    jobs: Arc<dyn JobStore>,
    events: Arc<dyn ProgressLog>,
    quota: Arc<dyn QuotaPolicy>,
}

impl JobClient {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        events: Arc<dyn ProgressLog>,
        quota: Arc<dyn QuotaPolicy>,
    ) -> Self {
        Self { jobs, events, quota }
    }

    /// Check quota for `enqueue:<job_type>`, then persist the job.
    #[instrument(skip(self, job), fields(job_type = %job.job_type))]
    pub async fn enqueue(&self, tenant_id: &str, job: NewJob) -> EnqueueResult<Uuid> {
        job.validate()?;

        let action = format!("enqueue:{}", job.job_type);
        if let QuotaDecision::Deny(reason) = self.quota.check_quota(tenant_id, &action).await? {
            info!(tenant_id = %tenant_id, reason = %reason, "enqueue denied by quota");
            return Err(EnqueueError::QuotaDenied {
                tenant_id: tenant_id.to_string(),
                reason,
            });
        }

        Ok(self.jobs.enqueue(job, Some(tenant_id)).await?)
    }

    pub async fn cancel(&self, job_id: Uuid) -> StoreResult<bool> {
        self.jobs.cancel(job_id).await
    }

    pub async fn status(&self, job_id: Uuid) -> StoreResult<Job> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id))
    }

    pub async fn progress(&self, job_id: Uuid) -> StoreResult<Vec<ProgressEvent>> {
        self.events.list(job_id).await
    }
}
