//! In-memory store for tests and local development.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DeliveryStore, JobStore, ProgressLog};
use crate::error::{StoreError, StoreResult};
use crate::job::{FailOutcome, Job, JobStatus, NewJob, RetryBackoff};
use crate::progress::{NewProgressEvent, ProgressEvent};
use crate::webhook::{DeliveryStatus, WebhookDelivery};

/// Implements every storage trait behind one async mutex, so each
/// operation is atomic like its SQL counterpart.
///
/// The clock can be moved forward with [`MemoryStore::advance`] to expire
/// leases and retry delays without sleeping.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    backoff: RetryBackoff,
}

struct State {
    jobs: HashMap<Uuid, Job>,
    events: Vec<ProgressEvent>,
    deliveries: Vec<WebhookDelivery>,
    skew: chrono::Duration,
}

impl Default for State {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
            events: Vec::new(),
            deliveries: Vec::new(),
            skew: chrono::Duration::zero(),
        }
    }
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.skew
    }
}

fn lease_end(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Move this store's clock forward.
    pub async fn advance(&self, by: Duration) {
        let mut state = self.state.lock().await;
        state.skew = state.skew + chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    pub async fn now(&self) -> DateTime<Utc> {
        self.state.lock().await.now()
    }

    /// Snapshot of every job, oldest first.
    pub async fn jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: NewJob, tenant_id: Option<&str>) -> StoreResult<Uuid> {
        job.validate()?;
        let mut state = self.state.lock().await;
        let job = Job::from_new(job, tenant_id.map(str::to_string), state.now());
        let id = job.id;
        debug!(job_id = %id, job_type = %job.job_type, "job enqueued");
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<Job>> {
        let mut state = self.state.lock().await;
        let now = state.now();

        let next = state
            .jobs
            .values()
            .filter(|job| job.is_claimable_at(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        if job.status == JobStatus::Running {
            info!(
                job_id = %id,
                previous_worker = ?job.locked_by,
                worker_id = %worker_id,
                "reclaiming job with expired lease"
            );
            if job.has_attempts_left() {
                job.attempt += 1;
            }
        }
        job.status = JobStatus::Running;
        job.locked_by = Some(worker_id.to_string());
        job.locked_until = Some(lease_end(now, lease));
        job.started_at.get_or_insert(now);
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.is_held_by(worker_id) => {
                job.locked_until = Some(lease_end(now, lease));
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_summary: serde_json::Value,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.is_held_by(worker_id) => {
                job.status = JobStatus::Done;
                job.result_summary = Some(result_summary);
                job.locked_until = None;
                job.completed_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> StoreResult<FailOutcome> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let backoff = self.backoff;

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(FailOutcome::NotHeld);
        };
        if !job.is_held_by(worker_id) {
            return Ok(FailOutcome::NotHeld);
        }

        job.last_error = Some(error.to_string());
        job.locked_by = None;
        job.updated_at = now;

        if retryable && job.has_attempts_left() {
            let retry_at = backoff.retry_at(now, job.attempt);
            job.attempt += 1;
            job.status = JobStatus::Queued;
            job.locked_until = Some(retry_at);
            Ok(FailOutcome::Retrying {
                attempt: job.attempt,
                retry_at,
            })
        } else {
            job.status = JobStatus::Failed;
            job.locked_until = None;
            job.completed_at = Some(now);
            Ok(FailOutcome::Failed)
        }
    }

    async fn cancel(&self, job_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        match state.jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Canceled;
                job.locked_until = None;
                job.completed_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    async fn get(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }
}

#[async_trait]
impl ProgressLog for MemoryStore {
    async fn append(&self, event: NewProgressEvent) -> StoreResult<ProgressEvent> {
        let mut state = self.state.lock().await;
        let event = ProgressEvent {
            id: Uuid::now_v7(),
            job_id: event.job_id,
            attempt: event.attempt,
            event_type: event.event_type,
            message: event.message,
            progress_pct: event.progress_pct.clamp(0, 100),
            created_at: state.now(),
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn list(&self, job_id: Uuid) -> StoreResult<Vec<ProgressEvent>> {
        let state = self.state.lock().await;
        // Insertion order is write order
        Ok(state
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        self.state.lock().await.deliveries.push(delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .deliveries
            .iter_mut()
            .find(|d| d.id == delivery.id && d.status != DeliveryStatus::Delivered)
        {
            existing.status = delivery.status;
            existing.attempts = delivery.attempts;
            existing.last_attempt_at = delivery.last_attempt_at;
            existing.response_status = delivery.response_status;
            existing.error_message = delivery.error_message.clone();
        }
        Ok(())
    }

    async fn deliveries_for_job(&self, job_id: Uuid) -> StoreResult<Vec<WebhookDelivery>> {
        let state = self.state.lock().await;
        Ok(state
            .deliveries
            .iter()
            .filter(|d| d.job_id == job_id)
            .cloned()
            .collect())
    }
}
