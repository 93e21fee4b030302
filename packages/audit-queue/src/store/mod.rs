//! Storage traits and their implementations.
//!
//! [`PostgresStore`] is the production backend; [`MemoryStore`] implements the
//! same traits for tests and local runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::job::{FailOutcome, Job, NewJob};
use crate::progress::{NewProgressEvent, ProgressEvent};
use crate::webhook::WebhookDelivery;

/// Durable job table with lease-based claiming.
///
/// At most one worker holds a non-expired lease on a job at any instant.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `queued` job on its first attempt.
    async fn enqueue(&self, job: NewJob, tenant_id: Option<&str>) -> StoreResult<Uuid>;

    /// Claim the highest-priority claimable job, oldest first, id as tie-break.
    ///
    /// Reclaiming a running job whose lease expired starts a fresh attempt,
    /// or reruns the final attempt once the budget is used up.
    async fn claim(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<Job>>;

    /// Extend the lease. Returns false once `worker_id` no longer holds the job.
    async fn renew_lease(&self, job_id: Uuid, worker_id: &str, lease: Duration)
        -> StoreResult<bool>;

    /// Mark the job `done`. Returns false if `worker_id` no longer holds it.
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_summary: serde_json::Value,
    ) -> StoreResult<bool>;

    /// Requeue with backoff if `retryable` and attempts remain, else `failed`.
    ///
    /// `error` is stored as given; callers redact it first.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> StoreResult<FailOutcome>;

    /// Cancel a queued or running job. Returns false if it was already terminal.
    async fn cancel(&self, job_id: Uuid) -> StoreResult<bool>;

    async fn get(&self, job_id: Uuid) -> StoreResult<Option<Job>>;
}

/// Append-only stage log.
#[async_trait]
pub trait ProgressLog: Send + Sync {
    async fn append(&self, event: NewProgressEvent) -> StoreResult<ProgressEvent>;

    /// All events for a job in write order.
    async fn list(&self, job_id: Uuid) -> StoreResult<Vec<ProgressEvent>>;
}

/// Webhook delivery records.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()>;

    /// Overwrite the mutable fields. Delivered records are left untouched.
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()>;

    async fn deliveries_for_job(&self, job_id: Uuid) -> StoreResult<Vec<WebhookDelivery>>;
}
