//! Worker executor.
//!
//! The `Worker` is a long-running service that:
//! - Polls the job store for claimable jobs, with jitter
//! - Dispatches each job to its handler via the `HandlerRegistry`
//! - Keeps the lease alive with a `LeaseGuard` while the handler runs
//! - Classifies the outcome and writes it back (complete, retry or fail)
//! - Schedules webhook notifications for terminal outcomes
//!
//! # Architecture
//!
//! ```text
//! Worker
//!     │
//!     ├─► Claim a job (JobStore.claim)
//!     ├─► Run handler under LeaseGuard
//!     │       └─► JobHandler.run(payload, ProgressReporter)
//!     ├─► complete / fail with retryability
//!     └─► WebhookNotifier.notify on done or final failure
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{HandlerError, StoreResult};
use crate::job::{FailOutcome, Job, JobStatus};
use crate::lease::LeaseGuard;
use crate::progress::{event_types, ProgressReporter};
use crate::redact::redact_error;
use crate::registry::HandlerRegistry;
use crate::store::{JobStore, ProgressLog};
use crate::webhook::{WebhookNotifier, WebhookPayload};

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Identifies this instance in `locked_by`
    pub worker_id: String,
    /// Lease length; renewed every half lease
    pub lease_duration: Duration,
    /// Wait between polls when no job is available
    pub poll_interval: Duration,
    /// Up to this much extra wait is added to every poll
    pub poll_jitter: Duration,
    pub max_concurrent_jobs: usize,
    /// How long shutdown waits for running jobs and deliveries
    pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(250),
            max_concurrent_jobs: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerSettings {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn poll_delay(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis() as u64;
        self.poll_interval + Duration::from_millis(fastrand::u64(0..=jitter_ms))
    }
}

/// How one attempt ended, from this worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Requeued as `attempt`, claimable from `retry_at`
    Retrying {
        attempt: i32,
        retry_at: DateTime<Utc>,
    },
    Failed,
    Canceled,
    /// Another worker owns the job now; nothing was written
    LeaseLost,
}

/// Claims and runs jobs.
#[derive(Clone)]
pub struct Worker {
    settings: Arc<WorkerSettings>,
    jobs: Arc<dyn JobStore>,
    events: Arc<dyn ProgressLog>,
    registry: Arc<HandlerRegistry>,
    notifier: Option<Arc<WebhookNotifier>>,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        jobs: Arc<dyn JobStore>,
        events: Arc<dyn ProgressLog>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            jobs,
            events,
            registry,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<WebhookNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Claim and run at most one job.
    pub async fn run_once(&self) -> StoreResult<Option<JobOutcome>> {
        match self
            .jobs
            .claim(&self.settings.worker_id, self.settings.lease_duration)
            .await?
        {
            Some(job) => Ok(Some(self.process(job).await)),
            None => Ok(None),
        }
    }

    /// Poll until `shutdown` fires, then wait for running jobs and
    /// pending webhook deliveries.
    pub async fn run(&self, shutdown: CancellationToken) {
        let settings = &self.settings;
        info!(
            worker_id = %settings.worker_id,
            max_concurrent_jobs = settings.max_concurrent_jobs,
            lease_ms = settings.lease_duration.as_millis() as u64,
            "worker starting"
        );

        let slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        let tracker = TaskTracker::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self
                .jobs
                .claim(&settings.worker_id, settings.lease_duration)
                .await
            {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tracker.spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    drop(permit);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(settings.poll_delay()) => {}
            }
        }

        tracker.close();
        if !tracker.is_empty() {
            info!(count = tracker.len(), "waiting for running jobs to complete");
        }
        if tokio::time::timeout(settings.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                count = tracker.len(),
                "shutdown timed out; unfinished jobs will be reclaimed after their leases expire"
            );
        }

        if let Some(notifier) = &self.notifier {
            if tokio::time::timeout(settings.shutdown_timeout, notifier.drain())
                .await
                .is_err()
            {
                warn!(
                    pending = notifier.pending(),
                    "shutdown timed out with webhook deliveries pending"
                );
            }
        }

        info!(worker_id = %settings.worker_id, "worker stopped");
    }

    /// Run one claimed attempt to its outcome.
    async fn process(&self, job: Job) -> JobOutcome {
        let worker_id = self.settings.worker_id.as_str();
        let job_id = job.id;
        let attempt = job.attempt;

        info!(
            job_id = %job_id,
            job_type = %job.job_type,
            attempt,
            max_attempts = job.max_attempts,
            worker_id = %worker_id,
            "job claimed"
        );

        let guard = LeaseGuard::spawn(
            self.jobs.clone(),
            job_id,
            worker_id,
            self.settings.lease_duration,
        );
        let reporter = ProgressReporter::new(
            job_id,
            attempt,
            worker_id,
            self.jobs.clone(),
            self.events.clone(),
            guard.lost_token(),
        );

        self.record(&reporter, event_types::INITIALIZING, "starting attempt", 0)
            .await;

        let result = match self.registry.get(&job.job_type) {
            Some(handler) => AssertUnwindSafe(handler.run(job.payload.clone(), reporter.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HandlerError::permanent("handler panicked"))),
            None => Err(HandlerError::permanent(format!(
                "no handler registered for job type {:?}",
                job.job_type
            ))),
        };

        guard.stop().await;

        let outcome = match result {
            Ok(summary) => self.succeed(&job, &reporter, summary).await,
            Err(HandlerError::LeaseLost) => {
                warn!(job_id = %job_id, attempt, "lease lost, abandoning attempt");
                JobOutcome::LeaseLost
            }
            Err(HandlerError::Canceled) => {
                self.record_canceled(&reporter).await;
                JobOutcome::Canceled
            }
            Err(err) => self.fail(&job, &reporter, err).await,
        };

        debug!(job_id = %job_id, attempt, outcome = ?outcome, "attempt finished");
        outcome
    }

    async fn succeed(
        &self,
        job: &Job,
        reporter: &ProgressReporter,
        summary: serde_json::Value,
    ) -> JobOutcome {
        let worker_id = self.settings.worker_id.as_str();
        match self.jobs.complete(job.id, worker_id, summary.clone()).await {
            Ok(true) => {
                info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt, "job completed");
                self.record(reporter, event_types::COMPLETED, "job completed", 100)
                    .await;
                self.notify(job, WebhookPayload::completed(job.id, summary));
                JobOutcome::Completed
            }
            Ok(false) => self.not_held(job, reporter).await,
            Err(e) => {
                // The lease will expire and the job will be retried
                error!(job_id = %job.id, error = %e, "failed to mark job as completed");
                JobOutcome::LeaseLost
            }
        }
    }

    async fn fail(&self, job: &Job, reporter: &ProgressReporter, err: HandlerError) -> JobOutcome {
        let worker_id = self.settings.worker_id.as_str();
        let retryable = err.is_retryable();
        let message = redact_error(&err.to_string());

        match self.jobs.fail(job.id, worker_id, &message, retryable).await {
            Ok(FailOutcome::Retrying { attempt, retry_at }) => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempt,
                    next_attempt = attempt,
                    retry_at = %retry_at,
                    error = %message,
                    "job failed, will retry"
                );
                self.record(
                    reporter,
                    event_types::RETRYING,
                    format!("retrying after: {}", message),
                    reporter.current_pct(),
                )
                .await;
                JobOutcome::Retrying { attempt, retry_at }
            }
            Ok(FailOutcome::Failed) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempt,
                    retryable,
                    error = %message,
                    "job failed"
                );
                self.record(reporter, event_types::FAILED, message.clone(), reporter.current_pct())
                    .await;
                self.notify(job, WebhookPayload::failed(job.id, message));
                JobOutcome::Failed
            }
            Ok(FailOutcome::NotHeld) => self.not_held(job, reporter).await,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to mark job as failed");
                JobOutcome::LeaseLost
            }
        }
    }

    /// The store refused our write: either canceled or taken over.
    async fn not_held(&self, job: &Job, reporter: &ProgressReporter) -> JobOutcome {
        match self.jobs.get(job.id).await {
            Ok(Some(current)) if current.status == JobStatus::Canceled => {
                self.record_canceled(reporter).await;
                JobOutcome::Canceled
            }
            _ => {
                warn!(job_id = %job.id, attempt = job.attempt, "job no longer held, result discarded");
                JobOutcome::LeaseLost
            }
        }
    }

    async fn record_canceled(&self, reporter: &ProgressReporter) {
        info!(job_id = %reporter.job_id(), attempt = reporter.attempt(), "job canceled");
        self.record(reporter, event_types::CANCELED, "job canceled", reporter.current_pct())
            .await;
    }

    /// Progress events are observational; a failed write never changes the outcome.
    async fn record(
        &self,
        reporter: &ProgressReporter,
        event_type: &str,
        message: impl Into<String>,
        pct: u8,
    ) {
        if let Err(e) = reporter.record(event_type, message, pct).await {
            warn!(job_id = %reporter.job_id(), event_type, error = %e, "failed to record progress event");
        }
    }

    fn notify(&self, job: &Job, payload: WebhookPayload) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(&job.job_type, payload);
        }
    }
}
