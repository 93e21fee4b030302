// Audit Queue - job leasing, progress events and webhook delivery
//
// Long multi-stage audit jobs run across a pool of stateless workers. Jobs
// live in Postgres and are claimed under time-bounded leases; a crashed
// worker's job becomes claimable again once its lease expires. Outbound
// requests go through fetch-guard, and terminal job states are reported to
// callers with signed webhooks.
//
// Handlers are registered per job type and report progress at each stage
// boundary, which is also where they observe cancellation and lost leases.

pub mod config;
pub mod error;
pub mod job;
pub mod lease;
pub mod progress;
pub mod quota;
pub mod redact;
pub mod registry;
pub mod secret;
pub mod store;
pub mod testing;
pub mod webhook;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{
    EnqueueError, EnqueueResult, HandlerError, HandlerResult, QuotaError, RegistryError,
    StoreError, StoreResult, WebhookError, WebhookResult,
};
pub use job::{FailOutcome, Job, JobStatus, NewJob, RetryBackoff, DEFAULT_MAX_ATTEMPTS};
pub use lease::LeaseGuard;
pub use progress::{event_types, NewProgressEvent, ProgressEvent, ProgressReporter};
pub use quota::{AllowAll, JobClient, QuotaDecision, QuotaPolicy};
pub use redact::redact_error;
pub use registry::{HandlerRegistry, JobHandler};
pub use secret::SecretString;
pub use store::{DeliveryStore, JobStore, MemoryStore, PostgresStore, ProgressLog};
pub use webhook::{
    DeliveryStatus, DispatcherConfig, InMemoryRegistrations, RegistrationSource, WebhookDelivery,
    WebhookDispatcher, WebhookEvent, WebhookNotifier, WebhookPayload, WebhookRegistration,
};
pub use worker::{JobOutcome, Worker, WorkerSettings};
