//! Error types for the job queue.
//!
//! Handlers report failures as [`HandlerError`]; the worker is the only place
//! that turns them into a retry decision.

use fetch_guard::FetchError;
use thiserror::Error;
use uuid::Uuid;

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job {0} not found")]
    NotFound(Uuid),
}

/// Failure raised by a job handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Expected to succeed on retry (timeouts, 429, 5xx)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Will not change on retry (bad payload, blocked address, 4xx)
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Another worker took over the job; stop without touching it
    #[error("lease lost")]
    LeaseLost,

    /// The job was canceled by its owner
    #[error("job canceled")]
    Canceled,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<FetchError> for HandlerError {
    fn from(err: FetchError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Permanent(format!("invalid payload: {}", err))
    }
}

/// Handler registration problems, caught at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job type must not be empty")]
    EmptyJobType,

    #[error("job type {0:?} is already registered")]
    Duplicate(String),
}

/// Failure reported by the external quota service.
#[derive(Debug, Error)]
#[error("quota service unavailable: {0}")]
pub struct QuotaError(pub String);

/// Reasons a job was not admitted.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("quota denied for tenant {tenant_id}: {reason}")]
    QuotaDenied { tenant_id: String, reason: String },

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Webhook delivery failures.
///
/// These never affect the outcome of the job that triggered them.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signing secret")]
    InvalidSecret,

    #[error("callback URL rejected: {0}")]
    Rejected(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("registration lookup failed: {0}")]
    Registrations(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type HandlerResult<T = serde_json::Value> = std::result::Result<T, HandlerError>;
pub type EnqueueResult<T> = std::result::Result<T, EnqueueError>;
pub type WebhookResult<T> = std::result::Result<T, WebhookError>;
