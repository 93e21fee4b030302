//! Signed webhook notifications for terminal job states.
//!
//! A [`WebhookNotifier`] looks up the registrations for a finished job and
//! hands each one to the [`WebhookDispatcher`] in the background, so delivery
//! never delays the job's own state transition.

mod dispatcher;
mod notifier;
mod payload;
mod registrations;
mod signature;

pub use dispatcher::{DispatcherConfig, WebhookDispatcher};
pub use notifier::WebhookNotifier;
pub use payload::{canonical_json, WebhookEvent, WebhookPayload};
pub use registrations::{InMemoryRegistrations, RegistrationSource, WebhookRegistration};
pub use signature::{sign, verify, SIGNATURE_HEADER, SIGNATURE_PREFIX};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

/// One notification of one job event to one callback URL.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub job_id: Uuid,
    /// `job.completed` or `job.failed`
    pub event: String,
    pub callback_url: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// HTTP status of the most recent try, if a response arrived
    pub response_status: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn pending(job_id: Uuid, event: WebhookEvent, callback_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            event: event.as_str().to_string(),
            callback_url: callback_url.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            response_status: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}
