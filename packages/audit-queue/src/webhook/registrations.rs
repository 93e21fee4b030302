//! Caller-owned webhook registrations.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::payload::WebhookEvent;
use crate::error::WebhookResult;
use crate::secret::SecretString;

/// Where to send notifications and how to sign them.
#[derive(Debug, Clone)]
pub struct WebhookRegistration {
    pub url: String,
    pub secret: SecretString,
    /// Subscribed event names, e.g. `job.completed`
    pub events: HashSet<String>,
    pub active: bool,
}

impl WebhookRegistration {
    /// Active registration subscribed to every job event.
    pub fn new(url: impl Into<String>, secret: impl Into<SecretString>) -> Self {
        Self {
            url: url.into(),
            secret: secret.into(),
            events: [WebhookEvent::JobCompleted, WebhookEvent::JobFailed]
                .iter()
                .map(|e| e.as_str().to_string())
                .collect(),
            active: true,
        }
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn wants(&self, event: WebhookEvent) -> bool {
        self.active && self.events.contains(event.as_str())
    }
}

/// Read-only view of registrations, owned by the caller's system.
#[async_trait]
pub trait RegistrationSource: Send + Sync {
    /// Registrations that may apply to this job, active or not.
    async fn registrations_for(
        &self,
        job_id: Uuid,
        job_type: &str,
    ) -> WebhookResult<Vec<WebhookRegistration>>;
}

/// Registrations keyed by job id and by job type.
#[derive(Default)]
pub struct InMemoryRegistrations {
    by_job: RwLock<HashMap<Uuid, Vec<WebhookRegistration>>>,
    by_type: RwLock<HashMap<String, Vec<WebhookRegistration>>>,
}

impl InMemoryRegistrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_for_job(&self, job_id: Uuid, registration: WebhookRegistration) {
        self.by_job
            .write()
            .await
            .entry(job_id)
            .or_default()
            .push(registration);
    }

    pub async fn register_for_type(
        &self,
        job_type: impl Into<String>,
        registration: WebhookRegistration,
    ) {
        self.by_type
            .write()
            .await
            .entry(job_type.into())
            .or_default()
            .push(registration);
    }
}

#[async_trait]
impl RegistrationSource for InMemoryRegistrations {
    async fn registrations_for(
        &self,
        job_id: Uuid,
        job_type: &str,
    ) -> WebhookResult<Vec<WebhookRegistration>> {
        let mut found = self
            .by_job
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        if let Some(for_type) = self.by_type.read().await.get(job_type) {
            found.extend(for_type.iter().cloned());
        }
        Ok(found)
    }
}
