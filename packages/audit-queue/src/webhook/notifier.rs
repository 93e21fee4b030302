//! Background fan-out of terminal job events to registered callbacks.

use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::dispatcher::WebhookDispatcher;
use super::payload::WebhookPayload;
use super::registrations::RegistrationSource;

/// Schedules deliveries without blocking the caller.
///
/// Deliveries run on a [`TaskTracker`] so shutdown can wait for them with
/// [`WebhookNotifier::drain`].
pub struct WebhookNotifier {
    dispatcher: Arc<WebhookDispatcher>,
    registrations: Arc<dyn RegistrationSource>,
    tracker: TaskTracker,
}

impl WebhookNotifier {
    pub fn new(
        dispatcher: Arc<WebhookDispatcher>,
        registrations: Arc<dyn RegistrationSource>,
    ) -> Self {
        Self {
            dispatcher,
            registrations,
            tracker: TaskTracker::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<WebhookDispatcher> {
        &self.dispatcher
    }

    /// Notify every active registration subscribed to the payload's event.
    pub fn notify(&self, job_type: &str, payload: WebhookPayload) {
        let dispatcher = self.dispatcher.clone();
        let registrations = self.registrations.clone();
        let job_type = job_type.to_string();

        self.tracker.spawn(async move {
            deliver_all(dispatcher, registrations, &job_type, payload).await;
        });
    }

    /// Deliveries still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every scheduled delivery to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

async fn deliver_all(
    dispatcher: Arc<WebhookDispatcher>,
    registrations: Arc<dyn RegistrationSource>,
    job_type: &str,
    payload: WebhookPayload,
) {
    let job_id: Uuid = payload.job_id;
    let found = match registrations.registrations_for(job_id, job_type).await {
        Ok(found) => found,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "failed to load webhook registrations");
            return;
        }
    };

    let targets: Vec<_> = found
        .into_iter()
        .filter(|r| r.wants(payload.event))
        .collect();
    if targets.is_empty() {
        debug!(job_id = %job_id, event = %payload.event, "no webhook subscribers");
        return;
    }

    for registration in targets {
        if let Err(e) = dispatcher
            .notify(&registration.url, &registration.secret, &payload)
            .await
        {
            warn!(job_id = %job_id, error = %e, "webhook dispatch error");
        }
    }
}
