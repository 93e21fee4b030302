//! Signed delivery with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fetch_guard::{FetchError, FetchedResponse, OutboundRequest, SafeFetcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::payload::WebhookPayload;
use super::signature::{sign, SIGNATURE_HEADER};
use super::{DeliveryStatus, WebhookDelivery};
use crate::error::{WebhookError, WebhookResult};
use crate::redact::redact_error;
use crate::secret::SecretString;
use crate::store::DeliveryStore;

/// Retry schedule for deliveries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherConfig {
    /// Total tries, including the first
    pub max_attempts: u32,
    /// Wait after the first failed try; doubles for each later one
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Uniform jitter as a fraction of the delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the try after `failed_attempt` (1-based), before jitter.
    pub fn base_delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Delay with uniform jitter applied.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let factor = 1.0 + self.jitter * (2.0 * fastrand::f64() - 1.0);
        self.base_delay_for(failed_attempt).mul_f64(factor.max(0.0))
    }
}

/// What one try told us.
enum TryResult {
    Delivered(u16),
    Retry { status: Option<u16>, error: String },
    GiveUp { status: Option<u16>, error: String },
}

fn classify(result: Result<FetchedResponse, FetchError>) -> TryResult {
    match result {
        Ok(response) => {
            let status = response.status.as_u16();
            if response.status.is_success() {
                TryResult::Delivered(status)
            } else if fetch_guard::is_transient_status(status) {
                TryResult::Retry {
                    status: Some(status),
                    error: format!("HTTP {}", status),
                }
            } else {
                // 3xx included: delivery redirects are never followed
                TryResult::GiveUp {
                    status: Some(status),
                    error: format!("HTTP {}", status),
                }
            }
        }
        Err(err) if err.is_transient() => TryResult::Retry {
            status: None,
            error: redact_error(&err.to_string()),
        },
        Err(err) => TryResult::GiveUp {
            status: None,
            error: redact_error(&err.to_string()),
        },
    }
}

/// Delivers signed payloads through the guarded fetcher.
pub struct WebhookDispatcher {
    fetcher: Arc<SafeFetcher>,
    deliveries: Arc<dyn DeliveryStore>,
    config: DispatcherConfig,
}

impl WebhookDispatcher {
    pub fn new(
        fetcher: Arc<SafeFetcher>,
        deliveries: Arc<dyn DeliveryStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            fetcher,
            deliveries,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Deliver `payload` to `callback_url`, retrying per the config.
    ///
    /// The delivery record is written before the first try and after every
    /// try. A callback that fails address validation is recorded as `failed`
    /// without any request being made. Returns the final record.
    pub async fn notify(
        &self,
        callback_url: &str,
        secret: &SecretString,
        payload: &WebhookPayload,
    ) -> WebhookResult<WebhookDelivery> {
        let mut delivery = WebhookDelivery::pending(payload.job_id, payload.event, callback_url);
        self.deliveries.create_delivery(&delivery).await?;

        let url = match self.fetcher.check_url(callback_url).await {
            Ok(target) => target.url,
            Err(err) if err.is_transient() => {
                // DNS trouble is retried like any other network failure
                match self.fetcher.validator().validate(callback_url) {
                    Ok(url) => url,
                    Err(err) => return self.reject(delivery, FetchError::from(err)).await,
                }
            }
            Err(err) => return self.reject(delivery, err).await,
        };

        let body = payload.to_bytes();
        let signature = sign(secret.expose().as_bytes(), &body)?;
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let request = OutboundRequest::post(url.clone(), body.clone())
                .with_header("Content-Type", "application/json")
                .with_header(SIGNATURE_HEADER, signature.as_str())
                .with_header("X-Webhook-Event", payload.event.as_str())
                .with_header("X-Webhook-Delivery", delivery.id.to_string());

            let outcome = classify(self.fetcher.send(request).await);

            delivery.attempts = attempt as i32;
            delivery.last_attempt_at = Some(Utc::now());

            let retry = match outcome {
                TryResult::Delivered(status) => {
                    delivery.status = DeliveryStatus::Delivered;
                    delivery.response_status = Some(i32::from(status));
                    delivery.error_message = None;
                    false
                }
                TryResult::Retry { status, error } => {
                    delivery.response_status = status.map(i32::from);
                    delivery.error_message = Some(error);
                    if attempt == max_attempts {
                        delivery.status = DeliveryStatus::Failed;
                    }
                    attempt < max_attempts
                }
                TryResult::GiveUp { status, error } => {
                    delivery.status = DeliveryStatus::Failed;
                    delivery.response_status = status.map(i32::from);
                    delivery.error_message = Some(error);
                    false
                }
            };

            self.record(&delivery).await;

            if !retry {
                break;
            }

            let delay = self.config.delay_for(attempt);
            debug!(
                delivery_id = %delivery.id,
                job_id = %delivery.job_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = ?delivery.error_message,
                "webhook delivery failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        match delivery.status {
            DeliveryStatus::Delivered => info!(
                delivery_id = %delivery.id,
                job_id = %delivery.job_id,
                event = %delivery.event,
                attempts = delivery.attempts,
                "webhook delivered"
            ),
            _ => warn!(
                delivery_id = %delivery.id,
                job_id = %delivery.job_id,
                event = %delivery.event,
                attempts = delivery.attempts,
                response_status = ?delivery.response_status,
                error = ?delivery.error_message,
                "webhook delivery failed"
            ),
        }

        Ok(delivery)
    }

    async fn reject(
        &self,
        mut delivery: WebhookDelivery,
        err: FetchError,
    ) -> WebhookResult<WebhookDelivery> {
        let err = WebhookError::Rejected(err);
        warn!(
            delivery_id = %delivery.id,
            job_id = %delivery.job_id,
            error = %err,
            "webhook callback rejected"
        );
        delivery.status = DeliveryStatus::Failed;
        delivery.error_message = Some(redact_error(&err.to_string()));
        self.deliveries.update_delivery(&delivery).await?;
        Ok(delivery)
    }

    /// Persist progress; a store failure must not stop the delivery.
    async fn record(&self, delivery: &WebhookDelivery) {
        if let Err(e) = self.deliveries.update_delivery(delivery).await {
            warn!(delivery_id = %delivery.id, error = %e, "failed to record delivery attempt");
        }
    }

    pub async fn deliveries_for_job(&self, job_id: Uuid) -> WebhookResult<Vec<WebhookDelivery>> {
        Ok(self.deliveries.deliveries_for_job(job_id).await?)
    }
}
