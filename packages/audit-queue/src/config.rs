use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use fetch_guard::{FetchConfig, RateLimitConfig, ServiceTier};
use uuid::Uuid;

use crate::job::RetryBackoff;
use crate::secret::SecretString;
use crate::webhook::{DispatcherConfig, WebhookRegistration};
use crate::worker::WorkerSettings;

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: SecretString,
    pub worker_id: String,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub max_concurrent_jobs: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub service_tier: ServiceTier,
    pub fetch_timeout: Duration,
    pub webhook_max_attempts: u32,
    pub webhook_base_delay: Duration,
    /// Callback notified for every job when set
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<SecretString>,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value if set.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .context("DATABASE_URL must be set")?;

        let webhook_url = lookup("WEBHOOK_URL").filter(|v| !v.is_empty());
        let webhook_secret = lookup("WEBHOOK_SECRET").filter(|v| !v.is_empty());
        if webhook_url.is_some() && webhook_secret.is_none() {
            anyhow::bail!("WEBHOOK_SECRET must be set when WEBHOOK_URL is set");
        }

        Ok(Self {
            database_url: SecretString::new(database_url),
            worker_id: lookup("WORKER_ID")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4())),
            lease_duration: millis(&lookup, "LEASE_DURATION_MS", 60_000)?,
            poll_interval: millis(&lookup, "POLL_INTERVAL_MS", 1_000)?,
            poll_jitter: millis(&lookup, "POLL_JITTER_MS", 250)?,
            max_concurrent_jobs: parse(&lookup, "MAX_CONCURRENT_JOBS", 4)?,
            retry_base_delay: millis(&lookup, "RETRY_BASE_DELAY_MS", 2_000)?,
            retry_max_delay: millis(&lookup, "RETRY_MAX_DELAY_MS", 3_600_000)?,
            service_tier: parse(&lookup, "SERVICE_TIER", ServiceTier::Basic)?,
            fetch_timeout: millis(&lookup, "FETCH_TIMEOUT_MS", 30_000)?,
            webhook_max_attempts: parse(&lookup, "WEBHOOK_MAX_ATTEMPTS", 5)?,
            webhook_base_delay: millis(&lookup, "WEBHOOK_BASE_DELAY_MS", 1_000)?,
            webhook_url,
            webhook_secret: webhook_secret.map(SecretString::new),
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings::default()
            .with_worker_id(self.worker_id.clone())
            .with_lease_duration(self.lease_duration)
            .with_poll_interval(self.poll_interval)
            .with_poll_jitter(self.poll_jitter)
            .with_max_concurrent_jobs(self.max_concurrent_jobs)
    }

    pub fn retry_backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.retry_base_delay, self.retry_max_delay)
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::for_tier(self.service_tier)
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::default().with_timeout(self.fetch_timeout)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_max_attempts(self.webhook_max_attempts)
            .with_base_delay(self.webhook_base_delay)
    }

    pub fn webhook_registration(&self) -> Option<WebhookRegistration> {
        match (&self.webhook_url, &self.webhook_secret) {
            (Some(url), Some(secret)) => Some(WebhookRegistration::new(url.clone(), secret.clone())),
            _ => None,
        }
    }
}

fn parse<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, value)),
        _ => Ok(default),
    }
}

fn millis<F>(lookup: &F, name: &str, default_ms: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, name, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_vars(vars(&[("DATABASE_URL", "postgres://localhost/audit")]))
            .unwrap();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.service_tier, ServiceTier::Basic);
        assert_eq!(config.dispatcher_config().max_attempts, 5);
        assert_eq!(config.retry_backoff().base, Duration::from_secs(2));
        assert_eq!(format!("{:?}", config.database_url), "[REDACTED]");
        assert!(config.webhook_registration().is_none());
    }

    #[test]
    fn test_webhook_requires_secret() {
        let err = WorkerConfig::from_vars(vars(&[
            ("DATABASE_URL", "postgres://localhost/audit"),
            ("WEBHOOK_URL", "https://hooks.example.com/audit"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("WEBHOOK_SECRET"));

        let config = WorkerConfig::from_vars(vars(&[
            ("DATABASE_URL", "postgres://localhost/audit"),
            ("WEBHOOK_URL", "https://hooks.example.com/audit"),
            ("WEBHOOK_SECRET", "whsec_123"),
        ]))
        .unwrap();
        let registration = config.webhook_registration().unwrap();
        assert_eq!(registration.url, "https://hooks.example.com/audit");
        assert_eq!(registration.secret.expose(), "whsec_123");
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_vars(vars(&[
            ("DATABASE_URL", "postgres://localhost/audit"),
            ("WORKER_ID", "audit-1"),
            ("LEASE_DURATION_MS", "5000"),
            ("SERVICE_TIER", "enterprise"),
            ("WEBHOOK_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.worker_id, "audit-1");
        assert_eq!(config.worker_settings().lease_duration, Duration::from_secs(5));
        assert_eq!(config.service_tier, ServiceTier::Enterprise);
        assert_eq!(config.rate_limit().max_concurrent, 10);
        assert_eq!(config.dispatcher_config().max_attempts, 3);
    }

    #[test]
    fn test_missing_database_url() {
        let err = WorkerConfig::from_vars(vars(&[])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = WorkerConfig::from_vars(vars(&[
            ("DATABASE_URL", "postgres://localhost/audit"),
            ("POLL_INTERVAL_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("POLL_INTERVAL_MS"));

        let err = WorkerConfig::from_vars(vars(&[
            ("DATABASE_URL", "postgres://localhost/audit"),
            ("SERVICE_TIER", "platinum"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SERVICE_TIER"));
    }
}
