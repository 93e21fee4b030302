//! Two-level rate limiting for outbound fetches.
//!
//! A global pool of in-flight slots bounds total concurrency, and a keyed
//! governor quota paces requests per destination host so no single site is
//! hammered regardless of how many jobs target it.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::{FetchError, FetchResult};

/// Number of tracked hosts above which idle state is pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Service tier selecting a rate limit preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceTier {
    #[default]
    Basic,
    Pro,
    Enterprise,
}

impl ServiceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTier::Basic => "basic",
            ServiceTier::Pro => "pro",
            ServiceTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for ServiceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown service tier: {0}")]
pub struct ParseTierError(String);

impl FromStr for ServiceTier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(ServiceTier::Basic),
            "pro" => Ok(ServiceTier::Pro),
            "enterprise" => Ok(ServiceTier::Enterprise),
            other => Err(ParseTierError(other.to_string())),
        }
    }
}

/// Limits applied by a [`RateLimiter`]. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum fetches in flight at once across all hosts
    pub max_concurrent: usize,
    /// Minimum gap between two request starts to the same host
    pub min_host_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::for_tier(ServiceTier::default())
    }
}

impl RateLimitConfig {
    pub fn new(max_concurrent: usize, min_host_delay: Duration) -> Self {
        Self {
            max_concurrent,
            min_host_delay,
        }
    }

    /// Preset limits for a service tier.
    pub fn for_tier(tier: ServiceTier) -> Self {
        match tier {
            ServiceTier::Basic => Self::new(2, Duration::from_millis(2000)),
            ServiceTier::Pro => Self::new(5, Duration::from_millis(1000)),
            ServiceTier::Enterprise => Self::new(10, Duration::from_millis(250)),
        }
    }
}

/// Global concurrency plus per-host pacing.
///
/// Waiters for a global slot are served FIFO by the semaphore. Waiters for
/// the same host queue on a FIFO gate before consulting the pacer, so a
/// caller is never overtaken indefinitely by later arrivals.
///
/// The slot is taken before host pacing and held while the caller waits on
/// it. A burst to one paced host can therefore occupy every slot and keep
/// callers for other hosts waiting until a permit is released.
pub struct RateLimiter {
    config: RateLimitConfig,
    slots: Arc<Semaphore>,
    pacer: Option<DefaultKeyedRateLimiter<String>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("available", &self.available())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);

        // A zero delay disables pacing; one cell per period means starts are
        // spaced by at least `min_host_delay`.
        let pacer = Quota::with_period(config.min_host_delay)
            .map(|quota| quota.allow_burst(NonZeroU32::MIN))
            .map(governor::RateLimiter::keyed);

        Self {
            config: RateLimitConfig {
                max_concurrent,
                ..config
            },
            slots: Arc::new(Semaphore::new(max_concurrent)),
            pacer,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_tier(tier: ServiceTier) -> Self {
        Self::new(RateLimitConfig::for_tier(tier))
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Wait until a global slot is free and `host` may be contacted.
    ///
    /// The slot is taken first and held through the pacing wait. It is then
    /// owned by the returned permit and returned on drop (or
    /// [`RatePermit::release`]).
    pub async fn acquire(&self, host: &str) -> FetchResult<RatePermit> {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::RateLimiterClosed)?;

        let key = host.to_ascii_lowercase();

        if let Some(pacer) = &self.pacer {
            let gate = self.gate_for(&key);
            let _turn = gate.lock().await;
            pacer.until_key_ready(&key).await;
        }

        trace!(host = %key, in_flight = self.in_flight(), "rate limit permit granted");

        Ok(RatePermit {
            _slot: slot,
            host: key,
        })
    }

    /// Fetches currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent - self.slots.available_permits()
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Refuse new acquisitions; waiters receive [`FetchError::RateLimiterClosed`].
    pub fn close(&self) {
        self.slots.close();
    }

    fn gate_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);

        if gates.len() > PRUNE_THRESHOLD {
            gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            if let Some(pacer) = &self.pacer {
                pacer.retain_recent();
            }
            debug!(hosts = gates.len(), "pruned idle host rate limit state");
        }

        gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// A held global slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
    host: String,
}

impl RatePermit {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Return the global slot.
    pub fn release(self) {
        drop(self);
    }
}
