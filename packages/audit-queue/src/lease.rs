//! Lease renewal while a handler runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::JobStore;

/// Keeps a job's lease alive by renewing it every half lease.
///
/// If renewal reports that another worker took the job, the lost token fires
/// and the loop ends. Storage errors are logged and retried on the next tick;
/// if they persist the lease simply expires and the job is reclaimed.
pub struct LeaseGuard {
    stop: CancellationToken,
    lost: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseGuard {
    pub fn spawn(
        store: Arc<dyn JobStore>,
        job_id: Uuid,
        worker_id: impl Into<String>,
        lease: Duration,
    ) -> Self {
        let worker_id = worker_id.into();
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let period = (lease / 2).max(Duration::from_millis(1));

        let handle = {
            let stop = stop.clone();
            let lost = lost.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // Skip first immediate tick

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            match store.renew_lease(job_id, &worker_id, lease).await {
                                Ok(true) => debug!(job_id = %job_id, worker_id = %worker_id, "lease renewed"),
                                Ok(false) => {
                                    warn!(job_id = %job_id, worker_id = %worker_id, "lease lost");
                                    lost.cancel();
                                    break;
                                }
                                Err(e) => {
                                    warn!(job_id = %job_id, error = %e, "lease renewal failed");
                                }
                            }
                        }
                    }
                }
            })
        };

        Self { stop, lost, handle }
    }

    /// Fires when the lease was taken by someone else.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop renewing. Returns whether the lease was still held.
    pub async fn stop(self) -> bool {
        self.stop.cancel();
        let _ = self.handle.await;
        !self.lost.is_cancelled()
    }
}
