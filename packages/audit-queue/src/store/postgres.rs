//! PostgreSQL-backed store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never pick the
//! same row, and every ownership-sensitive update is conditioned on
//! `locked_by` in the same statement.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{DeliveryStore, JobStore, ProgressLog};
use crate::error::{StoreError, StoreResult};
use crate::job::{FailOutcome, Job, NewJob, RetryBackoff};
use crate::progress::{NewProgressEvent, ProgressEvent};
use crate::webhook::WebhookDelivery;

const JOB_COLUMNS: &str = "id, job_type, payload, tenant_id, status, priority, attempt, \
    max_attempts, locked_until, locked_by, last_error, result_summary, created_at, \
    updated_at, started_at, completed_at";

/// Store backed by the `jobs`, `job_progress_events` and
/// `webhook_deliveries` tables.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    backoff: RetryBackoff,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            backoff: RetryBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

#[async_trait]
impl JobStore for PostgresStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type))]
    async fn enqueue(&self, job: NewJob, tenant_id: Option<&str>) -> StoreResult<Uuid> {
        job.validate()?;
        let id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, payload, tenant_id, priority, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(tenant_id)
        .bind(job.priority)
        .bind(job.max_attempts)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn claim(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<Job>> {
        // The CASE reads the pre-update row: reclaiming an expired running
        // job starts a fresh attempt, or reruns the final one at the cap.
        let query = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE
                    (status = 'queued'
                        AND (locked_until IS NULL OR locked_until <= NOW())
                        AND attempt <= max_attempts)
                    OR (status = 'running'
                        AND locked_until < NOW()
                        AND attempt <= max_attempts)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET
                attempt = CASE
                    WHEN status = 'running' AND attempt < max_attempts THEN attempt + 1
                    ELSE attempt
                END,
                status = 'running',
                locked_by = $1,
                locked_until = NOW() + ($2 || ' milliseconds')::INTERVAL,
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Job>(&query)
            .bind(worker_id)
            .bind(millis(lease))
            .fetch_optional(&self.pool)
            .await?;

        if let Some(job) = &job {
            info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt, "job claimed");
        }
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_until = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running' AND locked_by = $3
            "#,
        )
        .bind(millis(lease))
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, result_summary))]
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_summary: serde_json::Value,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                result_summary = $1,
                locked_until = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $2 AND status = 'running' AND locked_by = $3
            "#,
        )
        .bind(&result_summary)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error))]
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> StoreResult<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let held: Option<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT attempt, max_attempts
            FROM jobs
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempt, max_attempts)) = held else {
            return Ok(FailOutcome::NotHeld);
        };

        let outcome = if retryable && attempt < max_attempts {
            // Schedule retry with exponential backoff, on the database clock
            let retry_at: DateTime<Utc> = sqlx::query_scalar(
                r#"
                UPDATE jobs
                SET status = 'queued',
                    attempt = attempt + 1,
                    locked_by = NULL,
                    locked_until = NOW() + ($1 || ' milliseconds')::INTERVAL,
                    last_error = $2,
                    updated_at = NOW()
                WHERE id = $3
                RETURNING locked_until
                "#,
            )
            .bind(millis(self.backoff.delay_for(attempt)))
            .bind(error)
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

            FailOutcome::Retrying {
                attempt: attempt + 1,
                retry_at,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    locked_by = NULL,
                    locked_until = NULL,
                    last_error = $1,
                    completed_at = NOW(),
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(error)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            FailOutcome::Failed
        };

        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, job_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled',
                locked_until = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get(job_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    async fn get(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }
}

#[async_trait]
impl ProgressLog for PostgresStore {
    async fn append(&self, event: NewProgressEvent) -> StoreResult<ProgressEvent> {
        let event = sqlx::query_as::<_, ProgressEvent>(
            r#"
            INSERT INTO job_progress_events (id, job_id, attempt, event_type, message, progress_pct)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, job_id, attempt, event_type, message, progress_pct, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event.job_id)
        .bind(event.attempt)
        .bind(&event.event_type)
        .bind(&event.message)
        .bind(event.progress_pct.clamp(0, 100))
        .fetch_one(&self.pool)
        .await?;

        Ok(event)
    }

    async fn list(&self, job_id: Uuid) -> StoreResult<Vec<ProgressEvent>> {
        let events = sqlx::query_as::<_, ProgressEvent>(
            r#"
            SELECT id, job_id, attempt, event_type, message, progress_pct, created_at
            FROM job_progress_events
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries
                (id, job_id, event, callback_url, status, attempts, last_attempt_at,
                 response_status, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.job_id)
        .bind(&delivery.event)
        .bind(&delivery.callback_url)
        .bind(delivery.status)
        .bind(delivery.attempts)
        .bind(delivery.last_attempt_at)
        .bind(delivery.response_status)
        .bind(&delivery.error_message)
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = $1,
                attempts = $2,
                last_attempt_at = $3,
                response_status = $4,
                error_message = $5
            WHERE id = $6 AND status <> 'delivered'
            "#,
        )
        .bind(delivery.status)
        .bind(delivery.attempts)
        .bind(delivery.last_attempt_at)
        .bind(delivery.response_status)
        .bind(&delivery.error_message)
        .bind(delivery.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deliveries_for_job(&self, job_id: Uuid) -> StoreResult<Vec<WebhookDelivery>> {
        let deliveries = sqlx::query_as::<_, WebhookDelivery>(
            r#"
            SELECT id, job_id, event, callback_url, status, attempts, last_attempt_at,
                   response_status, error_message, created_at
            FROM webhook_deliveries
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_interval_binding() {
        assert_eq!(millis(Duration::from_secs(60)), "60000");
        assert_eq!(millis(Duration::from_millis(1500)), "1500");
    }

    #[test]
    fn test_job_columns_cover_model() {
        for column in ["locked_until", "locked_by", "result_summary", "tenant_id"] {
            assert!(JOB_COLUMNS.contains(column));
        }
    }
}
