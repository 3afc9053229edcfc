//! Job intake queue: at-least-once delivery over a SQLite table.
//!
//! Producers upsert one row per upload; workers claim the oldest due row
//! with a single atomic UPDATE, stamping a fresh claim token per delivery.
//! A claimed row whose visibility window lapses without an ack is
//! redelivered, which is the crash-recovery path; rows that burn through
//! their allowed attempts are parked as `exhausted` until re-enqueued.

pub mod worker;

use crate::models::job::FileProcessingJob;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage failed: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Tunables for delivery and retry, derived from the application config.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    /// Delivery attempts before a job is parked as exhausted.
    pub max_attempts: i64,

    /// How long a claimed job stays invisible before it is redelivered.
    pub visibility_timeout: Duration,

    /// First retry delay; doubles on every further attempt.
    pub retry_base: Duration,

    /// Ceiling on the retry delay.
    pub retry_cap: Duration,
}

/// One delivery of a job to a worker.
///
/// The claim token fences stale deliveries: once the visibility window
/// lapses and the job is claimed again, acks and nacks carrying the
/// superseded token are ignored.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue_id: i64,
    pub claim_token: Uuid,
    pub attempt: i64,
    pub max_attempts: i64,
    pub job: FileProcessingJob,
}

#[derive(FromRow)]
struct ClaimedRow {
    id: i64,
    file_id: i64,
    file_name: String,
    file_size: i64,
    user_name: String,
    group_name: String,
    is_admin: bool,
    file_path: String,
    requested_at: DateTime<Utc>,
    attempts: i64,
    max_attempts: i64,
    claim_token: Uuid,
}

impl From<ClaimedRow> for Delivery {
    fn from(row: ClaimedRow) -> Self {
        Delivery {
            queue_id: row.id,
            claim_token: row.claim_token,
            attempt: row.attempts,
            max_attempts: row.max_attempts,
            job: FileProcessingJob {
                file_id: row.file_id,
                file_name: row.file_name,
                file_size: row.file_size,
                user_name: row.user_name,
                group_name: row.group_name,
                is_admin: row.is_admin,
                file_path: PathBuf::from(row.file_path),
                requested_at: row.requested_at,
            },
        }
    }
}

/// JobQueue wraps the `job_queue` table with the at-least-once contract:
/// - `enqueue` upserts on `file_id` and revives exhausted rows
/// - `claim_next` atomically claims the oldest due or lapsed row
/// - `ack` / `nack` settle a delivery, fenced by its claim token
#[derive(Clone)]
pub struct JobQueue {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(db: Arc<SqlitePool>, settings: QueueSettings) -> Self {
        Self { db, settings }
    }

    /// Put a job on the queue, or refresh it if already present.
    ///
    /// An `exhausted` row is revived with its attempt count reset; a row in
    /// any other state only picks up the new staging path, so duplicate
    /// submissions cannot double-deliver.
    pub async fn enqueue(&self, job: &FileProcessingJob) -> QueueResult<i64> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO job_queue (file_id, file_name, file_size, user_name, group_name,
                                    is_admin, file_path, requested_at, status, attempts,
                                    max_attempts, next_attempt_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'queued', 0, ?, ?, ?)
             ON CONFLICT(file_id) DO UPDATE SET
                 file_path = excluded.file_path,
                 status = CASE WHEN job_queue.status = 'exhausted'
                               THEN 'queued' ELSE job_queue.status END,
                 attempts = CASE WHEN job_queue.status = 'exhausted'
                                 THEN 0 ELSE job_queue.attempts END,
                 next_attempt_at = CASE WHEN job_queue.status = 'exhausted'
                                        THEN excluded.next_attempt_at
                                        ELSE job_queue.next_attempt_at END,
                 last_error = CASE WHEN job_queue.status = 'exhausted'
                                   THEN NULL ELSE job_queue.last_error END
             RETURNING id",
        )
        .bind(job.file_id)
        .bind(&job.file_name)
        .bind(job.file_size)
        .bind(&job.user_name)
        .bind(&job.group_name)
        .bind(job.is_admin)
        .bind(job.file_path.to_string_lossy().into_owned())
        .bind(job.requested_at)
        .bind(self.settings.max_attempts)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        debug!(file_id = job.file_id, queue_id = id, "job enqueued");
        Ok(id)
    }

    /// Claim the next deliverable job, if any.
    ///
    /// Deliverable means `queued` and due, or `in_flight` with a lapsed
    /// visibility window and attempts remaining. Lapsed rows with no
    /// attempts left are swept to `exhausted` first. The claim itself is a
    /// single UPDATE, so concurrent workers can never claim the same row.
    pub async fn claim_next(&self) -> QueueResult<Option<Delivery>> {
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::milliseconds(self.settings.visibility_timeout.as_millis() as i64);

        sqlx::query(
            "UPDATE job_queue
             SET status = 'exhausted', claim_token = NULL, claimed_at = NULL,
                 last_error = COALESCE(last_error, 'delivery attempts exhausted')
             WHERE status = 'in_flight' AND claimed_at <= ? AND attempts >= max_attempts",
        )
        .bind(stale_cutoff)
        .execute(&*self.db)
        .await?;

        let row = sqlx::query_as::<_, ClaimedRow>(
            "UPDATE job_queue
             SET status = 'in_flight', attempts = attempts + 1, claim_token = ?, claimed_at = ?
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE (status = 'queued' AND next_attempt_at <= ?)
                    OR (status = 'in_flight' AND claimed_at <= ? AND attempts < max_attempts)
                 ORDER BY next_attempt_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING id, file_id, file_name, file_size, user_name, group_name, is_admin,
                       file_path, requested_at, attempts, max_attempts, claim_token",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(now)
        .bind(stale_cutoff)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(Delivery::from))
    }

    /// Settle a delivery as done. Returns false when the claim was
    /// superseded by a redelivery in the meantime.
    pub async fn ack(&self, delivery: &Delivery) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET status = 'acked', claim_token = NULL, claimed_at = NULL, last_error = NULL
             WHERE id = ? AND claim_token = ?",
        )
        .bind(delivery.queue_id)
        .bind(delivery.claim_token)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                queue_id = delivery.queue_id,
                file_id = delivery.job.file_id,
                "ack ignored, claim was superseded"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Settle a delivery as failed and schedule the retry.
    ///
    /// The next attempt is delayed by exponential backoff; a delivery that
    /// used up the last allowed attempt parks the row as `exhausted` instead.
    /// Returns false when the claim was superseded.
    pub async fn nack(&self, delivery: &Delivery, error: &str) -> QueueResult<bool> {
        let exhausted = delivery.attempt >= delivery.max_attempts;
        let status = if exhausted { "exhausted" } else { "queued" };
        let delay = self.backoff(delivery.attempt);
        let next_attempt_at =
            Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let result = sqlx::query(
            "UPDATE job_queue
             SET status = ?, next_attempt_at = ?, last_error = ?,
                 claim_token = NULL, claimed_at = NULL
             WHERE id = ? AND claim_token = ?",
        )
        .bind(status)
        .bind(next_attempt_at)
        .bind(error)
        .bind(delivery.queue_id)
        .bind(delivery.claim_token)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                queue_id = delivery.queue_id,
                file_id = delivery.job.file_id,
                "nack ignored, claim was superseded"
            );
            return Ok(false);
        }
        debug!(
            queue_id = delivery.queue_id,
            attempt = delivery.attempt,
            status,
            delay_ms = delay.as_millis() as u64,
            "delivery settled as failed"
        );
        Ok(true)
    }

    /// Deterministic exponential backoff: `retry_base * 2^(attempt-1)`,
    /// clamped to `retry_cap`.
    fn backoff(&self, attempt: i64) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
        self.settings
            .retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.settings.retry_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    fn settings() -> QueueSettings {
        QueueSettings {
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(600),
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_millis(400),
        }
    }

    async fn test_queue(settings: QueueSettings) -> JobQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        JobQueue::new(Arc::new(pool), settings)
    }

    fn job(file_id: i64) -> FileProcessingJob {
        FileProcessingJob {
            file_id,
            file_name: "report.pdf".into(),
            file_size: 10,
            user_name: "mira".into(),
            group_name: "physics".into(),
            is_admin: false,
            file_path: PathBuf::from("/staging/report.pdf"),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_delivers_enqueued_job_once() {
        let queue = test_queue(settings()).await;
        queue.enqueue(&job(1)).await.unwrap();

        let delivery = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(delivery.job.file_id, 1);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.job.file_path, PathBuf::from("/staging/report.pdf"));

        // Still claimed, nothing else to deliver.
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let queue = test_queue(settings()).await;
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_parks_the_row() {
        let queue = test_queue(settings()).await;
        queue.enqueue(&job(1)).await.unwrap();

        let delivery = queue.claim_next().await.unwrap().unwrap();
        assert!(queue.ack(&delivery).await.unwrap());
        assert!(queue.claim_next().await.unwrap().is_none());

        let status: String = sqlx::query_scalar("SELECT status FROM job_queue WHERE id = ?")
            .bind(delivery.queue_id)
            .fetch_one(&*queue.db)
            .await
            .unwrap();
        assert_eq!(status, "acked");
    }

    #[tokio::test]
    async fn nack_schedules_a_delayed_retry() {
        let queue = test_queue(settings()).await;
        queue.enqueue(&job(1)).await.unwrap();

        let delivery = queue.claim_next().await.unwrap().unwrap();
        assert!(queue.nack(&delivery, "copy failed").await.unwrap());

        // Backoff pushed the row into the future.
        assert!(queue.claim_next().await.unwrap().is_none());

        sqlx::query("UPDATE job_queue SET next_attempt_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::seconds(1))
            .bind(delivery.queue_id)
            .execute(&*queue.db)
            .await
            .unwrap();

        let retried = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(retried.attempt, 2);
        assert_ne!(retried.claim_token, delivery.claim_token);

        let last_error: Option<String> =
            sqlx::query_scalar("SELECT last_error FROM job_queue WHERE id = ?")
                .bind(delivery.queue_id)
                .fetch_one(&*queue.db)
                .await
                .unwrap();
        assert_eq!(last_error.as_deref(), Some("copy failed"));
    }

    #[tokio::test]
    async fn lapsed_visibility_redelivers_with_fresh_token() {
        let mut settings = settings();
        settings.visibility_timeout = Duration::ZERO;
        let queue = test_queue(settings).await;
        queue.enqueue(&job(1)).await.unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(second.job.file_id, 1);
        assert_eq!(second.attempt, 2);
        assert_ne!(second.claim_token, first.claim_token);

        // The superseded delivery can no longer settle the row.
        assert!(!queue.ack(&first).await.unwrap());
        assert!(queue.ack(&second).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_rows_park_until_re_enqueued() {
        let mut settings = settings();
        settings.max_attempts = 1;
        settings.visibility_timeout = Duration::ZERO;
        let queue = test_queue(settings).await;
        queue.enqueue(&job(1)).await.unwrap();

        let only = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(only.attempt, 1);

        // The lapsed claim has no attempts left: swept, not redelivered.
        assert!(queue.claim_next().await.unwrap().is_none());
        let status: String = sqlx::query_scalar("SELECT status FROM job_queue WHERE file_id = 1")
            .fetch_one(&*queue.db)
            .await
            .unwrap();
        assert_eq!(status, "exhausted");

        // Re-enqueueing revives the row with fresh attempts.
        queue.enqueue(&job(1)).await.unwrap();
        let revived = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(revived.attempt, 1);
    }

    #[tokio::test]
    async fn duplicate_enqueue_does_not_double_deliver() {
        let queue = test_queue(settings()).await;
        let first_id = queue.enqueue(&job(1)).await.unwrap();
        let second_id = queue.enqueue(&job(1)).await.unwrap();
        assert_eq!(first_id, second_id);

        assert!(queue.claim_next().await.unwrap().is_some());
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let queue = test_queue(settings()).await;
        assert_eq!(queue.backoff(1), Duration::from_millis(100));
        assert_eq!(queue.backoff(2), Duration::from_millis(200));
        assert_eq!(queue.backoff(3), Duration::from_millis(400));
        assert_eq!(queue.backoff(4), Duration::from_millis(400));
        assert_eq!(queue.backoff(40), Duration::from_millis(400));
    }
}
