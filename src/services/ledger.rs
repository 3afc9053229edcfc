//! src/services/ledger.rs
//!
//! Ledger, the system of record for upload archival state, backed by
//! SQLite. The pipeline only issues conditional, idempotent updates here:
//! a `completed` row is never downgraded, and the completed-commit charges
//! tape capacity exactly once per file even when the job is redelivered.

use crate::models::upload::{NewUpload, UploadRecord};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("upload `{0}` not found in the ledger")]
    UploadNotFound(i64),
    #[error("no notification address on file for upload `{0}`")]
    UserNotFound(i64),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger wraps the `upload_details` table (and the read-only `users`
/// address book) with the transitions the pipeline needs:
/// - Record a fresh upload (`insert_pending`, the intake boundary)
/// - Claim it for an attempt (`mark_processing`)
/// - Commit a verified copy (`mark_completed`, atomic with the capacity charge)
/// - Record a failed attempt (`mark_failed`)
/// - Resolve the owner's notification address (`get_user_email`)
///
/// Every write is conditional on the current status so redelivered jobs and
/// crashed attempts can replay any of them safely.
#[derive(Clone)]
pub struct Ledger {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl Ledger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Record a fresh upload in `pending` state and return its ledger id.
    ///
    /// Called by the intake surface before the job is enqueued; the worker
    /// side treats a delivery without a ledger row as an error rather than
    /// archiving untracked data.
    pub async fn insert_pending(&self, upload: &NewUpload) -> LedgerResult<i64> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO upload_details (user_name, group_name, file_name, file_size,
                                         status, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)
             RETURNING id",
        )
        .bind(&upload.user_name)
        .bind(&upload.group_name)
        .bind(&upload.file_name)
        .bind(upload.file_size)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(id)
    }

    /// Fetch an upload row, if present.
    pub async fn find_upload(&self, file_id: i64) -> LedgerResult<Option<UploadRecord>> {
        let record = sqlx::query_as::<_, UploadRecord>(
            "SELECT id, user_name, group_name, file_name, file_size, status,
                    tape_location, tape_number, checksum, created_at, updated_at
             FROM upload_details WHERE id = ?",
        )
        .bind(file_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Move an upload into `processing` for the current attempt.
    ///
    /// Conditional on the row not being `completed`; returns whether the
    /// transition applied. `false` means another delivery already archived
    /// the file and the caller should short-circuit. A missing row is
    /// `UploadNotFound`.
    pub async fn mark_processing(&self, file_id: i64) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_details
             SET status = 'processing', tape_location = NULL, tape_number = NULL, updated_at = ?
             WHERE id = ? AND status <> 'completed'",
        )
        .bind(Utc::now())
        .bind(file_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            self.require_exists(file_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Commit a verified tape copy.
    ///
    /// One transaction flips the row to `completed` with both tape fields
    /// and the source checksum set, and charges `bytes_used` on the target
    /// tape only when the flip actually happened. Replaying the commit for
    /// an already-completed row is a no-op (`Ok(false)`), so the capacity
    /// charge is exactly-once under redelivery.
    pub async fn mark_completed(
        &self,
        file_id: i64,
        tape_location: &str,
        tape_number: &str,
        bytes: i64,
        checksum: Option<&str>,
    ) -> LedgerResult<bool> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            "UPDATE upload_details
             SET status = 'completed', tape_location = ?, tape_number = ?,
                 checksum = ?, updated_at = ?
             WHERE id = ? AND status <> 'completed'",
        )
        .bind(tape_location)
        .bind(tape_number)
        .bind(checksum)
        .bind(Utc::now())
        .bind(file_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            drop(tx);
            self.require_exists(file_id).await?;
            return Ok(false);
        }

        let charged = sqlx::query("UPDATE tapes SET bytes_used = bytes_used + ? WHERE number = ?")
            .bind(bytes)
            .bind(tape_number)
            .execute(&mut *tx)
            .await?;
        if charged.rows_affected() == 0 {
            warn!(
                file_id,
                tape_number, "tape missing from inventory, capacity charge skipped"
            );
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Record a failed attempt.
    ///
    /// Conditional on the row not being `completed`, so a late failure
    /// (for example a notification path error after commit) can never
    /// overwrite a successful archive. Returns whether the transition
    /// applied.
    pub async fn mark_failed(&self, file_id: i64) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_details
             SET status = 'failed', tape_location = NULL, tape_number = NULL, updated_at = ?
             WHERE id = ? AND status <> 'completed'",
        )
        .bind(Utc::now())
        .bind(file_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            self.require_exists(file_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Resolve the notification address of the upload's owner.
    pub async fn get_user_email(&self, file_id: i64) -> LedgerResult<String> {
        let email = sqlx::query_scalar::<_, String>(
            "SELECT u.email
             FROM upload_details ud
             JOIN users u ON ud.user_name = u.name
             WHERE ud.id = ?",
        )
        .bind(file_id)
        .fetch_optional(&*self.db)
        .await?;

        email.ok_or(LedgerError::UserNotFound(file_id))
    }

    /// Distinguish "row missing" from "update was a guarded no-op".
    async fn require_exists(&self, file_id: i64) -> LedgerResult<()> {
        let present: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_details WHERE id = ?")
            .bind(file_id)
            .fetch_one(&*self.db)
            .await?;
        if present == 0 {
            return Err(LedgerError::UploadNotFound(file_id));
        }
        Ok(())
    }
}
