//! Represents an upload tracked by the storage ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of an upload in the ledger.
///
/// Transitions are monotonic within one attempt
/// (`pending -> processing -> completed | failed`); a retried attempt
/// re-enters `processing` from `failed`, and a `completed` row is never
/// downgraded.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Recorded by the intake surface, not yet claimed by a worker.
    Pending,

    /// Claimed by a worker; the copy pipeline is running.
    Processing,

    /// Verified on tape; both tape fields are set.
    Completed,

    /// The attempt failed; the queue decides whether it is retried.
    Failed,
}

/// One row of the upload ledger, the system of record for archival state.
///
/// The schema guarantees `tape_location` and `tape_number` are both present
/// exactly when `status` is `completed`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadRecord {
    /// Ledger key, referenced by jobs as `file_id`.
    pub id: i64,

    /// Name of the owning user.
    pub user_name: String,

    /// Group the upload belongs to.
    pub group_name: String,

    /// Original filename of the uploaded file.
    pub file_name: String,

    /// Size in bytes, as recorded at upload time.
    pub file_size: i64,

    /// Current lifecycle state.
    pub status: UploadStatus,

    /// Full path of the verified copy on tape, once completed.
    pub tape_location: Option<String>,

    /// Identifier of the tape holding the copy, once completed.
    pub tape_number: Option<String>,

    /// MD5 of the source bytes, computed during the copy.
    pub checksum: Option<String>,

    /// Timestamp the row was created.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last status transition.
    pub updated_at: DateTime<Utc>,
}

/// Input for recording a fresh upload before it is enqueued.
#[derive(Clone, Debug)]
pub struct NewUpload {
    pub user_name: String,
    pub group_name: String,
    pub file_name: String,
    pub file_size: i64,
}
