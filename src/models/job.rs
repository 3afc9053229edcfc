//! Represents a single archival work item pulled from the intake queue.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One file-archival job, as delivered by the intake queue.
///
/// A job describes a staged upload awaiting transfer onto tape. It is
/// immutable once dequeued; retries redeliver the same payload with a new
/// attempt counter rather than mutating it in place.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileProcessingJob {
    /// Ledger key of the upload this job archives.
    pub file_id: i64,

    /// Original filename of the uploaded file.
    pub file_name: String,

    /// Size in bytes, as recorded at upload time.
    pub file_size: i64,

    /// Name of the user who requested the archival.
    pub user_name: String,

    /// Group the upload belongs to; determines the target tape.
    pub group_name: String,

    /// Whether the requesting user holds the admin role.
    pub is_admin: bool,

    /// Local staging path holding the uploaded bytes.
    pub file_path: PathBuf,

    /// Timestamp the archival was requested.
    pub requested_at: DateTime<Utc>,
}
