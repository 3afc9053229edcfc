//! Represents a tape volume in the library inventory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Inventory state of a tape volume.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TapeStatus {
    /// The tape currently assigned to its group; new copies land here.
    Active,

    /// Retired at the capacity threshold; kept for retrieval only.
    Full,
}

/// One tape volume in the library.
///
/// Tapes are allocated sequentially; `number` is derived from `seq`
/// (`T1`, `T2`, ...) and never reused. At most one tape per group is
/// `active` at a time.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Tape {
    /// Monotonic allocation sequence.
    pub seq: i64,

    /// Human-readable tape identifier, derived from `seq`.
    pub number: String,

    /// Group this tape is assigned to.
    pub group_name: String,

    /// Inventory state.
    pub status: TapeStatus,

    /// Bytes committed to this tape by verified copies.
    pub bytes_used: i64,

    /// Timestamp the tape was allocated.
    pub created_at: DateTime<Utc>,
}
