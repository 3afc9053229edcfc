//! src/services/tape.rs
//!
//! TapeCoordinator serializes access to the tape drive and keeps the
//! mounted tape consistent with the group being archived. Tape assignment
//! and rotation live in the `tapes` inventory table; mount state lives in
//! memory and is only ever mutated under the drive's exclusive lock.

use crate::models::job::FileProcessingJob;
use crate::models::tape::Tape;
use chrono::Utc;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore,
};
use tokio::time::timeout;
use tracing::info;

#[derive(Debug, Error)]
pub enum TapeError {
    #[error("library pool exhausted, no tape can be assigned to group `{0}`")]
    NoTapeAvailable(String),
    #[error("tape drive busy, gave up after {0:?}")]
    DriveBusy(Duration),
    #[error("group `{name}` invalid: {reason}")]
    InvalidGroup { name: String, reason: String },
    #[error("file name `{0}` cannot be stored on tape")]
    InvalidFileName(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TapeResult<T> = Result<T, TapeError>;

const MAX_GROUP_LEN: usize = 128;
const MAX_FILE_NAME_LEN: usize = 255;

/// Tunables for the coordinator, derived from the application config.
#[derive(Clone, Debug)]
pub struct TapeSettings {
    /// Root directory the tape volumes are mounted under.
    pub library_dir: PathBuf,

    /// Capacity threshold at which a tape is retired, in bytes.
    pub capacity_bytes: i64,

    /// Maximum number of tapes the library can hold.
    pub pool_size: i64,

    /// Bound on every wait for the drive (mount lock and writer slots).
    pub mount_timeout: Duration,

    /// Writer slots on the mounted tape; 1 models a single-writer device.
    pub concurrent_copies: usize,
}

/// The tape currently in the drive.
#[derive(Clone, Debug)]
struct MountedTape {
    number: String,
    group: String,
    path: PathBuf,
}

#[derive(Debug, Default)]
struct Drive {
    mounted: Option<MountedTape>,
}

/// Permission to copy onto the mounted tape.
///
/// Holds a shared guard on the drive, so a tape switch cannot begin while
/// any lease is alive, plus one writer slot. Both are released on drop.
#[derive(Debug)]
pub struct TapeLease {
    number: String,
    mount_path: PathBuf,
    _slot: OwnedSemaphorePermit,
    _drive: OwnedRwLockReadGuard<Drive>,
}

impl TapeLease {
    /// Identifier of the leased tape.
    pub fn tape_number(&self) -> &str {
        &self.number
    }

    /// Mount point of the leased tape.
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }
}

/// TapeCoordinator guarantees that at any moment the drive holds at most
/// one tape, that the mounted tape matches the group being written, and
/// that mount switches only happen once in-flight copies have drained.
///
/// Rotation policy: each group keeps at most one `active` tape. When a
/// mount transition finds the group's tape at or past the capacity
/// threshold it is retired and the next sequential tape (`T1`, `T2`, ...)
/// is allocated, bounded by the pool size. The fast path performs no
/// inventory I/O, so capacity is only consulted on mount transitions: a
/// tape that never leaves the drive keeps accepting copies past the
/// threshold and is retired at the next switch.
pub struct TapeCoordinator {
    /// Shared SQLite connection pool holding the tape inventory.
    db: Arc<SqlitePool>,

    drive: Arc<RwLock<Drive>>,
    copy_slots: Arc<Semaphore>,
    settings: TapeSettings,
}

impl TapeCoordinator {
    pub fn new(db: Arc<SqlitePool>, settings: TapeSettings) -> Self {
        Self {
            db,
            drive: Arc::new(RwLock::new(Drive::default())),
            copy_slots: Arc::new(Semaphore::new(settings.concurrent_copies)),
            settings,
        }
    }

    /// Ensure the drive holds the tape assigned to `group` and hand out a
    /// copy lease on it.
    ///
    /// Fast path: the mounted tape already serves the group and the lease
    /// is returned without touching the inventory. Slow path: waits for
    /// in-flight copies to drain, unmounts, resolves the group's tape
    /// (rotating at the capacity threshold), mounts it, then downgrades
    /// back to a shared lease with no window for another switch in between.
    /// Every wait is bounded by `mount_timeout`; expiry is `DriveBusy`.
    pub async fn ensure_correct_tape(&self, group: &str) -> TapeResult<TapeLease> {
        self.ensure_group_safe(group)?;

        let drive = timeout(
            self.settings.mount_timeout,
            Arc::clone(&self.drive).read_owned(),
        )
        .await
        .map_err(|_| TapeError::DriveBusy(self.settings.mount_timeout))?;
        if let Some(mounted) = drive.mounted.clone() {
            if mounted.group == group {
                return self.lease(drive, mounted).await;
            }
        }
        drop(drive);

        let mut drive = timeout(
            self.settings.mount_timeout,
            Arc::clone(&self.drive).write_owned(),
        )
        .await
        .map_err(|_| TapeError::DriveBusy(self.settings.mount_timeout))?;

        // Another job may have switched the tape while we waited.
        let mounted = match drive.mounted.clone() {
            Some(current) if current.group == group => current,
            _ => {
                if let Some(previous) = drive.mounted.take() {
                    info!(tape = %previous.number, group = %previous.group, "unmounting tape");
                }
                let tape = self.resolve_group_tape(group).await?;
                let path = self.settings.library_dir.join(&tape.number);
                fs::create_dir_all(&path).await?;
                let mounted = MountedTape {
                    number: tape.number,
                    group: group.to_string(),
                    path,
                };
                info!(tape = %mounted.number, group, "mounted tape");
                drive.mounted = Some(mounted.clone());
                mounted
            }
        };

        self.lease(OwnedRwLockWriteGuard::downgrade(drive), mounted)
            .await
    }

    /// Compute the destination for a job on the leased tape.
    ///
    /// Pure path math, no I/O: `library/{tape}/{group}/{file_id}_{file_name}`.
    /// The ledger id prefix keeps concurrent jobs collision-free, and the
    /// same job always maps to the same path, so a redelivered copy simply
    /// overwrites its own artifact.
    pub fn create_tape_path(
        &self,
        lease: &TapeLease,
        job: &FileProcessingJob,
    ) -> TapeResult<PathBuf> {
        self.ensure_group_safe(&job.group_name)?;
        self.ensure_file_name_safe(&job.file_name)?;
        Ok(lease
            .mount_path()
            .join(&job.group_name)
            .join(format!("{}_{}", job.file_id, job.file_name)))
    }

    /// Snapshot of the library inventory, newest allocation first.
    pub async fn list_tapes(&self) -> TapeResult<Vec<Tape>> {
        let tapes = sqlx::query_as::<_, Tape>(
            "SELECT seq, number, group_name, status, bytes_used, created_at
             FROM tapes ORDER BY seq DESC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(tapes)
    }

    /// Attach a writer slot to a drive guard whose mounted tape serves the
    /// caller's group.
    async fn lease(
        &self,
        drive: OwnedRwLockReadGuard<Drive>,
        tape: MountedTape,
    ) -> TapeResult<TapeLease> {
        // The semaphore is never closed; a closed drive reads as busy.
        let slot = match timeout(
            self.settings.mount_timeout,
            Arc::clone(&self.copy_slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(slot)) => slot,
            _ => return Err(TapeError::DriveBusy(self.settings.mount_timeout)),
        };

        Ok(TapeLease {
            number: tape.number,
            mount_path: tape.path,
            _slot: slot,
            _drive: drive,
        })
    }

    /// Resolve the tape assigned to `group`, rotating at the capacity
    /// threshold. Runs only under the drive's exclusive lock.
    async fn resolve_group_tape(&self, group: &str) -> TapeResult<Tape> {
        if let Some(tape) = self.active_tape(group).await? {
            if tape.bytes_used < self.settings.capacity_bytes {
                return Ok(tape);
            }
            info!(
                tape = %tape.number,
                bytes_used = tape.bytes_used,
                "tape reached capacity threshold, retiring"
            );
            self.retire_tape(tape.seq).await?;
        }
        self.allocate_tape(group).await
    }

    async fn active_tape(&self, group: &str) -> TapeResult<Option<Tape>> {
        let tape = sqlx::query_as::<_, Tape>(
            "SELECT seq, number, group_name, status, bytes_used, created_at
             FROM tapes WHERE group_name = ? AND status = 'active'",
        )
        .bind(group)
        .fetch_optional(&*self.db)
        .await?;
        Ok(tape)
    }

    async fn retire_tape(&self, seq: i64) -> TapeResult<()> {
        sqlx::query("UPDATE tapes SET status = 'full' WHERE seq = ?")
            .bind(seq)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Allocate the next sequential tape for `group`, bounded by the pool.
    async fn allocate_tape(&self, group: &str) -> TapeResult<Tape> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tapes")
            .fetch_one(&*self.db)
            .await?;
        if total >= self.settings.pool_size {
            return Err(TapeError::NoTapeAvailable(group.to_string()));
        }

        let tape = sqlx::query_as::<_, Tape>(
            "INSERT INTO tapes (seq, number, group_name, status, bytes_used, created_at)
             SELECT COALESCE(MAX(seq), 0) + 1, 'T' || (COALESCE(MAX(seq), 0) + 1), ?, 'active', 0, ?
             FROM tapes
             RETURNING seq, number, group_name, status, bytes_used, created_at",
        )
        .bind(group)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;
        info!(tape = %tape.number, group, "allocated tape");
        Ok(tape)
    }

    /// Basic group validation to avoid trivial path traversal vectors.
    ///
    /// Group names become directory components under the mount point, so
    /// separators, traversal sequences and control bytes are rejected.
    fn ensure_group_safe(&self, group: &str) -> TapeResult<()> {
        let invalid = |reason: &str| TapeError::InvalidGroup {
            name: group.to_string(),
            reason: reason.into(),
        };

        if group.is_empty() || group.len() > MAX_GROUP_LEN {
            return Err(invalid("must be between 1 and 128 characters"));
        }
        if group.trim() != group {
            return Err(invalid("cannot begin or end with whitespace"));
        }
        if group.contains('/') || group.contains('\\') || group.contains("..") {
            return Err(invalid(
                "cannot contain path separators or traversal sequences",
            ));
        }
        if group.starts_with('.') {
            return Err(invalid("cannot begin with a dot"));
        }
        if group.bytes().any(|b| b.is_ascii_control()) {
            return Err(invalid("cannot contain control characters"));
        }
        Ok(())
    }

    /// File names are stored as a single path component beneath the group
    /// directory.
    fn ensure_file_name_safe(&self, name: &str) -> TapeResult<()> {
        if name.is_empty() || name.len() > MAX_FILE_NAME_LEN {
            return Err(TapeError::InvalidFileName(name.to_string()));
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(TapeError::InvalidFileName(name.to_string()));
        }
        if name.bytes().any(|b| b.is_ascii_control()) {
            return Err(TapeError::InvalidFileName(name.to_string()));
        }
        Ok(())
    }
}
