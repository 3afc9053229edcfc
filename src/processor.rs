//! src/processor.rs
//!
//! FileProcessor drives one archival job through its lifecycle per
//! delivery attempt: mark processing, mount the group's tape, copy the
//! staged file, verify the copy, commit to the ledger, notify. Wherever
//! failure strikes, the ledger ends in a consistent terminal state, the
//! tape holds no partial artifact, and the staged input is cleaned up
//! exactly once.

use crate::models::job::FileProcessingJob;
use crate::models::upload::UploadStatus;
use crate::services::ledger::{Ledger, LedgerError};
use crate::services::notify::{AdminAlerter, AlertContext, ArchiveDetails, Mailer, NoticeOutcome};
use crate::services::tape::{TapeCoordinator, TapeError};
use futures::{StreamExt, pin_mut};
use md5::Context;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("size mismatch: source {source_bytes} bytes, tape copy {tape_bytes} bytes")]
    SizeMismatch { source_bytes: u64, tape_bytes: u64 },
    #[error("checksum mismatch: source {source_digest}, tape copy {tape_digest}")]
    ChecksumMismatch {
        source_digest: String,
        tape_digest: String,
    },
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("tape mount failed: {0}")]
    Mount(#[from] TapeError),
    #[error("copy to tape failed at `{path}`: {source}")]
    Copy { path: PathBuf, source: io::Error },
    #[error("tape copy verification failed: {0}")]
    Verify(#[from] VerifyError),
    #[error("ledger update failed: {0}")]
    Ledger(#[from] LedgerError),
}

impl ProcessError {
    /// Pipeline stage the error belongs to, used in alerts and logs.
    pub fn stage(&self) -> &'static str {
        match self {
            ProcessError::Mount(_) => "tape_mount",
            ProcessError::Copy { .. } => "file_copy",
            ProcessError::Verify(_) => "file_verification",
            ProcessError::Ledger(_) => "ledger_update",
        }
    }
}

/// Terminal outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The file was copied, verified and committed on this attempt.
    Archived {
        tape_number: String,
        tape_location: String,
    },
    /// A previous delivery already archived the file.
    AlreadyArchived,
}

#[derive(Debug)]
struct CopyReport {
    bytes_copied: i64,
    source_digest: String,
}

/// FileProcessor runs the copy/verify/commit state machine:
///
/// ```text
/// pending --(claimed)--> processing --(copy+verify ok)--> completed
///                             \--(any step fails)-------> failed
/// ```
///
/// Failed attempts stay retryable; the queue layer owns redelivery. The
/// notification sinks are best-effort throughout and never change a
/// terminal state.
pub struct FileProcessor {
    ledger: Ledger,
    tapes: Arc<TapeCoordinator>,
    mailer: Arc<dyn Mailer>,
    alerts: Arc<dyn AdminAlerter>,
    verify_checksum: bool,
}

impl FileProcessor {
    pub fn new(
        ledger: Ledger,
        tapes: Arc<TapeCoordinator>,
        mailer: Arc<dyn Mailer>,
        alerts: Arc<dyn AdminAlerter>,
        verify_checksum: bool,
    ) -> Self {
        Self {
            ledger,
            tapes,
            mailer,
            alerts,
            verify_checksum,
        }
    }

    /// Run one delivery attempt to a terminal state.
    ///
    /// On failure the ledger is marked `failed`, an admin alert and a
    /// best-effort failure notice go out, and the original error is
    /// returned unchanged for the queue's retry policy. The staged input
    /// file is removed on every exit path.
    pub async fn process(&self, job: &FileProcessingJob) -> Result<JobOutcome, ProcessError> {
        let span = info_span!(
            "archive_job",
            file_id = job.file_id,
            group = %job.group_name,
            admin = job.is_admin
        );
        async {
            info!(file_name = %job.file_name, size = job.file_size, "processing upload");

            let result = self.archive(job).await;
            if let Err(error) = &result {
                self.report_failure(job, error).await;
            }
            self.cleanup_staging(job).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn archive(&self, job: &FileProcessingJob) -> Result<JobOutcome, ProcessError> {
        // Redelivery of an archived job settles idempotently, without
        // touching the tape.
        match self.ledger.find_upload(job.file_id).await? {
            None => return Err(LedgerError::UploadNotFound(job.file_id).into()),
            Some(record) if record.status == UploadStatus::Completed => {
                info!("upload already archived, short-circuiting redelivery");
                return Ok(JobOutcome::AlreadyArchived);
            }
            Some(_) => {}
        }
        if !self.ledger.mark_processing(job.file_id).await? {
            info!("upload completed concurrently, short-circuiting");
            return Ok(JobOutcome::AlreadyArchived);
        }

        let lease = self.tapes.ensure_correct_tape(&job.group_name).await?;
        info!(stage = "tape_mount", tape = %lease.tape_number(), "tape ready");

        let dest = self.tapes.create_tape_path(&lease, job)?;

        let copy = self.copy_to_tape(&job.file_path, &dest).await?;
        info!(
            stage = "file_copy",
            bytes = copy.bytes_copied,
            dest = %dest.display(),
            "copy written"
        );

        self.verify_copy(&job.file_path, &dest, &copy).await?;
        info!(stage = "file_verification", "copy verified");

        // Device access ends once the copy is verified.
        let tape_number = lease.tape_number().to_string();
        drop(lease);

        let tape_location = dest.to_string_lossy().into_owned();
        self.ledger
            .mark_completed(
                job.file_id,
                &tape_location,
                &tape_number,
                copy.bytes_copied,
                Some(&copy.source_digest),
            )
            .await?;
        info!(stage = "ledger_update", tape = %tape_number, "upload committed");

        self.send_success_notice(job, &tape_location, &tape_number)
            .await;

        Ok(JobOutcome::Archived {
            tape_number,
            tape_location,
        })
    }

    /// Stream the staged file onto the tape.
    ///
    /// Bytes go through a temp sibling first and are renamed into place
    /// once synced, with the MD5 digest and byte count accumulated en
    /// route. Every error arm removes the temp file; the final destination
    /// is only ever a complete copy.
    async fn copy_to_tape(&self, source: &Path, dest: &Path) -> Result<CopyReport, ProcessError> {
        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            ProcessError::Copy {
                path: dest.to_path_buf(),
                source: io::Error::new(ErrorKind::Other, "tape path missing parent directory"),
            }
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| ProcessError::Copy {
                path: parent.clone(),
                source: err,
            })?;

        let input = File::open(source).await.map_err(|err| ProcessError::Copy {
            path: source.to_path_buf(),
            source: err,
        })?;
        let stream = ReaderStream::new(input);

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path)
            .await
            .map_err(|err| ProcessError::Copy {
                path: tmp_path.clone(),
                source: err,
            })?;

        let mut bytes_copied: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ProcessError::Copy {
                        path: source.to_path_buf(),
                        source: err,
                    });
                }
            };
            bytes_copied += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = out.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ProcessError::Copy {
                    path: tmp_path.clone(),
                    source: err,
                });
            }
        }
        if let Err(err) = out.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ProcessError::Copy {
                path: tmp_path.clone(),
                source: err,
            });
        }
        if let Err(err) = out.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ProcessError::Copy {
                path: tmp_path.clone(),
                source: err,
            });
        }

        if let Err(err) = fs::rename(&tmp_path, dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                // A redelivered job overwrites its own earlier artifact.
                if let Err(err) = fs::remove_file(dest).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ProcessError::Copy {
                        path: dest.to_path_buf(),
                        source: err,
                    });
                }
                if let Err(err) = fs::rename(&tmp_path, dest).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ProcessError::Copy {
                        path: dest.to_path_buf(),
                        source: err,
                    });
                }
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ProcessError::Copy {
                    path: dest.to_path_buf(),
                    source: err,
                });
            }
        }

        Ok(CopyReport {
            bytes_copied,
            source_digest: format!("{:x}", digest.compute()),
        })
    }

    /// Compare source and tape copy with independent stat calls, and
    /// optionally re-read the copy to compare digests. A content mismatch
    /// removes the artifact before the error is raised, so a failed
    /// verification leaves nothing at the destination path.
    async fn verify_copy(
        &self,
        source: &Path,
        dest: &Path,
        copy: &CopyReport,
    ) -> Result<(), ProcessError> {
        let source_bytes = fs::metadata(source)
            .await
            .map_err(|err| ProcessError::Copy {
                path: source.to_path_buf(),
                source: err,
            })?
            .len();
        let tape_bytes = fs::metadata(dest)
            .await
            .map_err(|err| ProcessError::Copy {
                path: dest.to_path_buf(),
                source: err,
            })?
            .len();
        if source_bytes != tape_bytes {
            self.discard_artifact(dest).await;
            return Err(VerifyError::SizeMismatch {
                source_bytes,
                tape_bytes,
            }
            .into());
        }

        if self.verify_checksum {
            let tape_digest = digest_file(dest).await.map_err(|err| ProcessError::Copy {
                path: dest.to_path_buf(),
                source: err,
            })?;
            if tape_digest != copy.source_digest {
                self.discard_artifact(dest).await;
                return Err(VerifyError::ChecksumMismatch {
                    source_digest: copy.source_digest.clone(),
                    tape_digest,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Remove a failed copy from the tape; never louder than a log line.
    async fn discard_artifact(&self, dest: &Path) {
        match fs::remove_file(dest).await {
            Ok(_) => debug!(dest = %dest.display(), "removed failed tape copy"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                error!(dest = %dest.display(), error = %err, "failed to remove bad tape copy");
            }
        }
    }

    /// The failure path: ledger to `failed`, admin alert, best-effort user
    /// notice. Each step is individually best-effort; the caller re-raises
    /// the original error untouched.
    async fn report_failure(&self, job: &FileProcessingJob, error: &ProcessError) {
        error!(stage = error.stage(), error = %error, "archival attempt failed");

        if let Err(ledger_err) = self.ledger.mark_failed(job.file_id).await {
            error!(error = %ledger_err, "failed to record failure in ledger");
        }

        let context = AlertContext {
            file_id: job.file_id,
            file_name: job.file_name.clone(),
        };
        if let Err(alert_err) = self
            .alerts
            .critical_error(error.stage(), &error.to_string(), &context)
            .await
        {
            warn!(error = %alert_err, "admin alert could not be delivered");
        }

        match self.ledger.get_user_email(job.file_id).await {
            Ok(email) => {
                if let Err(mail_err) = self
                    .mailer
                    .file_processed(&email, &job.file_name, NoticeOutcome::Failed, None)
                    .await
                {
                    warn!(error = %mail_err, "failure notice could not be delivered");
                }
            }
            Err(lookup_err) => {
                warn!(error = %lookup_err, "no notification address for failure notice");
            }
        }
    }

    /// Success notice, best-effort: a delivery failure here is logged and
    /// swallowed, the job stays committed.
    async fn send_success_notice(
        &self,
        job: &FileProcessingJob,
        tape_location: &str,
        tape_number: &str,
    ) {
        let email = match self.ledger.get_user_email(job.file_id).await {
            Ok(email) => email,
            Err(err) => {
                warn!(error = %err, "no notification address for success notice");
                return;
            }
        };
        let details = ArchiveDetails {
            tape_location: tape_location.to_string(),
            tape_number: tape_number.to_string(),
            requested_at: job.requested_at,
        };
        if let Err(err) = self
            .mailer
            .file_processed(&email, &job.file_name, NoticeOutcome::Success, Some(&details))
            .await
        {
            warn!(error = %err, "success notice could not be delivered");
        }
    }

    /// Remove the staged input, tolerating its absence. Runs once per
    /// attempt, on every exit path, and never overrides the job outcome.
    async fn cleanup_staging(&self, job: &FileProcessingJob) {
        match fs::remove_file(&job.file_path).await {
            Ok(_) => debug!(path = %job.file_path.display(), "removed staged file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %job.file_path.display(), "staged file already gone");
            }
            Err(err) => {
                warn!(path = %job.file_path.display(), error = %err, "failed to remove staged file");
            }
        }
    }
}

/// Stream a file through an MD5 digest.
async fn digest_file(path: &Path) -> io::Result<String> {
    let file = File::open(path).await?;
    let stream = ReaderStream::new(file);
    pin_mut!(stream);
    let mut digest = Context::new();
    while let Some(chunk) = stream.next().await {
        digest.consume(&chunk?);
    }
    Ok(format!("{:x}", digest.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notify::{LogAlerter, LogMailer};
    use crate::services::tape::TapeSettings;
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn test_processor(dir: &TempDir, verify_checksum: bool) -> FileProcessor {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let pool: Arc<SqlitePool> = Arc::new(pool);

        let settings = TapeSettings {
            library_dir: dir.path().join("tapes"),
            capacity_bytes: 1_000_000,
            pool_size: 4,
            mount_timeout: Duration::from_millis(500),
            concurrent_copies: 1,
        };
        FileProcessor::new(
            Ledger::new(Arc::clone(&pool)),
            Arc::new(TapeCoordinator::new(Arc::clone(&pool), settings)),
            Arc::new(LogMailer),
            Arc::new(LogAlerter),
            verify_checksum,
        )
    }

    async fn write_file(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn copy_streams_bytes_and_digest() {
        let dir = TempDir::new().unwrap();
        let processor = test_processor(&dir, false).await;

        let source = dir.path().join("staging/report.pdf");
        write_file(&source, b"0123456789").await;
        let dest = dir.path().join("tapes/T1/physics/1_report.pdf");

        let report = processor.copy_to_tape(&source, &dest).await.unwrap();
        assert_eq!(report.bytes_copied, 10);
        assert_eq!(report.source_digest, format!("{:x}", md5::compute(b"0123456789")));
        assert_eq!(fs::read(&dest).await.unwrap(), b"0123456789");

        // No temp files left behind next to the artifact.
        let mut entries = fs::read_dir(dest.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["1_report.pdf".to_string()]);
    }

    #[tokio::test]
    async fn copy_overwrites_a_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let processor = test_processor(&dir, false).await;

        let source = dir.path().join("staging/report.pdf");
        write_file(&source, b"new contents").await;
        let dest = dir.path().join("tapes/T1/physics/1_report.pdf");
        write_file(&dest, b"stale").await;

        processor.copy_to_tape(&source, &dest).await.unwrap();
        assert_eq!(fs::read(&dest).await.unwrap(), b"new contents");
    }

    #[tokio::test]
    async fn missing_source_is_a_copy_error() {
        let dir = TempDir::new().unwrap();
        let processor = test_processor(&dir, false).await;

        let source = dir.path().join("staging/nope.bin");
        let dest = dir.path().join("tapes/T1/physics/1_nope.bin");
        let err = processor.copy_to_tape(&source, &dest).await.unwrap_err();
        assert!(matches!(err, ProcessError::Copy { path, .. } if path == source));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn truncated_copy_fails_verification_and_is_removed() {
        let dir = TempDir::new().unwrap();
        let processor = test_processor(&dir, false).await;

        let source = dir.path().join("staging/report.pdf");
        write_file(&source, b"0123456789").await;
        let dest = dir.path().join("tapes/T1/physics/1_report.pdf");
        write_file(&dest, b"01234567").await;

        let report = CopyReport {
            bytes_copied: 8,
            source_digest: String::new(),
        };
        let err = processor
            .verify_copy(&source, &dest, &report)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Verify(VerifyError::SizeMismatch {
                source_bytes: 10,
                tape_bytes: 8
            })
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn checksum_mode_catches_corruption_of_equal_size() {
        let dir = TempDir::new().unwrap();
        let processor = test_processor(&dir, true).await;

        let source = dir.path().join("staging/report.pdf");
        write_file(&source, b"0123456789").await;
        let dest = dir.path().join("tapes/T1/physics/1_report.pdf");
        write_file(&dest, b"012345678X").await;

        let report = CopyReport {
            bytes_copied: 10,
            source_digest: format!("{:x}", md5::compute(b"0123456789")),
        };
        let err = processor
            .verify_copy(&source, &dest, &report)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Verify(VerifyError::ChecksumMismatch { .. })
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn intact_copy_passes_both_checks() {
        let dir = TempDir::new().unwrap();
        let processor = test_processor(&dir, true).await;

        let source = dir.path().join("staging/report.pdf");
        write_file(&source, b"0123456789").await;
        let dest = dir.path().join("tapes/T1/physics/1_report.pdf");

        let report = processor.copy_to_tape(&source, &dest).await.unwrap();
        processor
            .verify_copy(&source, &dest, &report)
            .await
            .unwrap();
        assert!(dest.exists());
    }
}
