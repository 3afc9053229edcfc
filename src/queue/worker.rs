//! Worker tasks: claim a delivery, run it through the processor, settle it.

use crate::processor::{FileProcessor, JobOutcome};
use crate::queue::{Delivery, JobQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Spawn `count` worker tasks pulling from the queue.
///
/// Each worker loops claim -> process -> ack/nack, sleeping one poll
/// interval when the queue is empty. The shutdown channel stops idle
/// workers promptly; a job already in flight finishes first, so a copy is
/// never cancelled midway.
pub fn spawn_workers(
    count: usize,
    queue: JobQueue,
    processor: Arc<FileProcessor>,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let worker = Worker {
                worker_id,
                queue: queue.clone(),
                processor: Arc::clone(&processor),
                shutdown: shutdown.clone(),
                poll_interval,
            };
            tokio::spawn(worker.run())
        })
        .collect()
}

struct Worker {
    worker_id: usize,
    queue: JobQueue,
    processor: Arc<FileProcessor>,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = self.worker_id, "archival worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.queue.claim_next().await {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => {
                    if self.idle().await {
                        break;
                    }
                }
                Err(err) => {
                    error!(
                        worker_id = self.worker_id,
                        error = %err,
                        "failed to claim next job"
                    );
                    if self.idle().await {
                        break;
                    }
                }
            }
        }
        info!(worker_id = self.worker_id, "archival worker stopped");
    }

    /// Wait one poll interval; returns true when shutdown was signalled.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => true,
            _ = sleep(self.poll_interval) => false,
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let file_id = delivery.job.file_id;
        info!(
            worker_id = self.worker_id,
            file_id,
            attempt = delivery.attempt,
            max_attempts = delivery.max_attempts,
            "processing delivery"
        );

        match self.processor.process(&delivery.job).await {
            Ok(JobOutcome::Archived { tape_number, .. }) => {
                info!(worker_id = self.worker_id, file_id, tape = %tape_number, "archived to tape");
                self.settle_ack(&delivery).await;
            }
            Ok(JobOutcome::AlreadyArchived) => {
                info!(
                    worker_id = self.worker_id,
                    file_id, "already archived, redelivery short-circuited"
                );
                self.settle_ack(&delivery).await;
            }
            Err(err) => {
                warn!(
                    worker_id = self.worker_id,
                    file_id,
                    attempt = delivery.attempt,
                    error = %err,
                    "delivery failed"
                );
                match self.queue.nack(&delivery, &err.to_string()).await {
                    Ok(_) => {}
                    Err(queue_err) => {
                        error!(file_id, error = %queue_err, "failed to settle delivery as failed");
                    }
                }
            }
        }
    }

    async fn settle_ack(&self, delivery: &Delivery) {
        match self.queue.ack(delivery).await {
            Ok(_) => {}
            Err(err) => {
                error!(
                    file_id = delivery.job.file_id,
                    error = %err,
                    "failed to acknowledge delivery"
                );
            }
        }
    }
}
