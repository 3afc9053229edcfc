use anyhow::Result;
use std::{fs, sync::Arc};
use tape_archive::config::AppConfig;
use tape_archive::processor::FileProcessor;
use tape_archive::queue::worker::spawn_workers;
use tape_archive::queue::{JobQueue, QueueSettings};
use tape_archive::services::ledger::Ledger;
use tape_archive::services::notify::{
    AdminAlerter, LogAlerter, LogMailer, Mailer, WebhookAlerter, WebhookMailer,
};
use tape_archive::services::tape::{TapeCoordinator, TapeSettings};
use tape_archive::{db, models::tape::TapeStatus};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting tape-archive with config: {:?}", cfg);

    // --- Ensure the tape library root exists ---
    if !cfg.library_dir.exists() {
        fs::create_dir_all(&cfg.library_dir)?;
        tracing::info!("Created tape library directory at {}", cfg.library_dir.display());
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let ledger = Ledger::new(Arc::clone(&db));
    let coordinator = Arc::new(TapeCoordinator::new(
        Arc::clone(&db),
        TapeSettings {
            library_dir: cfg.library_dir.clone(),
            capacity_bytes: cfg.tape_capacity_bytes,
            pool_size: cfg.tape_pool_size,
            mount_timeout: cfg.mount_timeout,
            concurrent_copies: cfg.concurrent_copies,
        },
    ));

    let mailer: Arc<dyn Mailer> = match cfg.mail_webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookMailer::new(url)?),
        None => {
            tracing::warn!("No mail webhook configured; user notices go to the log only");
            Arc::new(LogMailer)
        }
    };
    let alerts: Arc<dyn AdminAlerter> = match cfg.alert_webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookAlerter::new(url)?),
        None => {
            tracing::warn!("No alert webhook configured; admin alerts go to the log only");
            Arc::new(LogAlerter)
        }
    };

    let processor = Arc::new(FileProcessor::new(
        ledger,
        Arc::clone(&coordinator),
        mailer,
        alerts,
        cfg.verify_checksum,
    ));
    let queue = JobQueue::new(
        Arc::clone(&db),
        QueueSettings {
            max_attempts: cfg.max_attempts,
            visibility_timeout: cfg.visibility_timeout,
            retry_base: cfg.retry_base,
            retry_cap: cfg.retry_cap,
        },
    );

    // --- Report tape library state ---
    let tapes = coordinator.list_tapes().await?;
    let active = tapes
        .iter()
        .filter(|t| t.status == TapeStatus::Active)
        .count();
    tracing::info!(
        "Tape library holds {} tape(s), {} active, capacity {} bytes each",
        tapes.len(),
        active,
        cfg.tape_capacity_bytes
    );

    // --- Start workers ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_workers(
        cfg.workers,
        queue,
        processor,
        shutdown_rx,
        cfg.poll_interval,
    );
    tracing::info!("Started {} archival worker(s)", handles.len());

    // --- Wait for shutdown signal ---
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received; draining workers");
    // Workers finish the job in hand before they observe the flag.
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!("Worker task panicked during shutdown: {}", err);
        }
    }
    tracing::info!("All workers stopped.");

    Ok(())
}
