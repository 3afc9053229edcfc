//! SQLite pool construction and schema migrations.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;

/// Embedded schema migrations, applied in `--migrate` mode and by tests.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open the SQLite pool, creating the database file and its parent
/// directory when missing.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    // Extract the local file path SQLx will use
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if !database_url.contains(":memory:") {
        let db_path = Path::new(db_path);

        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        // Try opening manually before SQLx
        match std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(db_path)
        {
            Ok(_) => tracing::debug!("Database file can be created/opened."),
            Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .with_context(|| format!("connecting to `{}`", database_url))?;

    Ok(pool)
}

/// Apply all pending migrations.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    MIGRATOR.run(db).await.context("running migrations")?;
    Ok(())
}
