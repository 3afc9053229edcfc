use anyhow::{Context, Result, ensure};
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub library_dir: PathBuf,
    pub workers: usize,
    pub tape_capacity_bytes: i64,
    pub tape_pool_size: i64,
    pub concurrent_copies: usize,
    pub mount_timeout: Duration,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub max_attempts: i64,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub verify_checksum: bool,
    pub mail_webhook_url: Option<String>,
    pub alert_webhook_url: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Tape archival worker")]
pub struct Args {
    /// Database URL (overrides TAPE_ARCHIVE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Root directory of the tape library (overrides TAPE_ARCHIVE_LIBRARY_DIR)
    #[arg(long)]
    pub library_dir: Option<String>,

    /// Number of worker tasks (overrides TAPE_ARCHIVE_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Capacity threshold per tape, in bytes (overrides TAPE_ARCHIVE_TAPE_CAPACITY_BYTES)
    #[arg(long)]
    pub tape_capacity_bytes: Option<i64>,

    /// Maximum number of tapes in the library (overrides TAPE_ARCHIVE_TAPE_POOL_SIZE)
    #[arg(long)]
    pub tape_pool_size: Option<i64>,

    /// Concurrent copies allowed on a mounted tape (overrides TAPE_ARCHIVE_CONCURRENT_COPIES)
    #[arg(long)]
    pub concurrent_copies: Option<usize>,

    /// Bound on waiting for the drive, in seconds (overrides TAPE_ARCHIVE_MOUNT_TIMEOUT_SECS)
    #[arg(long)]
    pub mount_timeout_secs: Option<u64>,

    /// Redelivery window for claimed jobs, in seconds (overrides TAPE_ARCHIVE_VISIBILITY_TIMEOUT_SECS)
    #[arg(long)]
    pub visibility_timeout_secs: Option<u64>,

    /// Idle queue poll interval, in milliseconds (overrides TAPE_ARCHIVE_POLL_INTERVAL_MS)
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Delivery attempts before a job is parked (overrides TAPE_ARCHIVE_MAX_ATTEMPTS)
    #[arg(long)]
    pub max_attempts: Option<i64>,

    /// Base retry backoff, in milliseconds (overrides TAPE_ARCHIVE_RETRY_BASE_MS)
    #[arg(long)]
    pub retry_base_ms: Option<u64>,

    /// Retry backoff ceiling, in milliseconds (overrides TAPE_ARCHIVE_RETRY_CAP_MS)
    #[arg(long)]
    pub retry_cap_ms: Option<u64>,

    /// Re-read tape copies and compare checksums (overrides TAPE_ARCHIVE_VERIFY_CHECKSUM)
    #[arg(long)]
    pub verify_checksum: bool,

    /// Mail relay endpoint (overrides TAPE_ARCHIVE_MAIL_WEBHOOK_URL)
    #[arg(long)]
    pub mail_webhook_url: Option<String>,

    /// Admin alert endpoint (overrides TAPE_ARCHIVE_ALERT_WEBHOOK_URL)
    #[arg(long)]
    pub alert_webhook_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read an env var and parse it, falling back to `default` when unset.
fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::merge(Args::parse())
    }

    fn merge(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_db = env::var("TAPE_ARCHIVE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/tape_archive.db".into());
        let env_library =
            env::var("TAPE_ARCHIVE_LIBRARY_DIR").unwrap_or_else(|_| "./data/tapes".into());
        let env_workers = env_parsed("TAPE_ARCHIVE_WORKERS", 4usize)?;
        let env_capacity = env_parsed("TAPE_ARCHIVE_TAPE_CAPACITY_BYTES", 2_000_000_000_000i64)?;
        let env_pool = env_parsed("TAPE_ARCHIVE_TAPE_POOL_SIZE", 24i64)?;
        let env_copies = env_parsed("TAPE_ARCHIVE_CONCURRENT_COPIES", 1usize)?;
        let env_mount_timeout = env_parsed("TAPE_ARCHIVE_MOUNT_TIMEOUT_SECS", 30u64)?;
        let env_visibility = env_parsed("TAPE_ARCHIVE_VISIBILITY_TIMEOUT_SECS", 600u64)?;
        let env_poll = env_parsed("TAPE_ARCHIVE_POLL_INTERVAL_MS", 500u64)?;
        let env_attempts = env_parsed("TAPE_ARCHIVE_MAX_ATTEMPTS", 5i64)?;
        let env_retry_base = env_parsed("TAPE_ARCHIVE_RETRY_BASE_MS", 1_000u64)?;
        let env_retry_cap = env_parsed("TAPE_ARCHIVE_RETRY_CAP_MS", 60_000u64)?;
        let env_verify = env_parsed("TAPE_ARCHIVE_VERIFY_CHECKSUM", false)?;
        let env_mail = env_optional("TAPE_ARCHIVE_MAIL_WEBHOOK_URL");
        let env_alert = env_optional("TAPE_ARCHIVE_ALERT_WEBHOOK_URL");

        // --- Merge ---
        let cfg = Self {
            database_url: args.database_url.unwrap_or(env_db),
            library_dir: PathBuf::from(args.library_dir.unwrap_or(env_library)),
            workers: args.workers.unwrap_or(env_workers),
            tape_capacity_bytes: args.tape_capacity_bytes.unwrap_or(env_capacity),
            tape_pool_size: args.tape_pool_size.unwrap_or(env_pool),
            concurrent_copies: args.concurrent_copies.unwrap_or(env_copies),
            mount_timeout: Duration::from_secs(args.mount_timeout_secs.unwrap_or(env_mount_timeout)),
            visibility_timeout: Duration::from_secs(
                args.visibility_timeout_secs.unwrap_or(env_visibility),
            ),
            poll_interval: Duration::from_millis(args.poll_interval_ms.unwrap_or(env_poll)),
            max_attempts: args.max_attempts.unwrap_or(env_attempts),
            retry_base: Duration::from_millis(args.retry_base_ms.unwrap_or(env_retry_base)),
            retry_cap: Duration::from_millis(args.retry_cap_ms.unwrap_or(env_retry_cap)),
            verify_checksum: args.verify_checksum || env_verify,
            mail_webhook_url: args.mail_webhook_url.or(env_mail),
            alert_webhook_url: args.alert_webhook_url.or(env_alert),
        };

        ensure!(cfg.workers >= 1, "TAPE_ARCHIVE_WORKERS must be at least 1");
        ensure!(
            cfg.concurrent_copies >= 1,
            "TAPE_ARCHIVE_CONCURRENT_COPIES must be at least 1"
        );
        ensure!(
            cfg.tape_pool_size >= 1,
            "TAPE_ARCHIVE_TAPE_POOL_SIZE must be at least 1"
        );
        ensure!(
            cfg.max_attempts >= 1,
            "TAPE_ARCHIVE_MAX_ATTEMPTS must be at least 1"
        );

        Ok((cfg, args.migrate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Config tests mutate process-wide environment state, so they are
    // serialized behind one mutex.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn clear_env() {
        let names: Vec<String> = env::vars()
            .map(|(name, _)| name)
            .filter(|name| name.starts_with("TAPE_ARCHIVE_"))
            .collect();
        for name in names {
            // SAFETY: guarded by ENV_MUTEX; no other thread reads or writes
            // the environment while a config test holds the lock.
            unsafe { env::remove_var(&name) };
        }
    }

    fn parse(argv: &[&str]) -> Result<(AppConfig, bool)> {
        AppConfig::merge(Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let (cfg, migrate) = parse(&["tape-archive"]).unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.concurrent_copies, 1);
        assert_eq!(cfg.tape_pool_size, 24);
        assert_eq!(cfg.mount_timeout, Duration::from_secs(30));
        assert_eq!(cfg.retry_cap, Duration::from_millis(60_000));
        assert_eq!(cfg.library_dir, PathBuf::from("./data/tapes"));
        assert!(!cfg.verify_checksum);
        assert!(cfg.mail_webhook_url.is_none());
        assert!(!migrate);
    }

    #[test]
    fn flags_override_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        // SAFETY: guarded by ENV_MUTEX, see above.
        unsafe {
            env::set_var("TAPE_ARCHIVE_WORKERS", "8");
            env::set_var("TAPE_ARCHIVE_RETRY_BASE_MS", "250");
        }

        let (cfg, _) = parse(&["tape-archive", "--workers", "2", "--migrate"]).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.retry_base, Duration::from_millis(250));

        clear_env();
    }

    #[test]
    fn invalid_numeric_env_is_rejected() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        // SAFETY: guarded by ENV_MUTEX, see above.
        unsafe {
            env::set_var("TAPE_ARCHIVE_TAPE_POOL_SIZE", "many");
        }

        let err = parse(&["tape-archive"]).unwrap_err();
        assert!(err.to_string().contains("TAPE_ARCHIVE_TAPE_POOL_SIZE"));

        clear_env();
    }

    #[test]
    fn zero_workers_is_rejected() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let err = parse(&["tape-archive", "--workers", "0"]).unwrap_err();
        assert!(err.to_string().contains("TAPE_ARCHIVE_WORKERS"));
    }
}
