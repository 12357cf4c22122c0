use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Root directory for per-job scratch clones.
    pub git_clone_path: PathBuf,
    /// Key material for decrypting provider credentials. Empty means no
    /// credentials are available and clones run unauthenticated.
    pub encryption_secret: String,
    /// Number of concurrent worker slots in this process.
    pub sync_workers: usize,
    pub scheduler_interval: Duration,
    pub reaper_interval: Duration,
    /// How long the dispatcher idles when the queue has nothing runnable.
    pub dequeue_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;
        let git_clone_path: PathBuf = std::env::var("GIT_CLONE_PATH")
            .map_err(|_| anyhow::anyhow!("GIT_CLONE_PATH not set"))?
            .into();

        Ok(Self {
            database_url,
            git_clone_path,
            encryption_secret: std::env::var("ENCRYPTION_SECRET").unwrap_or_default(),
            sync_workers: env_parse("SYNC_WORKERS", 3)?,
            scheduler_interval: Duration::from_secs(env_parse("SCHEDULER_INTERVAL_SECS", 60)?),
            reaper_interval: Duration::from_secs(env_parse("REAPER_INTERVAL_SECS", 60)?),
            dequeue_interval: Duration::from_secs(env_parse("DEQUEUE_INTERVAL_SECS", 5)?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, anyhow::Error> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a number, got {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}
