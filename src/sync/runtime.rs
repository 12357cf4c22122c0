use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{status, DequeuedSync};
use crate::sync::logs::JobLogger;
use crate::sync::workers::{self, SyncContext};

/// Keep-alive cadence. Must stay far under the reaper's 10-minute
/// timeout or live workers get reaped mid-flight.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Supervise one dispatched job to completion.
///
/// Terminal bookkeeping follows the queue contract: a successful worker
/// commits `status = DONE` itself, inside the transaction that published
/// its result rows. On failure nothing here touches the status — the row
/// stays RUNNING and the reaper times it out once the keep-alive goes
/// stale.
pub async fn run_sync(
    pool: &PgPool,
    config: &Config,
    job: DequeuedSync,
    shutdown: &CancellationToken,
) {
    tracing::info!(
        queue_id = job.queue_id,
        sync_type = %job.sync_type,
        repo = %job.clone_url,
        "sync started"
    );

    let mut logger = JobLogger::new(pool.clone(), job.queue_id);
    logger
        .info(format!("starting {} for {}", job.sync_type, job.clone_url))
        .await;

    let cancel = shutdown.child_token();
    let keep_alive = spawn_keep_alive(pool.clone(), job.queue_id, cancel.clone());

    let result = match ScratchDir::create(&config.git_clone_path, job.queue_id) {
        Ok(scratch) => {
            let run = match workers::worker_for(&job.sync_type) {
                Some(worker) => {
                    let mut ctx = SyncContext {
                        pool,
                        job: &job,
                        scratch_dir: scratch.path().to_path_buf(),
                        logger: &mut logger,
                        cancel: &cancel,
                        encryption_secret: &config.encryption_secret,
                    };
                    worker.run(&mut ctx).await
                }
                None => Err(anyhow::anyhow!(
                    "no worker registered for sync type {}",
                    job.sync_type
                )),
            };
            drop(scratch);
            run
        }
        Err(e) => Err(anyhow::anyhow!("failed to create scratch directory: {e}")),
    };

    // Stop the heartbeat before terminal logging.
    cancel.cancel();
    let _ = keep_alive.await;

    match result {
        Ok(summary) => {
            tracing::info!(
                queue_id = job.queue_id,
                rows = summary.rows_written,
                skipped = summary.files_skipped,
                "sync finished"
            );
            logger
                .info(format!(
                    "finished {}: {} rows written, {} files skipped",
                    job.sync_type, summary.rows_written, summary.files_skipped
                ))
                .await;
        }
        Err(e) if shutdown.is_cancelled() => {
            // Shutdown raced the job; its transaction rolled back and the
            // reaper will settle the row.
            tracing::warn!(queue_id = job.queue_id, error = %e, "sync cancelled by shutdown");
        }
        Err(e) => {
            tracing::error!(queue_id = job.queue_id, error = %e, "sync failed");
            logger.error(format!("{} failed: {e:#}", job.sync_type)).await;
        }
    }

    logger.flush().await;
}

/// Refresh `last_keep_alive` until the token fires.
fn spawn_keep_alive(pool: PgPool, queue_id: i64, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let updated = sqlx::query(
                        "UPDATE repo_sync_queue SET last_keep_alive = now() WHERE id = $1 AND status = $2",
                    )
                    .bind(queue_id)
                    .bind(status::RUNNING)
                    .execute(&pool)
                    .await;

                    if let Err(e) = updated {
                        tracing::warn!(queue_id, error = %e, "keep-alive update failed");
                    }
                }
            }
        }
    })
}

// ─── Scratch Directories ──────────────────────────────

/// A job-scoped directory under GIT_CLONE_PATH, removed on drop so every
/// exit path (success, failure, cancellation) releases the disk.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(root: &Path, queue_id: i64) -> std::io::Result<Self> {
        let path = root.join(format!("sync-{}-{}", queue_id, Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch dir");
        }
    }
}
