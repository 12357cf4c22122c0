use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::{status, DequeuedSync};
use crate::sync::runtime;

/// Slot loop: claim one runnable queue row at a time and hand each to a
/// worker slot. Slots are a semaphore of `SYNC_WORKERS` permits; a permit
/// rides its job's task and frees the slot when the job settles. When the
/// queue has nothing runnable the loop idles for `DEQUEUE_INTERVAL`.
pub async fn run(pool: PgPool, config: Config, shutdown: CancellationToken) {
    tracing::info!(slots = config.sync_workers, "sync dispatcher started");

    let slots = Arc::new(Semaphore::new(config.sync_workers));
    loop {
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        };

        match dequeue_next_sync(&pool).await {
            Ok(Some(job)) => {
                let pool = pool.clone();
                let config = config.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    runtime::run_sync(&pool, &config, job, &shutdown).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.dequeue_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "dequeue failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.dequeue_interval) => {}
                }
            }
        }
    }

    // Wait for in-flight jobs to settle before returning.
    let _ = slots.acquire_many(config.sync_workers as u32).await;
    tracing::info!("sync dispatcher stopped");
}

/// Claim the next runnable queue row, or None when nothing is eligible.
///
/// One statement: the `running` CTE counts live jobs per type group, the
/// `dequeued` CTE flips the winning QUEUED row to RUNNING. The inner
/// select orders by (priority, created_at, id) and takes the admission
/// check — group ceiling not yet reached — inside the same statement
/// that mutates, so concurrent dispatchers cannot over-admit. SKIP
/// LOCKED lets them claim distinct rows without serializing on each
/// other.
pub async fn dequeue_next_sync(pool: &PgPool) -> Result<Option<DequeuedSync>, anyhow::Error> {
    let job = sqlx::query_as::<_, DequeuedSync>(
        r#"WITH running AS (
               SELECT type_group, count(*) AS running_count
               FROM repo_sync_queue
               WHERE status = $1
               GROUP BY type_group
           ), dequeued AS (
               UPDATE repo_sync_queue
               SET status = $1, started_at = now()
               WHERE id = (
                   SELECT q.id
                   FROM repo_sync_queue q
                   JOIN repo_sync_type_groups g ON g."group" = q.type_group
                   LEFT JOIN running r ON r.type_group = q.type_group
                   WHERE q.status = $2
                     AND g.concurrent_syncs > coalesce(r.running_count, 0)
                   ORDER BY q.priority ASC, q.created_at ASC, q.id ASC
                   LIMIT 1
                   FOR UPDATE OF q SKIP LOCKED
               )
               RETURNING id, repo_sync_id
           )
           SELECT d.id AS queue_id, rs.id AS repo_sync_id, rs.sync_type,
                  r.id AS repo_id, r.repo AS clone_url, r.ref AS git_ref
           FROM dequeued d
           JOIN repo_syncs rs ON rs.id = d.repo_sync_id
           JOIN repos r ON r.id = rs.repo_id"#,
    )
    .bind(status::RUNNING)
    .bind(status::QUEUED)
    .fetch_optional(pool)
    .await?;

    Ok(job)
}
