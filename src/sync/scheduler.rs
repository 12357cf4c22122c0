use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::models::status;

/// Tick loop: enqueue every due sync, log, repeat. A failed tick rolls
/// back entirely and the next tick retries from scratch.
pub async fn run(pool: PgPool, interval: Duration, shutdown: CancellationToken) {
    tracing::info!("sync scheduler started");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match enqueue_due_syncs(&pool).await {
            Ok(ids) if !ids.is_empty() => {
                tracing::info!(count = ids.len(), "enqueued due syncs");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
        }
    }

    tracing::info!("sync scheduler stopped");
}

/// Insert a QUEUED row for every sync that is due.
///
/// Due means: schedule-enabled, no live (QUEUED or RUNNING) row of its
/// own, and a fully drained type group — while any row of the group has
/// `done_at IS NULL`, the whole group waits. A group therefore finishes
/// its current generation before the next one is admitted, which bounds
/// queue depth and keeps one slow repo from starving its peers.
///
/// One statement, one transaction. Insert order is (priority, sync_type
/// DESC) so generation contents are deterministic.
pub async fn enqueue_due_syncs(pool: &PgPool) -> Result<Vec<i64>, anyhow::Error> {
    let ids: Vec<(i64,)> = sqlx::query_as(
        r#"INSERT INTO repo_sync_queue (repo_sync_id, priority, type_group, status)
           SELECT rs.id, rs.priority, t.type_group, $1
           FROM repo_syncs rs
           JOIN repo_sync_types t ON t.type = rs.sync_type
           WHERE rs.schedule_enabled
             AND NOT EXISTS (
                 SELECT 1 FROM repo_sync_queue q
                 WHERE q.repo_sync_id = rs.id AND q.status IN ($2, $3))
             AND NOT EXISTS (
                 SELECT 1 FROM repo_sync_queue g
                 WHERE g.type_group = t.type_group AND g.done_at IS NULL)
           ORDER BY rs.priority ASC, rs.sync_type DESC
           RETURNING id"#,
    )
    .bind(status::QUEUED)
    .bind(status::QUEUED)
    .bind(status::RUNNING)
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().map(|(id,)| id).collect())
}
