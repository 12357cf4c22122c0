use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::models::{status, LogType};

/// How long a RUNNING row may go without a keep-alive before it is
/// declared dead. Contractual: workers heartbeat well under this.
const SYNC_TIMEOUT_MINUTES: i64 = 10;

pub const TIMEOUT_MESSAGE: &str =
    "No response from job within reasonable interval. Timing out.";

/// Tick loop around [`reap_timed_out_syncs`].
pub async fn run(pool: PgPool, interval: Duration, shutdown: CancellationToken) {
    tracing::info!("sync reaper started");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match reap_timed_out_syncs(&pool).await {
            Ok(ids) if !ids.is_empty() => {
                tracing::warn!(count = ids.len(), queue_ids = ?ids, "reaped timed-out syncs");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "reaper tick failed"),
        }
    }

    tracing::info!("sync reaper stopped");
}

/// Move every RUNNING row whose keep-alive (or, before the first beat,
/// its start time) is stale past the timeout to DONE, appending the
/// timeout ERROR log. Returns the reaped queue ids.
pub async fn reap_timed_out_syncs(pool: &PgPool) -> Result<Vec<i64>, anyhow::Error> {
    let mut tx = pool.begin().await?;

    let reaped: Vec<(i64,)> = sqlx::query_as(
        r#"UPDATE repo_sync_queue
           SET status = $1, done_at = now()
           WHERE status = $2
             AND coalesce(last_keep_alive, started_at) < now() - make_interval(mins => $3)
           RETURNING id"#,
    )
    .bind(status::DONE)
    .bind(status::RUNNING)
    .bind(SYNC_TIMEOUT_MINUTES as i32)
    .fetch_all(&mut *tx)
    .await?;

    for (id,) in &reaped {
        sqlx::query(
            "INSERT INTO repo_sync_logs (repo_sync_queue_id, log_type, message) VALUES ($1, $2, $3)",
        )
        .bind(id)
        .bind(LogType::Error.as_str())
        .bind(TIMEOUT_MESSAGE)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(reaped.into_iter().map(|(id,)| id).collect())
}
