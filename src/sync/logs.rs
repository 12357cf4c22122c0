use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::models::LogType;

/// Buffered lines are written out once this many accumulate.
const FLUSH_THRESHOLD: usize = 50;

/// Per-job log sink. Lines are buffered and inserted in multi-row batches.
///
/// Writes are best-effort: they are deliberately outside the worker's
/// result transaction, and a failed flush never fails the job. The final
/// "finished" line lands after that transaction commits.
pub struct JobLogger {
    pool: PgPool,
    queue_id: i64,
    buffer: Vec<(LogType, String, DateTime<Utc>)>,
}

impl JobLogger {
    pub fn new(pool: PgPool, queue_id: i64) -> Self {
        Self {
            pool,
            queue_id,
            buffer: Vec::new(),
        }
    }

    pub async fn info(&mut self, message: impl Into<String>) {
        self.push(LogType::Info, message.into()).await;
    }

    pub async fn warn(&mut self, message: impl Into<String>) {
        self.push(LogType::Warn, message.into()).await;
    }

    pub async fn error(&mut self, message: impl Into<String>) {
        self.push(LogType::Error, message.into()).await;
    }

    async fn push(&mut self, log_type: LogType, message: String) {
        self.buffer.push((log_type, message, Utc::now()));
        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.flush().await;
        }
    }

    /// Insert all buffered lines in one statement.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let queue_id = self.queue_id;
        let rows = std::mem::take(&mut self.buffer);

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO repo_sync_logs (repo_sync_queue_id, log_type, message, created_at) ",
        );
        builder.push_values(rows, |mut b, (log_type, message, created_at)| {
            b.push_bind(queue_id)
                .push_bind(log_type.as_str())
                .push_bind(message)
                .push_bind(created_at);
        });

        if let Err(e) = builder.build().execute(&self.pool).await {
            tracing::warn!(queue_id, error = %e, "failed to flush job logs");
        }
    }
}
