pub mod blame;

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::models::{DequeuedSync, SYNC_TYPE_GIT_BLAME};
use crate::sync::logs::JobLogger;

/// Everything a sync worker gets to work with: the claimed job, a
/// private scratch directory, the job's log sink, and the cancellation
/// signal every blocking call must respect.
pub struct SyncContext<'a> {
    pub pool: &'a PgPool,
    pub job: &'a DequeuedSync,
    pub scratch_dir: PathBuf,
    pub logger: &'a mut JobLogger,
    pub cancel: &'a CancellationToken,
    pub encryption_secret: &'a str,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncSummary {
    pub rows_written: u64,
    pub files_skipped: u64,
}

/// Contract shared by every sync type.
///
/// A worker that succeeds must have committed its result rows and the
/// queue row's DONE transition in one transaction before returning. A
/// worker that fails returns Err with everything rolled back; the
/// runtime never writes a terminal status on its behalf.
#[async_trait]
pub trait SyncWorker: Send + Sync {
    async fn run(&self, ctx: &mut SyncContext<'_>) -> Result<SyncSummary, anyhow::Error>;
}

/// Resolve the worker for a sync type.
pub fn worker_for(sync_type: &str) -> Option<Box<dyn SyncWorker>> {
    match sync_type {
        SYNC_TYPE_GIT_BLAME => Some(Box::new(blame::BlameSync)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blame_worker_is_registered() {
        assert!(worker_for("GIT_BLAME").is_some());
        assert!(worker_for("GIT_COMMIT_STATS").is_none());
    }
}
