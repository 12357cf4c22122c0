use sqlx::FromRow;
use uuid::Uuid;

// ─── Queue Status ─────────────────────────────────────

/// Queue row lifecycle. Transitions only move forward:
/// QUEUED -> RUNNING -> DONE.
pub mod status {
    pub const QUEUED: &str = "QUEUED";
    pub const RUNNING: &str = "RUNNING";
    pub const DONE: &str = "DONE";
}

// ─── Sync Types ───────────────────────────────────────

pub const SYNC_TYPE_GIT_BLAME: &str = "GIT_BLAME";

pub const CREDENTIAL_TYPE_GITHUB_PAT: &str = "GITHUB_PAT";

// ─── Log Lines ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Info,
    Warn,
    Error,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Info => "INFO",
            LogType::Warn => "WARN",
            LogType::Error => "ERROR",
        }
    }
}

// ─── Dequeued Sync ────────────────────────────────────

/// A queue row claimed by the dispatcher, enriched with the repo and
/// sync binding it belongs to. This is what a worker slot receives.
#[derive(Debug, Clone, FromRow)]
pub struct DequeuedSync {
    pub queue_id: i64,
    pub repo_sync_id: Uuid,
    pub sync_type: String,
    pub repo_id: Uuid,
    pub clone_url: String,
    pub git_ref: Option<String>,
}
