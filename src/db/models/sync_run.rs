//! Row type and state machine for `sync_runs` (spec.md §3, "Sync Run"; §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SyncRunStatus {
    Running,
    Complete,
    Error,
}

impl fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncRunStatus::Running => write!(f, "running"),
            SyncRunStatus::Complete => write!(f, "complete"),
            SyncRunStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub account_id: String,
    pub started_at: DateTime<Utc>,
    pub status: SyncRunStatus,
    pub triggered_by: Option<String>,
    pub max_concurrent: i32,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
