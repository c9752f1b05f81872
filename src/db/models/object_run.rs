//! Row type and state machine for `object_runs` (spec.md §3, "Object Run"; §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ObjectRunStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl fmt::Display for ObjectRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRunStatus::Pending => write!(f, "pending"),
            ObjectRunStatus::Running => write!(f, "running"),
            ObjectRunStatus::Complete => write!(f, "complete"),
            ObjectRunStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ObjectRun {
    pub id: i64,
    pub sync_run_id: i64,
    pub account_id: String,
    pub object: String,
    pub status: ObjectRunStatus,
    pub processed_count: i64,
    pub cursor: Option<i64>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}
