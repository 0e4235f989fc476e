use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

/// Options accompanying a [`crate::JobQueue::send`] call.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub priority: i32,
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub singleton_key: Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            retry_limit: 3,
            retry_backoff: Duration::from_secs(5),
            singleton_key: None,
        }
    }
}

/// A job as returned by a poll or an introspection query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub retry_limit: u32,
    pub retry_count: u32,
    pub singleton_key: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentFailure {
    pub job_id: JobId,
    pub payload: serde_json::Value,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
