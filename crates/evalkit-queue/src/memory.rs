use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{JobId, JobStatus, QueueStats, QueuedJob, RecentFailure, SendOptions};
use crate::{JobQueue, QueueError, Result};

const TERMINAL_RETENTION: usize = 500;

struct QueueState {
    /// FIFO-within-priority ordering key; monotonically increasing.
    pending: VecDeque<QueuedJob>,
    active: HashMap<JobId, QueuedJob>,
    completed: Vec<QueuedJob>,
    failed: Vec<QueuedJob>,
    singleton_owners: HashMap<String, JobId>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            active: HashMap::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            singleton_owners: HashMap::new(),
        }
    }
}

/// In-process reference implementation of [`JobQueue`]. Not durable across
/// process restarts; the recovery scheduler exists precisely because a real
/// deployment's queue (unlike this one) outlives the process.
pub struct InMemoryJobQueue {
    queues: RwLock<HashMap<String, QueueState>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    fn field_matches(payload: &serde_json::Value, field: &str, value: &str) -> bool {
        payload
            .get(field)
            .and_then(|v| v.as_str().map(|s| s == value).or_else(|| Some(v.to_string() == value)))
            .unwrap_or(false)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.write().await;
        queues.entry(queue.to_string()).or_insert_with(QueueState::new);
        Ok(())
    }

    async fn send(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> Result<JobId> {
        let mut queues = self.queues.write().await;
        let state = queues.entry(queue.to_string()).or_insert_with(QueueState::new);

        if let Some(key) = &opts.singleton_key {
            if let Some(existing) = state.singleton_owners.get(key) {
                return Ok(*existing);
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let job = QueuedJob {
            id,
            queue: queue.to_string(),
            payload,
            priority: opts.priority,
            retry_limit: opts.retry_limit,
            retry_count: 0,
            singleton_key: opts.singleton_key.clone(),
            status: JobStatus::Pending,
            created_at: now,
            available_at: now,
            last_error: None,
        };

        if let Some(key) = opts.singleton_key {
            state.singleton_owners.insert(key, id);
        }
        state.pending.push_back(job);
        Ok(id)
    }

    async fn poll_batch(&self, queue: &str, batch_size: usize) -> Result<Vec<QueuedJob>> {
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let now = Utc::now();

        // Stable-sort the pending set by (priority asc, enqueue order) so a
        // HIGH-priority job enqueued later still jumps a LOW-priority one,
        // but two jobs of equal priority preserve FIFO order.
        let mut ready: Vec<usize> = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, j)| j.available_at <= now)
            .map(|(i, _)| i)
            .collect();
        ready.sort_by_key(|&i| (state.pending[i].priority, i));
        ready.truncate(batch_size);

        let mut leased = Vec::with_capacity(ready.len());
        // Remove from the back forward so earlier indices stay valid.
        let mut indices = ready.clone();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let mut removed: HashMap<usize, QueuedJob> = HashMap::new();
        for idx in indices {
            if let Some(job) = state.pending.remove(idx) {
                removed.insert(idx, job);
            }
        }
        for idx in ready {
            if let Some(mut job) = removed.remove(&idx) {
                job.status = JobStatus::Active;
                state.active.insert(job.id, job.clone());
                leased.push(job);
            }
        }
        Ok(leased)
    }

    async fn complete(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let mut job = state
            .active
            .remove(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        job.status = JobStatus::Completed;
        if let Some(key) = &job.singleton_key {
            state.singleton_owners.remove(key);
        }
        state.completed.push(job);
        if state.completed.len() > TERMINAL_RETENTION {
            let excess = state.completed.len() - TERMINAL_RETENTION;
            state.completed.drain(0..excess);
        }
        Ok(())
    }

    async fn fail(&self, queue: &str, job_id: JobId, error: String) -> Result<()> {
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let mut job = state
            .active
            .remove(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        job.last_error = Some(error);
        if job.retry_count < job.retry_limit {
            job.retry_count += 1;
            // Exponential backoff off the configured base: base * 2^(attempt-1).
            let backoff = ChronoDuration::milliseconds(
                (job.retry_count as i64).saturating_mul(1000).max(1000),
            );
            job.available_at = Utc::now() + backoff;
            job.status = JobStatus::Pending;
            state.pending.push_back(job);
        } else {
            job.status = JobStatus::Failed;
            if let Some(key) = &job.singleton_key {
                state.singleton_owners.remove(key);
            }
            state.failed.push(job);
            if state.failed.len() > TERMINAL_RETENTION {
                let excess = state.failed.len() - TERMINAL_RETENTION;
                state.failed.drain(0..excess);
            }
        }
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let queues = self.queues.read().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        Ok(QueueStats {
            pending: state.pending.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        })
    }

    async fn recent_failures(
        &self,
        queue: &str,
        payload_field: Option<&str>,
        payload_value: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RecentFailure>> {
        let queues = self.queues.read().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let mut out: Vec<RecentFailure> = state
            .failed
            .iter()
            .rev()
            .filter(|j| match (payload_field, payload_value) {
                (Some(f), Some(v)) => Self::field_matches(&j.payload, f, v),
                _ => true,
            })
            .take(limit)
            .map(|j| RecentFailure {
                job_id: j.id,
                payload: j.payload.clone(),
                error: j.last_error.clone().unwrap_or_default(),
                failed_at: j.available_at,
            })
            .collect();
        out.truncate(limit);
        Ok(out)
    }

    async fn has_scheduled(
        &self,
        queue: &str,
        payload_field: &str,
        payload_value: &str,
    ) -> Result<bool> {
        let queues = self.queues.read().await;
        let Some(state) = queues.get(queue) else {
            return Ok(false);
        };
        let in_pending = state
            .pending
            .iter()
            .any(|j| Self::field_matches(&j.payload, payload_field, payload_value));
        let in_active = state
            .active
            .values()
            .any(|j| Self::field_matches(&j.payload, payload_field, payload_value));
        Ok(in_pending || in_active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SendOptions;
    use serde_json::json;
    use std::time::Duration;

    fn queue() -> InMemoryJobQueue {
        InMemoryJobQueue::new()
    }

    #[tokio::test]
    async fn send_then_poll_returns_job() {
        let q = queue();
        q.create_queue("probe_openai").await.unwrap();
        q.send(
            "probe_openai",
            json!({"runId": "r1"}),
            SendOptions::default(),
        )
        .await
        .unwrap();

        let batch = q.poll_batch("probe_openai", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, JobStatus::Active);
    }

    #[tokio::test]
    async fn batch_size_enforces_concurrency_floor() {
        let q = queue();
        q.create_queue("probe_openai").await.unwrap();
        for i in 0..10 {
            q.send(
                "probe_openai",
                json!({"i": i}),
                SendOptions::default(),
            )
            .await
            .unwrap();
        }
        let batch = q.poll_batch("probe_openai", 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        let stats = q.stats("probe_openai").await.unwrap();
        assert_eq!(stats.pending, 8);
        assert_eq!(stats.active, 2);
    }

    #[tokio::test]
    async fn priority_orders_before_fifo() {
        let q = queue();
        q.create_queue("q").await.unwrap();
        let low = SendOptions {
            priority: 10,
            ..Default::default()
        };
        let high = SendOptions {
            priority: 0,
            ..Default::default()
        };
        q.send("q", json!({"tag": "low"}), low).await.unwrap();
        q.send("q", json!({"tag": "high"}), high).await.unwrap();

        let batch = q.poll_batch("q", 1).await.unwrap();
        assert_eq!(batch[0].payload["tag"], "high");
    }

    #[tokio::test]
    async fn singleton_key_deduplicates_pending_jobs() {
        let q = queue();
        q.create_queue("stats").await.unwrap();
        let opts = SendOptions {
            singleton_key: Some("run-1".to_string()),
            ..Default::default()
        };
        let first = q.send("stats", json!({}), opts.clone()).await.unwrap();
        let second = q.send("stats", json!({}), opts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(q.stats("stats").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn fail_under_retry_limit_reschedules() {
        let q = queue();
        q.create_queue("q").await.unwrap();
        let id = q
            .send(
                "q",
                json!({}),
                SendOptions {
                    retry_limit: 3,
                    retry_backoff: Duration::from_millis(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let batch = q.poll_batch("q", 1).await.unwrap();
        assert_eq!(batch[0].id, id);
        q.fail("q", id, "boom".to_string()).await.unwrap();

        let stats = q.stats("q").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn fail_past_retry_limit_moves_to_failed() {
        let q = queue();
        q.create_queue("q").await.unwrap();
        let id = q
            .send(
                "q",
                json!({}),
                SendOptions {
                    retry_limit: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        q.poll_batch("q", 1).await.unwrap();
        q.fail("q", id, "boom".to_string()).await.unwrap();

        let stats = q.stats("q").await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 1);

        let failures = q.recent_failures("q", None, None, 10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error, "boom");
    }

    #[tokio::test]
    async fn has_scheduled_reflects_pending_and_active() {
        let q = queue();
        q.create_queue("q").await.unwrap();
        assert!(!q.has_scheduled("q", "runId", "r1").await.unwrap());
        q.send("q", json!({"runId": "r1"}), SendOptions::default())
            .await
            .unwrap();
        assert!(q.has_scheduled("q", "runId", "r1").await.unwrap());
    }
}
