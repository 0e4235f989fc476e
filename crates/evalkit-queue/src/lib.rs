//! The durable queue is an external collaborator (§4.7): this crate defines
//! its contract as a capability trait, [`JobQueue`], plus an in-process
//! reference implementation used by tests and by the default composition
//! wiring. Nothing upstream of this crate should depend on the reference
//! implementation directly — only on the trait.

mod memory;
mod types;

pub use memory::InMemoryJobQueue;
pub use types::{
    JobId, JobStatus, QueueStats, QueuedJob, RecentFailure, SendOptions,
};

use async_trait::async_trait;

/// Error surface for queue operations. Kept deliberately small: callers are
/// expected to treat any error here as retryable infrastructure trouble.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("invalid json path filter: {0}")]
    InvalidFilter(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Handler contract: a batch either succeeds as a whole (every job in it is
/// marked done) or fails as a whole (every job in it is retried), though
/// implementations that fail individual jobs inside a batch are acceptable
/// too (§4.7c). This crate's handlers use the latter, finer-grained mode via
/// [`JobQueue::complete`] / [`JobQueue::fail`] called per job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Idempotently ensures a named queue exists.
    async fn create_queue(&self, queue: &str) -> Result<()>;

    /// Enqueues a job, returning a stable job id. If `opts.singleton_key` is
    /// set and a pending or active job with that key already exists on this
    /// queue, no new job is created and the existing job's id is returned.
    async fn send(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> Result<JobId>;

    /// Leases up to `batch_size` jobs whose scheduled time has arrived,
    /// ordered by priority then enqueue time (FIFO). Leased jobs move from
    /// pending to active until completed or failed.
    async fn poll_batch(&self, queue: &str, batch_size: usize) -> Result<Vec<QueuedJob>>;

    /// Marks a leased job done.
    async fn complete(&self, queue: &str, job_id: JobId) -> Result<()>;

    /// Marks a leased job failed. If its retry budget remains, it is
    /// rescheduled after a backoff; otherwise it moves to the terminal
    /// failed set.
    async fn fail(&self, queue: &str, job_id: JobId, error: String) -> Result<()>;

    /// Introspection: pending/active/completed/failed counts for a queue.
    /// This is the single entry point standardized in place of the source's
    /// two divergent query paths (§9 open question).
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Recent terminal failures, optionally filtered by a JSON path into the
    /// payload (e.g. `"runId"` matched against a provided value).
    async fn recent_failures(
        &self,
        queue: &str,
        payload_field: Option<&str>,
        payload_value: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RecentFailure>>;

    /// True if a job matching `payload_field == payload_value` currently
    /// exists pending or active on `queue`. Used by the recovery scheduler
    /// to avoid re-enqueuing work already in flight.
    async fn has_scheduled(
        &self,
        queue: &str,
        payload_field: &str,
        payload_value: &str,
    ) -> Result<bool>;
}
