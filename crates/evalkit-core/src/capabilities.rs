//! Narrow capability traits that break the cyclic dependencies the design
//! notes (§9) flag: handlers never import the Run Controller or the queue
//! helper directly, only these.

use async_trait::async_trait;
use evalkit_queue::{QueueStats, RecentFailure};
use evalkit_types::{RunId, TranscriptId};

/// One-way dependency resolving the summarize-handler/queue-helper cycle
/// (§9): the Run Controller owns enqueue; handlers only ever call through
/// this.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue_probe(
        &self,
        run_id: RunId,
        scenario_id: evalkit_types::ScenarioId,
        model_id: &str,
        priority: i32,
    ) -> anyhow::Result<()>;

    async fn enqueue_summarize(&self, run_id: RunId, transcript_id: TranscriptId) -> anyhow::Result<()>;

    /// Best-effort: callers swallow errors from this one (§4.5, §7).
    async fn enqueue_token_stats(&self, run_id: RunId) -> anyhow::Result<()>;

    /// Best-effort, same as above.
    async fn enqueue_analyze_basic(
        &self,
        run_id: RunId,
        transcript_ids: Vec<TranscriptId>,
    ) -> anyhow::Result<()>;
}

/// The "late-arriving probe triggers a summarize enqueue" path (§9) modeled
/// as message-passing rather than an ad-hoc cross-module call from inside
/// the probe handler.
#[async_trait]
pub trait PhaseTransitionObserver: Send + Sync {
    /// Fired once, the moment a Run's probe phase exhausts and it moves
    /// RUNNING -> SUMMARIZING: enqueues a summarize job for every transcript
    /// already on hand and freezes `summarize.total`.
    async fn on_summarizing_phase_started(&self, run_id: RunId) -> anyhow::Result<()>;

    /// Fired when a probe's success is persisted for a Run that is *already*
    /// SUMMARIZING: the rest of the batch raced ahead of this one.
    async fn on_late_probe_arrival(&self, run_id: RunId, transcript_id: TranscriptId) -> anyhow::Result<()>;
}

/// Unifies the two divergent query paths the source kept separate (§9
/// resolved): one capability for pending/active/completed/failed counts and
/// filtered recent failures, regardless of which queue backend answers it.
#[async_trait]
pub trait JobIntrospection: Send + Sync {
    async fn queue_stats(&self, queue: &str) -> anyhow::Result<QueueStats>;

    async fn recent_failures(
        &self,
        queue: &str,
        payload_field: Option<&str>,
        payload_value: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<RecentFailure>>;
}

/// Blanket impl: any [`evalkit_queue::JobQueue`] already satisfies
/// [`JobIntrospection`] directly, so callers depending on the narrower
/// capability can be handed the same object without an adapter.
#[async_trait]
impl<T: evalkit_queue::JobQueue + ?Sized> JobIntrospection for T {
    async fn queue_stats(&self, queue: &str) -> anyhow::Result<QueueStats> {
        Ok(self.stats(queue).await?)
    }

    async fn recent_failures(
        &self,
        queue: &str,
        payload_field: Option<&str>,
        payload_value: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<RecentFailure>> {
        Ok(
            evalkit_queue::JobQueue::recent_failures(self, queue, payload_field, payload_value, limit)
                .await?,
        )
    }
}
