//! Background loops (§5): one worker per provider-scoped probe queue, one
//! summarize worker, the recovery scheduler, and a periodic store flush.
//! Mirrors this codebase's usual composition-root shape of a handful of
//! `tokio::spawn`ed loops started alongside the HTTP listener.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use evalkit_core::{EvalError, ProbeHandler, RunController, SummarizeHandler, Storage};
use evalkit_providers::{queue_name_for, ProviderTableSource, DEFAULT_QUEUE};
use evalkit_queue::{JobQueue, QueuedJob};
use evalkit_ratelimit::{ProviderLimiterConfig, RateLimiterRegistry};
use futures::future::join_all;
use tokio::sync::RwLock;

const POLL_IDLE_SLEEP: Duration = Duration::from_millis(500);

/// Runs every job in `batch` concurrently, letting the rate limiter (not
/// this loop) bound how many producer calls are actually in flight at once
/// — §4.4/§5 require the batch to run concurrently so
/// `batchSize = provider.maxParallelRequests` actually exercises the
/// limiter's concurrency semaphore. Mirrors the fan-out-then-`join_all`
/// shape this codebase uses for concurrent per-model calls.
async fn run_batch<F, Fut>(queue: &Arc<dyn JobQueue>, queue_name: &str, batch: Vec<QueuedJob>, handle: F)
where
    F: Fn(QueuedJob) -> Fut,
    Fut: std::future::Future<Output = Result<(), EvalError>>,
{
    let outcomes = join_all(batch.into_iter().map(|job| {
        let handle = &handle;
        async move {
            let job_id = job.id;
            let result = handle(job).await;
            (job_id, result)
        }
    }))
    .await;

    for (job_id, result) in outcomes {
        let outcome = match result {
            Ok(()) => queue.complete(queue_name, job_id).await,
            Err(err) => queue.fail(queue_name, job_id, err.to_string()).await,
        };
        if let Err(err) = outcome {
            tracing::error!(queue = queue_name, job_id = %job_id, error = %err, "failed to record job outcome");
        }
    }
}

async fn probe_worker_loop(
    queue: Arc<dyn JobQueue>,
    handler: Arc<ProbeHandler>,
    queue_name: String,
    batch_size: usize,
) {
    if let Err(err) = queue.create_queue(&queue_name).await {
        tracing::error!(queue = %queue_name, error = %err, "could not create probe queue");
        return;
    }
    loop {
        match queue.poll_batch(&queue_name, batch_size.max(1)).await {
            Ok(batch) if batch.is_empty() => tokio::time::sleep(POLL_IDLE_SLEEP).await,
            Ok(batch) => run_batch(&queue, &queue_name, batch, |job| async { handler.handle(&job).await }).await,
            Err(err) => {
                tracing::error!(queue = %queue_name, error = %err, "probe queue poll failed");
                tokio::time::sleep(POLL_IDLE_SLEEP).await;
            }
        }
    }
}

async fn summarize_worker_loop(queue: Arc<dyn JobQueue>, handler: Arc<SummarizeHandler>, batch_size: usize) {
    const QUEUE_NAME: &str = "summarize_transcript";
    if let Err(err) = queue.create_queue(QUEUE_NAME).await {
        tracing::error!(error = %err, "could not create summarize queue");
        return;
    }
    loop {
        match queue.poll_batch(QUEUE_NAME, batch_size.max(1)).await {
            Ok(batch) if batch.is_empty() => tokio::time::sleep(POLL_IDLE_SLEEP).await,
            Ok(batch) => run_batch(&queue, QUEUE_NAME, batch, |job| async { handler.handle(&job).await }).await,
            Err(err) => {
                tracing::error!(error = %err, "summarize queue poll failed");
                tokio::time::sleep(POLL_IDLE_SLEEP).await;
            }
        }
    }
}

/// Keeps one probe worker running per provider the settings store knows
/// about, spawning new ones as providers appear. Never retires a loop for a
/// provider that disappears from the table — hot-reload here is additive,
/// matching the rate limiter's own explicit-method (not module-reload)
/// approach to reconfiguration (§9).
pub struct WorkerSupervisor {
    queue: Arc<dyn JobQueue>,
    handler: Arc<ProbeHandler>,
    source: Arc<dyn ProviderTableSource>,
    rate_limiter: Arc<RateLimiterRegistry>,
    running: RwLock<HashSet<String>>,
}

impl WorkerSupervisor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<ProbeHandler>,
        source: Arc<dyn ProviderTableSource>,
        rate_limiter: Arc<RateLimiterRegistry>,
    ) -> Self {
        Self {
            queue,
            handler,
            source,
            rate_limiter,
            running: RwLock::new(HashSet::new()),
        }
    }

    pub async fn sync(&self) {
        self.ensure_running(DEFAULT_QUEUE, 1).await;

        let rows = match self.source.load_provider_table().await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "worker supervisor could not load provider table");
                return;
            }
        };
        for row in rows {
            if !row.provider.enabled {
                continue;
            }
            self.rate_limiter
                .set_provider_config(
                    &row.provider.provider_id,
                    ProviderLimiterConfig {
                        max_concurrent: row.provider.max_parallel_requests,
                        requests_per_minute: row.provider.requests_per_minute,
                    },
                )
                .await;
            let queue_name = queue_name_for("probe_scenario", &row.provider);
            self.ensure_running(&queue_name, row.provider.max_parallel_requests).await;
        }
    }

    async fn ensure_running(&self, queue_name: &str, batch_size: usize) {
        {
            if self.running.read().await.contains(queue_name) {
                return;
            }
        }
        let mut running = self.running.write().await;
        if !running.insert(queue_name.to_string()) {
            return;
        }
        tracing::info!(queue = queue_name, batch_size, "starting probe worker");
        tokio::spawn(probe_worker_loop(
            self.queue.clone(),
            self.handler.clone(),
            queue_name.to_string(),
            batch_size,
        ));
    }
}

pub fn spawn_worker_supervisor_loop(supervisor: Arc<WorkerSupervisor>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            supervisor.sync().await;
            tokio::time::sleep(interval).await;
        }
    });
}

pub fn spawn_summarize_worker(queue: Arc<dyn JobQueue>, handler: Arc<SummarizeHandler>, batch_size: usize) {
    tokio::spawn(summarize_worker_loop(queue, handler, batch_size));
}

pub fn spawn_recovery_loop(controller: Arc<RunController>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match controller.reconcile_non_terminal_runs().await {
                Ok(report) if report.probes_reenqueued > 0 || report.summaries_reenqueued > 0 => {
                    tracing::info!(
                        probes = report.probes_reenqueued,
                        summaries = report.summaries_reenqueued,
                        "recovery scheduler re-enqueued work"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "recovery scheduler failed"),
            }
        }
    });
}

pub fn spawn_flush_loop(storage: Arc<Storage>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = storage.flush().await {
                tracing::error!(error = %err, "periodic store flush failed");
            }
        }
    });
}
