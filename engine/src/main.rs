use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use evalkit_core::{ProbeHandler, RunController, Storage, SummarizeHandler, UnimplementedSummaryProducer, UnimplementedTranscriptProducer};
use evalkit_observability::{canonical_logs_dir_from_root, init_process_logging, LoggingInitInfo};
use evalkit_providers::ProviderRegistry;
use evalkit_queue::{InMemoryJobQueue, JobQueue};
use evalkit_ratelimit::RateLimiterRegistry;

mod config;
mod http;
mod workers;

use config::SettingsStore;
use workers::WorkerSupervisor;

pub struct AppState {
    pub storage: Arc<Storage>,
    pub queue: Arc<dyn JobQueue>,
    pub controller: Arc<RunController>,
}

#[derive(Parser, Debug)]
#[command(name = "evalkit-engine")]
#[command(about = "Headless evaluation-pipeline engine")]
struct Cli {
    /// Directory holding the store snapshot, settings file, and logs.
    #[arg(long, env = "EVALKIT_STATE_DIR", default_value = ".evalkit")]
    state_dir: PathBuf,
    #[arg(long, env = "EVALKIT_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "EVALKIT_PORT", default_value_t = 4000)]
    port: u16,
    /// Seconds between recovery-scheduler sweeps (§4.6).
    #[arg(long, env = "EVALKIT_RECOVERY_INTERVAL_SECS", default_value_t = 30)]
    recovery_interval_secs: u64,
    /// Seconds between provider-table polls that spawn new probe workers.
    #[arg(long, env = "EVALKIT_WORKER_SYNC_INTERVAL_SECS", default_value_t = 10)]
    worker_sync_interval_secs: u64,
    /// Seconds between durable snapshot flushes.
    #[arg(long, env = "EVALKIT_FLUSH_INTERVAL_SECS", default_value_t = 5)]
    flush_interval_secs: u64,
    #[arg(long, env = "EVALKIT_LOG_RETENTION_DAYS", default_value_t = 14)]
    log_retention_days: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logs_dir = canonical_logs_dir_from_root(&cli.state_dir);
    let _logging_guard = init_process_logging(&LoggingInitInfo {
        logs_dir,
        retention_days: cli.log_retention_days,
    })?;

    tracing::info!(state_dir = %cli.state_dir.display(), "starting evalkit-engine");

    let state = build_state(&cli).await?;

    let addr: std::net::SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .context("invalid host or port")?;
    tracing::info!(%addr, "listening");
    http::serve(addr, state).await
}

async fn build_state(cli: &Cli) -> anyhow::Result<Arc<AppState>> {
    let storage = Arc::new(Storage::load(cli.state_dir.join("store")).await?);
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
    let settings = Arc::new(SettingsStore::load(cli.state_dir.join("settings.json")).await?);
    let provider_registry = Arc::new(ProviderRegistry::new(settings.clone()));
    let router = Arc::new(evalkit_core::QueueRouter::new(queue.clone(), provider_registry.clone()));
    let rate_limiter = Arc::new(RateLimiterRegistry::new());

    let controller = Arc::new(RunController::new(storage.clone(), queue.clone(), router.clone()));

    let summarize_concurrency = settings.summarize_concurrency_override().await.unwrap_or(1);

    let probe_handler = Arc::new(ProbeHandler::new(
        storage.clone(),
        rate_limiter.clone(),
        provider_registry.clone(),
        Arc::new(UnimplementedTranscriptProducer),
        controller.clone(),
    ));
    let summarize_handler = Arc::new(SummarizeHandler::new(
        storage.clone(),
        rate_limiter.clone(),
        provider_registry.clone(),
        Arc::new(UnimplementedSummaryProducer),
        controller.clone(),
        summarize_concurrency,
    ));

    let supervisor = Arc::new(WorkerSupervisor::new(
        queue.clone(),
        probe_handler,
        settings,
        rate_limiter,
    ));
    supervisor.sync().await;
    workers::spawn_worker_supervisor_loop(supervisor, Duration::from_secs(cli.worker_sync_interval_secs));
    workers::spawn_summarize_worker(queue.clone(), summarize_handler, summarize_concurrency.max(1));
    workers::spawn_recovery_loop(controller.clone(), Duration::from_secs(cli.recovery_interval_secs));
    workers::spawn_flush_loop(storage.clone(), Duration::from_secs(cli.flush_interval_secs));

    Ok(Arc::new(AppState {
        storage,
        queue,
        controller,
    }))
}
