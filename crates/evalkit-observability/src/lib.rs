//! Structured logging shared by every component of the pipeline (§4.8,
//! §10). Transcript and summary content is never logged verbatim — only a
//! redacted/hashed form — so shipped logs cannot leak prompt or model
//! output text.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Which long-running component is doing the logging, carried on every
/// event so a shipped log stream can be split back out by process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    ProbeHandler,
    SummarizeHandler,
    RunController,
    RecoveryScheduler,
    Engine,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::ProbeHandler => "probe-handler",
            ComponentKind::SummarizeHandler => "summarize-handler",
            ComponentKind::RunController => "run-controller",
            ComponentKind::RecoveryScheduler => "recovery-scheduler",
            ComponentKind::Engine => "engine",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingInitInfo {
    pub logs_dir: PathBuf,
    pub retention_days: u32,
}

/// Fields an evaluation-pipeline event may carry. All optional: a given
/// event only fills in what's relevant to it.
#[derive(Debug, Default)]
pub struct PipelineEvent<'a> {
    pub run_id: Option<&'a str>,
    pub scenario_id: Option<&'a str>,
    pub transcript_id: Option<&'a str>,
    pub provider: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub job_id: Option<&'a str>,
    pub queue: Option<&'a str>,
    pub decision_code: Option<&'a str>,
    pub duration_ms: Option<u64>,
    pub message: &'a str,
}

/// Emits a structured event at `level` for `component`, filling in only the
/// fields that are set. Mirrors this codebase's existing observability
/// emitter so the pipeline's logs read the same way the rest of it does.
pub fn emit_event(level: tracing::Level, component: ComponentKind, event: &PipelineEvent<'_>) {
    let component = component.as_str();
    match level {
        tracing::Level::ERROR => tracing::error!(
            component,
            run_id = event.run_id,
            scenario_id = event.scenario_id,
            transcript_id = event.transcript_id,
            provider = event.provider,
            model_id = event.model_id,
            job_id = event.job_id,
            queue = event.queue,
            decision_code = event.decision_code,
            duration_ms = event.duration_ms,
            "{}",
            event.message
        ),
        tracing::Level::WARN => tracing::warn!(
            component,
            run_id = event.run_id,
            scenario_id = event.scenario_id,
            transcript_id = event.transcript_id,
            provider = event.provider,
            model_id = event.model_id,
            job_id = event.job_id,
            queue = event.queue,
            decision_code = event.decision_code,
            duration_ms = event.duration_ms,
            "{}",
            event.message
        ),
        _ => tracing::info!(
            component,
            run_id = event.run_id,
            scenario_id = event.scenario_id,
            transcript_id = event.transcript_id,
            provider = event.provider,
            model_id = event.model_id,
            job_id = event.job_id,
            queue = event.queue,
            decision_code = event.decision_code,
            duration_ms = event.duration_ms,
            "{}",
            event.message
        ),
    }
}

/// Hashes `text` rather than logging it verbatim. Used for transcript and
/// summary content, which must never appear in shipped logs.
pub fn redact_text(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("redacted:{:016x}:len{}", hasher.finish(), text.len())
}

/// Initializes process-wide logging: a console layer plus a daily-rotating
/// JSON-lines file layer under `logs_dir`, leveled from `RUST_LOG` (or
/// `info` if unset).
pub fn init_process_logging(info: &LoggingInitInfo) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&info.logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(&info.logs_dir, "evalkit.jsonl");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;

    cleanup_old_jsonl(&info.logs_dir, info.retention_days);
    Ok(guard)
}

/// Deletes `*.jsonl` files under `dir` older than `retention_days`, keyed
/// off each filename's embedded date.
pub fn cleanup_old_jsonl(dir: &Path, retention_days: u32) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".jsonl") {
            continue;
        }
        let Some(date_str) = name.split('.').find(|part| part.len() == 10 && part.matches('-').count() == 2) else {
            continue;
        };
        if let Ok(date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
            let file_time = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
            if file_time < cutoff {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let redacted = redact_text("the model's secret transcript text");
        assert!(!redacted.contains("secret"));
        assert!(redacted.starts_with("redacted:"));
    }

    #[test]
    fn redact_text_is_deterministic() {
        assert_eq!(redact_text("same input"), redact_text("same input"));
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = Path::new("/var/data/evalkit");
        assert_eq!(canonical_logs_dir_from_root(root), root.join("logs"));
    }
}
