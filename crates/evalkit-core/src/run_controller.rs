//! Run Controller (§4.6): start-run validation/sampling/fan-out, the
//! progress mutators the handlers drive, pause/resume/cancel, and the
//! recovery scheduler. Owns enqueue for the whole crate (§9) — handlers
//! only ever see it through the narrow [`Enqueuer`]/[`PhaseTransitionObserver`]
//! capabilities.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use evalkit_queue::JobQueue;
use evalkit_types::{Priority, ProgressCounters, Run, RunConfig, RunId, RunStatus, ScenarioId};
use evalkit_wire::{AnalyzeBasicJobPayload, ProbeJobConfig, ProbeJobPayload, SummarizeJobPayload, TokenStatsJobPayload};
use uuid::Uuid;

use crate::capabilities::{Enqueuer, PhaseTransitionObserver};
use crate::error::EvalError;
use crate::router::QueueRouter;
use crate::storage::Storage;

/// Validated input to [`RunController::start_run`].
pub struct StartRunInput {
    pub definition_id: evalkit_types::DefinitionId,
    pub experiment_id: Option<evalkit_types::ExperimentId>,
    pub model_ids: Vec<String>,
    pub sample_percentage: u32,
    pub sample_seed: Option<u64>,
    pub priority: Priority,
    pub created_by: String,
    pub cost_estimate: Option<f64>,
}

pub struct RunController {
    storage: Arc<Storage>,
    queue: Arc<dyn JobQueue>,
    router: Arc<QueueRouter>,
}

impl RunController {
    pub fn new(storage: Arc<Storage>, queue: Arc<dyn JobQueue>, router: Arc<QueueRouter>) -> Self {
        Self { storage, queue, router }
    }

    /// §4.6 startRun: validates, samples deterministically, fans out one
    /// probe job per (selected scenario, model) pair.
    pub async fn start_run(&self, input: StartRunInput) -> Result<Run, EvalError> {
        if input.model_ids.is_empty() {
            return Err(EvalError::Validation("at least one model is required".to_string()));
        }
        if !(1..=100).contains(&input.sample_percentage) {
            return Err(EvalError::Validation(
                "sample_percentage must be in [1, 100]".to_string(),
            ));
        }

        let definition = self.storage.get_definition(input.definition_id).await?;
        if definition.is_deleted() {
            return Err(EvalError::NotFound(format!("definition {}", input.definition_id)));
        }
        let scenarios = self.storage.non_deleted_scenarios_for(&definition).await;
        if scenarios.is_empty() {
            return Err(EvalError::Validation(
                "definition has no non-deleted scenarios".to_string(),
            ));
        }

        let scenario_ids: Vec<ScenarioId> = scenarios.iter().map(|s| s.id).collect();
        let selected = evalkit_orchestrator::sample_scenarios(
            &scenario_ids,
            input.sample_percentage,
            input.sample_seed,
        );

        let total_jobs = (selected.len() * input.model_ids.len()) as u64;
        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            definition_id: input.definition_id,
            experiment_id: input.experiment_id,
            status: RunStatus::Pending,
            config: RunConfig {
                model_ids: input.model_ids.clone(),
                sample_percentage: input.sample_percentage,
                sample_seed: input.sample_seed,
                priority: input.priority,
                definition_snapshot: definition.content.clone(),
                cost_estimate: input.cost_estimate,
            },
            progress: ProgressCounters {
                total: total_jobs,
                completed: 0,
                failed: 0,
            },
            summarize_progress: ProgressCounters::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            last_accessed_at: now,
            created_by: input.created_by,
            deleted_at: None,
        };
        let run_id = run.id;

        self.storage.put_run(run.clone()).await;
        self.storage.set_run_selection(run_id, selected.clone()).await;

        let priority = input.priority.queue_priority();
        for scenario_id in &selected {
            for model_id in &input.model_ids {
                self.send_probe_job(run_id, *scenario_id, model_id, priority).await?;
            }
        }

        Ok(run)
    }

    async fn send_probe_job(
        &self,
        run_id: RunId,
        scenario_id: ScenarioId,
        model_id: &str,
        priority: i32,
    ) -> Result<(), EvalError> {
        let (queue_name, _provider) = self
            .router
            .ensure_probe_queue(model_id)
            .await
            .map_err(EvalError::Internal)?;

        let payload = ProbeJobPayload {
            run_id,
            scenario_id,
            model_id: model_id.to_string(),
            config: ProbeJobConfig {
                temperature: 0.7,
                max_turns: 8,
            },
        };
        self.queue
            .send(
                &queue_name,
                serde_json::to_value(payload).map_err(|e| EvalError::Internal(e.into()))?,
                evalkit_queue::SendOptions {
                    priority,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EvalError::Internal(e.into()))?;
        Ok(())
    }

    // -- Pause / resume / cancel --------------------------------------------

    pub async fn pause(&self, run_id: RunId) -> Result<Run, EvalError> {
        let (run, _) = self
            .storage
            .apply_run_event(run_id, evalkit_orchestrator::RunEvent::Paused)
            .await?;
        Ok(run)
    }

    pub async fn resume(&self, run_id: RunId) -> Result<Run, EvalError> {
        let (run, _) = self
            .storage
            .apply_run_event(run_id, evalkit_orchestrator::RunEvent::Resumed)
            .await?;
        Ok(run)
    }

    pub async fn cancel(&self, run_id: RunId) -> Result<Run, EvalError> {
        let (run, _) = self
            .storage
            .apply_run_event(run_id, evalkit_orchestrator::RunEvent::Cancelled)
            .await?;
        Ok(run)
    }

    // -- Recovery scheduler ----------------------------------------------------

    /// §4.6 recovery scheduler / §8 property 3 (idempotence): scans
    /// non-terminal runs and re-enqueues exactly the probes and summaries
    /// that have neither a terminal result nor a currently-scheduled job.
    pub async fn reconcile_non_terminal_runs(&self) -> Result<RecoveryReport, EvalError> {
        let mut report = RecoveryReport::default();
        for run in self.storage.non_terminal_runs().await {
            self.reconcile_run(&run, &mut report).await?;
        }
        Ok(report)
    }

    async fn reconcile_run(&self, run: &Run, report: &mut RecoveryReport) -> Result<(), EvalError> {
        let selection = self.storage.run_selection(run.id).await;
        let probe_results = self.storage.probe_results_for_run(run.id).await;
        let attempted: std::collections::HashSet<(ScenarioId, String)> = probe_results
            .iter()
            .map(|r| (r.scenario_id, r.model_id.clone()))
            .collect();

        for scenario_id in &selection {
            for model_id in &run.config.model_ids {
                if attempted.contains(&(*scenario_id, model_id.clone())) {
                    continue;
                }
                let (queue_name, _) = self
                    .router
                    .ensure_probe_queue(model_id)
                    .await
                    .map_err(EvalError::Internal)?;
                let already_scheduled = self
                    .queue
                    .has_scheduled(&queue_name, "scenario_id", &scenario_id.to_string())
                    .await
                    .map_err(|e| EvalError::Internal(e.into()))?;
                if already_scheduled {
                    continue;
                }
                self.send_probe_job(run.id, *scenario_id, model_id, run.config.priority.queue_priority())
                    .await?;
                report.probes_reenqueued += 1;
            }
        }

        if matches!(run.status, RunStatus::Summarizing) {
            for transcript in self.storage.transcripts_for_run(run.id).await {
                if transcript.is_summarized() {
                    continue;
                }
                let already_scheduled = self
                    .queue
                    .has_scheduled("summarize_transcript", "transcript_id", &transcript.id.to_string())
                    .await
                    .map_err(|e| EvalError::Internal(e.into()))?;
                if already_scheduled {
                    continue;
                }
                self.enqueue_summarize_job(run.id, transcript.id)
                    .await
                    .map_err(EvalError::Internal)?;
                report.summaries_reenqueued += 1;
            }
        }

        Ok(())
    }

    async fn enqueue_summarize_job(&self, run_id: RunId, transcript_id: evalkit_types::TranscriptId) -> anyhow::Result<()> {
        let queue_name = self.router.ensure_summarize_queue().await?;
        let payload = SummarizeJobPayload {
            run_id,
            transcript_id,
            summary_model_id: None,
        };
        self.queue
            .send(&queue_name, serde_json::to_value(payload)?, evalkit_queue::SendOptions::default())
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub probes_reenqueued: usize,
    pub summaries_reenqueued: usize,
}

#[async_trait]
impl Enqueuer for RunController {
    async fn enqueue_probe(
        &self,
        run_id: RunId,
        scenario_id: ScenarioId,
        model_id: &str,
        priority: i32,
    ) -> anyhow::Result<()> {
        self.send_probe_job(run_id, scenario_id, model_id, priority)
            .await
            .map_err(Into::into)
    }

    async fn enqueue_summarize(&self, run_id: RunId, transcript_id: evalkit_types::TranscriptId) -> anyhow::Result<()> {
        self.enqueue_summarize_job(run_id, transcript_id).await
    }

    async fn enqueue_token_stats(&self, run_id: RunId) -> anyhow::Result<()> {
        self.queue.create_queue("compute_token_stats").await?;
        let payload = TokenStatsJobPayload { run_id };
        self.queue
            .send(
                "compute_token_stats",
                serde_json::to_value(payload)?,
                evalkit_queue::SendOptions {
                    singleton_key: Some(run_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn enqueue_analyze_basic(
        &self,
        run_id: RunId,
        transcript_ids: Vec<evalkit_types::TranscriptId>,
    ) -> anyhow::Result<()> {
        self.queue.create_queue("analyze_basic").await?;
        let payload = AnalyzeBasicJobPayload {
            run_id,
            transcript_ids,
            force: None,
        };
        self.queue
            .send("analyze_basic", serde_json::to_value(payload)?, evalkit_queue::SendOptions::default())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PhaseTransitionObserver for RunController {
    async fn on_summarizing_phase_started(&self, run_id: RunId) -> anyhow::Result<()> {
        let transcripts = self.storage.transcripts_for_run(run_id).await;
        self.storage
            .apply_run_event(
                run_id,
                evalkit_orchestrator::RunEvent::SummarizeTotalSet {
                    total: transcripts.len() as u64,
                },
            )
            .await
            .map_err(anyhow::Error::from)?;
        for transcript in transcripts {
            if !transcript.is_summarized() {
                self.enqueue_summarize_job(run_id, transcript.id).await?;
            }
        }
        Ok(())
    }

    async fn on_late_probe_arrival(&self, run_id: RunId, transcript_id: evalkit_types::TranscriptId) -> anyhow::Result<()> {
        self.enqueue_summarize_job(run_id, transcript_id).await
    }
}
