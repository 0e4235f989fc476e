//! Probe Handler (§4.4): consumes a probe job, calls the transcript
//! producer through the rate limiter, persists the outcome, and advances
//! run progress. Never transitions a Run's status itself — only through
//! [`Storage::apply_run_event`].

use std::sync::Arc;

use chrono::Utc;
use evalkit_providers::ProviderRegistry;
use evalkit_queue::QueuedJob;
use evalkit_ratelimit::{RateLimiterRegistry, ScheduleOpts};
use evalkit_types::{
    ProbeOutcome, ProbeResult, RunStatus, Transcript, TranscriptContent, TranscriptTurn,
};
use evalkit_wire::{ProbeJobPayload, ProducerConfig, ProducerError, ScenarioInput, TranscriptProducerInput};
use uuid::Uuid;

use crate::capabilities::PhaseTransitionObserver;
use crate::error::{EvalError, RUN_PAUSED};
use crate::producers::TranscriptProducer;
use crate::retry::is_retryable_structured;
use crate::storage::Storage;

pub struct ProbeHandler {
    storage: Arc<Storage>,
    rate_limiter: Arc<RateLimiterRegistry>,
    provider_registry: Arc<ProviderRegistry>,
    producer: Arc<dyn TranscriptProducer>,
    observer: Arc<dyn PhaseTransitionObserver>,
}

impl ProbeHandler {
    pub fn new(
        storage: Arc<Storage>,
        rate_limiter: Arc<RateLimiterRegistry>,
        provider_registry: Arc<ProviderRegistry>,
        producer: Arc<dyn TranscriptProducer>,
        observer: Arc<dyn PhaseTransitionObserver>,
    ) -> Self {
        Self {
            storage,
            rate_limiter,
            provider_registry,
            producer,
            observer,
        }
    }

    /// Returns `Ok(())` when the job should be marked done on the queue
    /// (success, terminal failure, or a drop). Returns `Err` when the queue
    /// should retry the job with backoff (a retryable producer failure, or
    /// the `RUN_PAUSED` sentinel).
    pub async fn handle(&self, job: &QueuedJob) -> Result<(), EvalError> {
        let payload: ProbeJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(|e| EvalError::Validation(e.to_string()))?;

        let run = self.storage.get_run(payload.run_id).await?;

        // Step 1: terminal runs drop remaining work silently.
        if run.status.is_terminal() {
            return Ok(());
        }
        // Step 2: a paused run redelivers later via the sentinel cause.
        if run.status == RunStatus::Paused {
            return Err(EvalError::Retryable(RUN_PAUSED.to_string()));
        }

        // Idempotency: tolerate a replayed success for this exact attempt.
        if self
            .storage
            .find_transcript_for_attempt(payload.run_id, payload.scenario_id, &payload.model_id)
            .await
            .is_some()
        {
            return Ok(());
        }

        // Step 3: resolve the scenario, rejecting soft-deleted scenarios or parents.
        let scenario = self.storage.get_scenario(payload.scenario_id).await?;
        let definition = self.storage.get_definition(scenario.definition_id).await?;
        if scenario.is_effectively_deleted(&definition) {
            return Err(EvalError::Validation(format!(
                "scenario {} is soft-deleted",
                payload.scenario_id
            )));
        }

        // Step 4: resolve the model to its provider/limits.
        let provider = self.provider_registry.resolve(&payload.model_id).await;

        let producer_input = TranscriptProducerInput {
            run_id: payload.run_id,
            scenario_id: payload.scenario_id,
            model_id: payload.model_id.clone(),
            scenario: ScenarioInput {
                preamble: definition.content.preamble.clone(),
                prompt: scenario.prompt.clone(),
                followups: Vec::new(),
            },
            config: ProducerConfig {
                temperature: payload.config.temperature,
                max_tokens: 4096,
                max_turns: payload.config.max_turns,
            },
            model_cost: run.config.cost_estimate,
        };

        // Step 5: invoke the producer through the rate limiter.
        let producer = self.producer.clone();
        let scenario_id_str = payload.scenario_id.to_string();
        let output = self
            .rate_limiter
            .schedule(
                &provider.provider_id,
                &payload.model_id,
                &scenario_id_str,
                ScheduleOpts::default(),
                move || async move { producer.produce(producer_input).await },
            )
            .await
            .map_err(|e| EvalError::Retryable(e.to_string()))?;

        if output.success {
            self.handle_success(&payload, output, &run.config.definition_snapshot)
                .await
        } else {
            self.handle_failure(&payload, job, output.error).await
        }
    }

    async fn handle_success(
        &self,
        payload: &ProbeJobPayload,
        output: evalkit_wire::TranscriptProducerOutput,
        definition_snapshot: &evalkit_types::DefinitionContent,
    ) -> Result<(), EvalError> {
        let wire_transcript = output.transcript.ok_or_else(|| EvalError::NonRetryable {
            code: Some("malformed_producer_output".to_string()),
            message: "producer reported success with no transcript".to_string(),
        })?;

        // Step 8 validation: a transcript must carry at least one turn.
        if wire_transcript.turns.is_empty() {
            return Err(EvalError::NonRetryable {
                code: Some("invalid_transcript".to_string()),
                message: "transcript has no turns".to_string(),
            });
        }

        let transcript = Transcript {
            id: Uuid::new_v4(),
            run_id: payload.run_id,
            scenario_id: payload.scenario_id,
            model_id: payload.model_id.clone(),
            resolved_model_version: payload.model_id.clone(),
            content: TranscriptContent {
                turns: wire_transcript
                    .turns
                    .into_iter()
                    .map(|t| TranscriptTurn {
                        role: t.role,
                        content: t.content,
                    })
                    .collect(),
                total_input_tokens: wire_transcript.total_input_tokens,
                total_output_tokens: wire_transcript.total_output_tokens,
                started_at: wire_transcript.started_at,
                completed_at: wire_transcript.completed_at,
            },
            decision_code: None,
            decision_text: None,
            summarized_at: None,
            definition_snapshot: definition_snapshot.clone(),
            deleted_at: None,
        };
        let transcript_id = transcript.id;
        self.storage.put_transcript(transcript).await;

        self.storage
            .put_probe_result(ProbeResult {
                id: Uuid::new_v4(),
                run_id: payload.run_id,
                scenario_id: payload.scenario_id,
                model_id: payload.model_id.clone(),
                outcome: ProbeOutcome {
                    success: true,
                    transcript_id: Some(transcript_id),
                    error_code: None,
                    error_message: None,
                    retry_count: 0,
                },
                created_at: Utc::now(),
            })
            .await;

        let (updated_run, commands) = self
            .storage
            .apply_run_event(payload.run_id, evalkit_orchestrator::RunEvent::ProbeSucceeded)
            .await?;

        self.react_to_probe_progress(payload.run_id, transcript_id, &updated_run, &commands)
            .await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        payload: &ProbeJobPayload,
        job: &QueuedJob,
        error: Option<ProducerError>,
    ) -> Result<(), EvalError> {
        let error = error.unwrap_or(ProducerError {
            message: "producer reported failure with no error detail".to_string(),
            code: None,
            retryable: None,
            details: None,
        });

        let retryable = is_retryable_structured(&error.message, error.retryable);
        let attempts_remaining = job.retry_count + 1 < job.retry_limit;

        if retryable && attempts_remaining {
            return Err(EvalError::Retryable(error.message));
        }

        // Step 6 (and step 7 at retry exhaustion): persist a terminal failure.
        self.storage
            .put_probe_result(ProbeResult {
                id: Uuid::new_v4(),
                run_id: payload.run_id,
                scenario_id: payload.scenario_id,
                model_id: payload.model_id.clone(),
                outcome: ProbeOutcome {
                    success: false,
                    transcript_id: None,
                    error_code: error.code.clone(),
                    error_message: Some(error.message.clone()),
                    retry_count: job.retry_count,
                },
                created_at: Utc::now(),
            })
            .await;

        let (updated_run, commands) = self
            .storage
            .apply_run_event(payload.run_id, evalkit_orchestrator::RunEvent::ProbeFailed)
            .await?;

        self.react_to_probe_progress(payload.run_id, Uuid::nil(), &updated_run, &commands)
            .await?;
        Ok(())
    }

    /// Step 9: if this probe's increment causes RUNNING -> SUMMARIZING, the
    /// phase-transition path enqueues summarize jobs for every transcript on
    /// hand. If the probe succeeded *after* the run was already SUMMARIZING
    /// (a late arrival racing the rest of the batch), only its own
    /// transcript needs a summarize job.
    async fn react_to_probe_progress(
        &self,
        run_id: evalkit_types::RunId,
        transcript_id: evalkit_types::TranscriptId,
        updated_run: &evalkit_types::Run,
        commands: &[evalkit_orchestrator::RunCommand],
    ) -> Result<(), EvalError> {
        let just_transitioned = commands.iter().any(|c| {
            matches!(
                c,
                evalkit_orchestrator::RunCommand::StatusChanged {
                    to: RunStatus::Summarizing,
                    ..
                }
            )
        });

        if just_transitioned {
            self.observer
                .on_summarizing_phase_started(run_id)
                .await
                .map_err(EvalError::Internal)?;
        } else if updated_run.status == RunStatus::Summarizing && !transcript_id.is_nil() {
            self.observer
                .on_late_probe_arrival(run_id, transcript_id)
                .await
                .map_err(EvalError::Internal)?;
        }
        Ok(())
    }
}
