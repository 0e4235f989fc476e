//! Summarize Handler (§4.5): same shape as the probe handler, but drives the
//! summary producer and terminally completes a Run once every transcript it
//! owns carries a decision.

use std::sync::Arc;

use chrono::Utc;
use evalkit_providers::ProviderRegistry;
use evalkit_queue::QueuedJob;
use evalkit_ratelimit::{RateLimiterRegistry, ScheduleOpts};
use evalkit_wire::{ProducerError, SummarizeJobPayload, SummaryProducerInput, TranscriptPayload, TranscriptTurnWire};

use crate::capabilities::Enqueuer;
use crate::error::EvalError;
use crate::producers::SummaryProducer;
use crate::retry::is_retryable_structured;
use crate::storage::Storage;

pub struct SummarizeHandler {
    storage: Arc<Storage>,
    rate_limiter: Arc<RateLimiterRegistry>,
    provider_registry: Arc<ProviderRegistry>,
    producer: Arc<dyn SummaryProducer>,
    enqueuer: Arc<dyn Enqueuer>,
    summarize_concurrency_override: usize,
}

impl SummarizeHandler {
    pub fn new(
        storage: Arc<Storage>,
        rate_limiter: Arc<RateLimiterRegistry>,
        provider_registry: Arc<ProviderRegistry>,
        producer: Arc<dyn SummaryProducer>,
        enqueuer: Arc<dyn Enqueuer>,
        summarize_concurrency_override: usize,
    ) -> Self {
        Self {
            storage,
            rate_limiter,
            provider_registry,
            producer,
            enqueuer,
            summarize_concurrency_override,
        }
    }

    pub async fn handle(&self, job: &QueuedJob) -> Result<(), EvalError> {
        let payload: SummarizeJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(|e| EvalError::Validation(e.to_string()))?;

        let transcript = match self.storage.get_transcript(payload.transcript_id).await {
            Ok(t) => t,
            // Skip condition: transcript not found.
            Err(EvalError::NotFound(_)) => return Ok(()),
            Err(other) => return Err(other),
        };

        // Skip condition: already summarized.
        if transcript.is_summarized() {
            return Ok(());
        }

        let model_id = payload
            .summary_model_id
            .clone()
            .unwrap_or_else(|| transcript.model_id.clone());
        // Resolve through the same registry the probe handler uses (§4.2)
        // so two models of one provider share a single `<provider>:summarize`
        // reservoir instead of each getting their own.
        let provider = self.provider_registry.resolve(&model_id).await;

        let producer_input = SummaryProducerInput {
            transcript_id: transcript.id,
            model_id: model_id.clone(),
            transcript_content: TranscriptPayload {
                turns: transcript
                    .content
                    .turns
                    .iter()
                    .map(|t| TranscriptTurnWire {
                        role: t.role.clone(),
                        content: t.content.clone(),
                    })
                    .collect(),
                total_input_tokens: transcript.content.total_input_tokens,
                total_output_tokens: transcript.content.total_output_tokens,
                started_at: transcript.content.started_at,
                completed_at: transcript.content.completed_at,
            },
        };

        let producer = self.producer.clone();
        let opts = ScheduleOpts {
            concurrency_override: Some(self.summarize_concurrency_override),
        };
        let scenario_id_str = transcript.scenario_id.to_string();
        let output = self
            .rate_limiter
            .schedule(&provider.provider_id, &model_id, &scenario_id_str, opts, move || async move {
                producer.produce(producer_input).await
            })
            .await
            .map_err(|e| EvalError::Retryable(e.to_string()))?;

        if output.success {
            let summary = output.summary.ok_or_else(|| EvalError::NonRetryable {
                code: Some("malformed_producer_output".to_string()),
                message: "producer reported success with no summary".to_string(),
            })?;
            self.storage
                .update_transcript_decision(transcript.id, summary.decision_code, summary.decision_text)
                .await?;
            self.finish_attempt(payload.run_id, evalkit_orchestrator::RunEvent::SummarizeSucceeded)
                .await
        } else {
            self.handle_failure(&payload, job, &transcript, output.error).await
        }
    }

    async fn handle_failure(
        &self,
        payload: &SummarizeJobPayload,
        job: &QueuedJob,
        transcript: &evalkit_types::Transcript,
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

        // Retries exhausted (or non-retryable outright): a synthetic
        // "error" decision is written so the run can still complete (§4.5).
        self.storage
            .update_transcript_decision(transcript.id, "error".to_string(), error.message)
            .await?;
        self.finish_attempt(payload.run_id, evalkit_orchestrator::RunEvent::SummarizeFailed)
            .await
    }

    async fn finish_attempt(
        &self,
        run_id: evalkit_types::RunId,
        event: evalkit_orchestrator::RunEvent,
    ) -> Result<(), EvalError> {
        let (updated_run, _commands) = self.storage.apply_run_event(run_id, event).await?;

        if updated_run.status == evalkit_types::RunStatus::Completed {
            // Downstream triggers are best-effort: a failed enqueue here
            // does not roll back the completion (§4.5, §7).
            if let Err(err) = self.enqueuer.enqueue_token_stats(run_id).await {
                tracing::warn!(%run_id, error = %err, "failed to enqueue token-stats job");
            }
            let transcript_ids: Vec<_> = self
                .storage
                .transcripts_for_run(run_id)
                .await
                .into_iter()
                .map(|t| t.id)
                .collect();
            if let Err(err) = self
                .enqueuer
                .enqueue_analyze_basic(run_id, transcript_ids)
                .await
            {
                tracing::warn!(%run_id, error = %err, "failed to enqueue basic-analysis job");
            }
        }
        Ok(())
    }
}
