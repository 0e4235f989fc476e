//! The transcript and summary producers are out-of-scope collaborators
//! (§6): black-box LLM worker subprocesses. This module only defines the
//! narrow capability traits they must satisfy, plus the two implementations
//! that are in scope — a deterministic test double and a placeholder that
//! makes "nothing is wired yet" an explicit, typed condition rather than a
//! silent no-op (§9).

use async_trait::async_trait;
use evalkit_wire::{
    SummaryProducerInput, SummaryProducerOutput, TranscriptProducerInput, TranscriptProducerOutput,
};

/// Tags which family of black-box producer a model belongs to. Only two
/// variants ship here: the real per-vendor adapters are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Test,
    Unimplemented,
}

#[async_trait]
pub trait TranscriptProducer: Send + Sync {
    async fn produce(
        &self,
        input: TranscriptProducerInput,
    ) -> anyhow::Result<TranscriptProducerOutput>;
}

#[async_trait]
pub trait SummaryProducer: Send + Sync {
    async fn produce(&self, input: SummaryProducerInput) -> anyhow::Result<SummaryProducerOutput>;
}

/// A stand-in producer that always fails non-retryably, used where no real
/// producer is wired. Distinguishes "not configured" from a silent success.
pub struct UnimplementedTranscriptProducer;

#[async_trait]
impl TranscriptProducer for UnimplementedTranscriptProducer {
    async fn produce(
        &self,
        _input: TranscriptProducerInput,
    ) -> anyhow::Result<TranscriptProducerOutput> {
        Ok(TranscriptProducerOutput {
            success: false,
            transcript: None,
            error: Some(evalkit_wire::ProducerError {
                message: "no transcript producer configured".to_string(),
                code: Some("unimplemented".to_string()),
                retryable: Some(false),
                details: None,
            }),
        })
    }
}

pub struct UnimplementedSummaryProducer;

#[async_trait]
impl SummaryProducer for UnimplementedSummaryProducer {
    async fn produce(&self, _input: SummaryProducerInput) -> anyhow::Result<SummaryProducerOutput> {
        Ok(SummaryProducerOutput {
            success: false,
            summary: None,
            error: Some(evalkit_wire::ProducerError {
                message: "no summary producer configured".to_string(),
                code: Some("unimplemented".to_string()),
                retryable: Some(false),
                details: None,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalkit_wire::{ProducerConfig, ScenarioInput};
    use uuid::Uuid;

    #[tokio::test]
    async fn unimplemented_producer_reports_a_typed_non_retryable_error() {
        let producer = UnimplementedTranscriptProducer;
        let output = producer
            .produce(TranscriptProducerInput {
                run_id: Uuid::new_v4(),
                scenario_id: Uuid::new_v4(),
                model_id: "m1".into(),
                scenario: ScenarioInput {
                    preamble: String::new(),
                    prompt: "p".into(),
                    followups: vec![],
                },
                config: ProducerConfig {
                    temperature: 0.0,
                    max_tokens: 1,
                    max_turns: 1,
                },
                model_cost: None,
            })
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.error.unwrap().retryable, Some(false));
    }
}
