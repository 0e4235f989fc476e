//! JSON wire shapes exchanged with the durable queue and with the
//! transcript/summary producers (§6 External Interfaces). These are the
//! only shapes that require bit-exact compatibility.

use chrono::{DateTime, Utc};
use evalkit_types::{RunId, ScenarioId, TranscriptId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeJobConfig {
    pub temperature: f32,
    pub max_turns: u32,
}

/// Payload for a `probe_<provider>` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeJobPayload {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub model_id: String,
    pub config: ProbeJobConfig,
}

/// Payload for a `summarize_transcript` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeJobPayload {
    pub run_id: RunId,
    pub transcript_id: TranscriptId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_model_id: Option<String>,
}

/// Payload for a `compute_token_stats` job; always sent with `singletonKey = runId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStatsJobPayload {
    pub run_id: RunId,
}

/// Payload for an `analyze_basic` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeBasicJobPayload {
    pub run_id: RunId,
    pub transcript_ids: Vec<TranscriptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioInput {
    pub preamble: String,
    pub prompt: String,
    pub followups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_turns: u32,
}

/// Input handed to the (out-of-scope, black-box) transcript producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptProducerInput {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub model_id: String,
    pub scenario: ScenarioInput,
    pub config: ProducerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurnWire {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptPayload {
    pub turns: Vec<TranscriptTurnWire>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerError {
    pub message: String,
    pub code: Option<String>,
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Output of the transcript producer: `{success: true, transcript}` or `{success: false, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptProducerOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<TranscriptPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProducerError>,
}

/// Input handed to the (out-of-scope, black-box) summary producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryProducerInput {
    pub transcript_id: TranscriptId,
    pub model_id: String,
    pub transcript_content: TranscriptPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub decision_code: String,
    pub decision_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryProducerOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProducerError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_job_payload_round_trips() {
        let payload = ProbeJobPayload {
            run_id: evalkit_types::RunId::new_v4(),
            scenario_id: evalkit_types::ScenarioId::new_v4(),
            model_id: "gpt-test".into(),
            config: ProbeJobConfig {
                temperature: 0.2,
                max_turns: 4,
            },
        };
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: ProbeJobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.model_id, "gpt-test");
        assert_eq!(parsed.config.max_turns, 4);
    }

    #[test]
    fn producer_failure_shape_parses() {
        let json = serde_json::json!({
            "success": false,
            "error": { "message": "timed out", "code": "timeout", "retryable": true }
        });
        let out: TranscriptProducerOutput = serde_json::from_value(json).unwrap();
        assert!(!out.success);
        assert_eq!(out.error.unwrap().retryable, Some(true));
    }
}
