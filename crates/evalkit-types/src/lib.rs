//! Shared data model for the evaluation pipeline: definitions, scenarios,
//! runs, transcripts and the records the pipeline leaves behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type DefinitionId = Uuid;
pub type ScenarioId = Uuid;
pub type RunId = Uuid;
pub type TranscriptId = Uuid;
pub type ExperimentId = Uuid;

/// A labeled level within a dimension of a [`Definition`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DimensionLevel {
    pub label: String,
    pub value: String,
}

/// One axis of variation a [`Definition`] is expanded along to produce scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub levels: Vec<DimensionLevel>,
}

/// Immutable content of a [`Definition`]: everything needed to regenerate its scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefinitionContent {
    pub preamble: String,
    pub template: String,
    pub dimensions: Vec<Dimension>,
}

/// The declarative test spec a [`Scenario`] is derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub id: DefinitionId,
    pub name: String,
    pub content: DefinitionContent,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Definition {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A concrete prompt derived from a [`Definition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub definition_id: DefinitionId,
    pub prompt: String,
    pub dimension_values: Vec<DimensionLevel>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Scenario {
    /// A scenario whose definition is soft-deleted is treated as deleted too (§3 Data Model).
    pub fn is_effectively_deleted(&self, owning_definition: &Definition) -> bool {
        self.deleted_at.is_some() || owning_definition.is_deleted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Numeric priority as used on the wire (lower runs first): LOW=10, NORMAL=5, HIGH=0.
    pub fn queue_priority(self) -> i32 {
        match self {
            Priority::Low => 10,
            Priority::Normal => 5,
            Priority::High => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Summarizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Immutable configuration a [`Run`] was started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model_ids: Vec<String>,
    pub sample_percentage: u32,
    pub sample_seed: Option<u64>,
    pub priority: Priority,
    pub definition_snapshot: DefinitionContent,
    pub cost_estimate: Option<f64>,
}

/// `{total, completed, failed}` counters that drive the run state machine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressCounters {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl ProgressCounters {
    pub fn is_terminal(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub definition_id: DefinitionId,
    pub experiment_id: Option<ExperimentId>,
    pub status: RunStatus,
    pub config: RunConfig,
    pub progress: ProgressCounters,
    pub summarize_progress: ProgressCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    pub created_by: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One row linking a [`Run`] to a scenario it sampled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunScenarioSelection {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptContent {
    pub turns: Vec<TranscriptTurn>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// One (Run, Scenario, Model) attempt's successful output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: TranscriptId,
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub model_id: String,
    pub resolved_model_version: String,
    pub content: TranscriptContent,
    pub decision_code: Option<String>,
    pub decision_text: Option<String>,
    pub summarized_at: Option<DateTime<Utc>>,
    pub definition_snapshot: DefinitionContent,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Transcript {
    pub fn is_summarized(&self) -> bool {
        self.summarized_at.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub success: bool,
    pub transcript_id: Option<TranscriptId>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// Terminal per-attempt record, independent of the queue so its retention
/// policy cannot erase history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: Uuid,
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub model_id: String,
    pub outcome: ProbeOutcome,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnalysisStatus {
    Current,
    Superseded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: Uuid,
    pub run_id: RunId,
    pub analysis_type: String,
    pub status: AnalysisStatus,
    pub input_hash: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_queue_values_match_wire_contract() {
        assert_eq!(Priority::Low.queue_priority(), 10);
        assert_eq!(Priority::Normal.queue_priority(), 5);
        assert_eq!(Priority::High.queue_priority(), 0);
    }

    #[test]
    fn scenario_follows_definition_deletion() {
        let mut def = Definition {
            id: Uuid::new_v4(),
            name: "d".into(),
            content: DefinitionContent {
                preamble: String::new(),
                template: String::new(),
                dimensions: vec![],
            },
            deleted_at: None,
        };
        let scenario = Scenario {
            id: Uuid::new_v4(),
            definition_id: def.id,
            prompt: "p".into(),
            dimension_values: vec![],
            deleted_at: None,
        };
        assert!(!scenario.is_effectively_deleted(&def));
        def.deleted_at = Some(Utc::now());
        assert!(scenario.is_effectively_deleted(&def));
    }

    #[test]
    fn progress_terminal_detection() {
        let p = ProgressCounters {
            total: 4,
            completed: 3,
            failed: 1,
        };
        assert!(p.is_terminal());
        let q = ProgressCounters {
            total: 4,
            completed: 3,
            failed: 0,
        };
        assert!(!q.is_terminal());
    }
}
