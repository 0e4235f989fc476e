use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use evalkit_orchestrator::reducer::{reduce, RunCommand, RunEvent, RunState};
use evalkit_types::{
    AnalysisResult, AnalysisStatus, Definition, DefinitionId, ProbeResult, Run, RunId, RunStatus,
    Scenario, ScenarioId, Transcript, TranscriptId,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EvalError;

/// Persisted stores for every entity in §3. Follows the same
/// whole-snapshot-flush shape this codebase's own storage layer uses: an
/// in-memory map guarded by a single lock per entity kind, with an
/// explicit `flush` writing a pretty-printed JSON snapshot. Progress
/// mutation on a single Run is therefore linearizable because it holds
/// that Run map's write lock for the whole read-modify-write (§4.6).
pub struct Storage {
    base_dir: PathBuf,
    definitions: RwLock<HashMap<DefinitionId, Definition>>,
    scenarios: RwLock<HashMap<ScenarioId, Scenario>>,
    runs: RwLock<HashMap<RunId, Run>>,
    run_selections: RwLock<HashMap<RunId, Vec<ScenarioId>>>,
    transcripts: RwLock<HashMap<TranscriptId, Transcript>>,
    probe_results: RwLock<Vec<ProbeResult>>,
    analysis_results: RwLock<HashMap<(RunId, String), Vec<AnalysisResult>>>,
}

impl Storage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            definitions: RwLock::new(HashMap::new()),
            scenarios: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            run_selections: RwLock::new(HashMap::new()),
            transcripts: RwLock::new(HashMap::new()),
            probe_results: RwLock::new(Vec::new()),
            analysis_results: RwLock::new(HashMap::new()),
        }
    }

    /// Rehydrates a previous [`Self::flush`] snapshot from `base_dir`, or
    /// starts empty if this is the first run against it. The composition
    /// root calls this instead of [`Self::new`] so the recovery scheduler
    /// has the prior process's Runs, Transcripts and ProbeResults to
    /// reconcile against on restart (§8 E6).
    pub async fn load(base_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        Ok(Self {
            definitions: RwLock::new(read_snapshot(&base_dir, "definitions.json").await?),
            scenarios: RwLock::new(read_snapshot(&base_dir, "scenarios.json").await?),
            runs: RwLock::new(read_snapshot(&base_dir, "runs.json").await?),
            run_selections: RwLock::new(read_snapshot(&base_dir, "run_selections.json").await?),
            transcripts: RwLock::new(read_snapshot(&base_dir, "transcripts.json").await?),
            probe_results: RwLock::new(read_snapshot(&base_dir, "probe_results.json").await?),
            analysis_results: RwLock::new(HashMap::new()),
            base_dir,
        })
    }

    // -- Definitions / Scenarios -----------------------------------------

    pub async fn put_definition(&self, definition: Definition) {
        self.definitions.write().await.insert(definition.id, definition);
    }

    pub async fn get_definition(&self, id: DefinitionId) -> Result<Definition, EvalError> {
        self.definitions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(format!("definition {id}")))
    }

    pub async fn put_scenario(&self, scenario: Scenario) {
        self.scenarios.write().await.insert(scenario.id, scenario);
    }

    pub async fn get_scenario(&self, id: ScenarioId) -> Result<Scenario, EvalError> {
        self.scenarios
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(format!("scenario {id}")))
    }

    /// Non-soft-deleted scenarios for a Definition, with scenarios of a
    /// soft-deleted Definition treated as deleted too (§3).
    pub async fn non_deleted_scenarios_for(
        &self,
        definition: &Definition,
    ) -> Vec<Scenario> {
        if definition.is_deleted() {
            return Vec::new();
        }
        self.scenarios
            .read()
            .await
            .values()
            .filter(|s| s.definition_id == definition.id && !s.is_effectively_deleted(definition))
            .cloned()
            .collect()
    }

    // -- Runs --------------------------------------------------------------

    pub async fn put_run(&self, run: Run) {
        self.runs.write().await.insert(run.id, run);
    }

    pub async fn get_run(&self, id: RunId) -> Result<Run, EvalError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(format!("run {id}")))
    }

    pub async fn set_run_selection(&self, run_id: RunId, scenario_ids: Vec<ScenarioId>) {
        self.run_selections.write().await.insert(run_id, scenario_ids);
    }

    pub async fn run_selection(&self, run_id: RunId) -> Vec<ScenarioId> {
        self.run_selections
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn non_terminal_runs(&self) -> Vec<Run> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_terminal() && !r.is_deleted())
            .cloned()
            .collect()
    }

    /// Atomic read-modify-write progress mutator (§4.6). Holds the whole
    /// run map's write lock for the duration, which is the single-row
    /// linearizability guarantee in this in-process implementation.
    pub async fn apply_run_event(
        &self,
        run_id: RunId,
        event: RunEvent,
    ) -> Result<(Run, Vec<RunCommand>), EvalError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| EvalError::NotFound(format!("run {run_id}")))?;

        let state = RunState {
            status: run.status,
            progress: run.progress,
            summarize_progress: run.summarize_progress,
            paused_from: None,
        };
        let (next_state, commands) = reduce(&state, event);

        run.progress = next_state.progress;
        run.summarize_progress = next_state.summarize_progress;
        if run.status != next_state.status {
            if run.status == RunStatus::Pending && next_state.status == RunStatus::Running {
                run.started_at = Some(Utc::now());
            }
            if next_state.status == RunStatus::Completed {
                run.completed_at = Some(Utc::now());
            }
            run.status = next_state.status;
        }
        run.last_accessed_at = Utc::now();

        Ok((run.clone(), commands))
    }

    // -- Transcripts & ProbeResults -----------------------------------------

    /// Idempotency check for §4.4: has this exact attempt already produced
    /// a Transcript? Used by the probe handler to short-circuit replays.
    pub async fn find_transcript_for_attempt(
        &self,
        run_id: RunId,
        scenario_id: ScenarioId,
        model_id: &str,
    ) -> Option<Transcript> {
        self.transcripts
            .read()
            .await
            .values()
            .find(|t| t.run_id == run_id && t.scenario_id == scenario_id && t.model_id == model_id)
            .cloned()
    }

    pub async fn put_transcript(&self, transcript: Transcript) {
        self.transcripts
            .write()
            .await
            .insert(transcript.id, transcript);
    }

    pub async fn get_transcript(&self, id: TranscriptId) -> Result<Transcript, EvalError> {
        self.transcripts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(format!("transcript {id}")))
    }

    pub async fn update_transcript_decision(
        &self,
        id: TranscriptId,
        decision_code: String,
        decision_text: String,
    ) -> Result<Transcript, EvalError> {
        let mut transcripts = self.transcripts.write().await;
        let transcript = transcripts
            .get_mut(&id)
            .ok_or_else(|| EvalError::NotFound(format!("transcript {id}")))?;
        transcript.decision_code = Some(decision_code);
        transcript.decision_text = Some(decision_text);
        transcript.summarized_at = Some(Utc::now());
        Ok(transcript.clone())
    }

    pub async fn transcripts_for_run(&self, run_id: RunId) -> Vec<Transcript> {
        self.transcripts
            .read()
            .await
            .values()
            .filter(|t| t.run_id == run_id && !t.is_deleted())
            .cloned()
            .collect()
    }

    pub async fn all_transcripts_summarized(&self, run_id: RunId) -> bool {
        self.transcripts_for_run(run_id)
            .await
            .iter()
            .all(|t| t.is_summarized())
    }

    pub async fn put_probe_result(&self, result: ProbeResult) {
        self.probe_results.write().await.push(result);
    }

    pub async fn probe_results_for_run(&self, run_id: RunId) -> Vec<ProbeResult> {
        self.probe_results
            .read()
            .await
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    // -- Analysis results ----------------------------------------------------

    /// Writes a new CURRENT analysis result for `(run_id, analysis_type)`,
    /// superseding whatever was CURRENT before (§3 invariant 3).
    pub async fn supersede_and_insert_analysis(&self, mut result: AnalysisResult) {
        let key = (result.run_id, result.analysis_type.clone());
        let mut store = self.analysis_results.write().await;
        let entries = store.entry(key).or_default();
        for existing in entries.iter_mut() {
            existing.status = AnalysisStatus::Superseded;
        }
        result.status = AnalysisStatus::Current;
        entries.push(result);
    }

    pub async fn current_analysis(
        &self,
        run_id: RunId,
        analysis_type: &str,
    ) -> Option<AnalysisResult> {
        self.analysis_results
            .read()
            .await
            .get(&(run_id, analysis_type.to_string()))
            .and_then(|entries| entries.iter().rev().find(|a| a.status == AnalysisStatus::Current))
            .cloned()
    }

    // -- Persistence ---------------------------------------------------------

    /// Writes a full snapshot of every store to `base_dir` as pretty JSON,
    /// each via temp-file-then-rename so a crash mid-write never leaves a
    /// half-written file behind.
    pub async fn flush(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        write_snapshot(&self.base_dir, "runs.json", &*self.runs.read().await).await?;
        write_snapshot(
            &self.base_dir,
            "transcripts.json",
            &*self.transcripts.read().await,
        )
        .await?;
        write_snapshot(
            &self.base_dir,
            "probe_results.json",
            &*self.probe_results.read().await,
        )
        .await?;
        write_snapshot(
            &self.base_dir,
            "definitions.json",
            &*self.definitions.read().await,
        )
        .await?;
        write_snapshot(&self.base_dir, "scenarios.json", &*self.scenarios.read().await).await?;
        write_snapshot(
            &self.base_dir,
            "run_selections.json",
            &*self.run_selections.read().await,
        )
        .await?;
        // analysis_results is keyed by a (RunId, analysis_type) tuple, which
        // has no JSON object-key representation; it is also the one store
        // that is purely derived output of the excluded bulk-analysis
        // component, so it is intentionally not part of the durable
        // snapshot the recovery scheduler reconciles against.
        Ok(())
    }
}

async fn write_snapshot<T: serde::Serialize>(
    base_dir: &Path,
    filename: &str,
    value: &T,
) -> anyhow::Result<()> {
    let path = base_dir.join(filename);
    let tmp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(value)?;
    tokio::fs::write(&tmp_path, content).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    Ok(())
}

async fn read_snapshot<T: serde::de::DeserializeOwned + Default>(
    base_dir: &Path,
    filename: &str,
) -> anyhow::Result<T> {
    let path = base_dir.join(filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalkit_types::{DefinitionContent, ProgressCounters, RunConfig};

    fn store() -> Storage {
        let dir = std::env::temp_dir().join(format!("evalkit_storage_test_{}", Uuid::new_v4()));
        Storage::new(dir)
    }

    fn make_definition(deleted: bool) -> Definition {
        Definition {
            id: Uuid::new_v4(),
            name: "d".into(),
            content: DefinitionContent {
                preamble: String::new(),
                template: String::new(),
                dimensions: vec![],
            },
            deleted_at: deleted.then(Utc::now),
        }
    }

    fn make_run(total: u64) -> Run {
        Run {
            id: Uuid::new_v4(),
            definition_id: Uuid::new_v4(),
            experiment_id: None,
            status: RunStatus::Pending,
            config: RunConfig {
                model_ids: vec!["m1".into()],
                sample_percentage: 50,
                sample_seed: Some(1),
                priority: evalkit_types::Priority::Normal,
                definition_snapshot: DefinitionContent {
                    preamble: String::new(),
                    template: String::new(),
                    dimensions: vec![],
                },
                cost_estimate: None,
            },
            progress: ProgressCounters {
                total,
                completed: 0,
                failed: 0,
            },
            summarize_progress: ProgressCounters::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_accessed_at: Utc::now(),
            created_by: "tester".into(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn deleted_definition_hides_all_its_scenarios() {
        let storage = store();
        let definition = make_definition(true);
        let scenario = Scenario {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            prompt: "p".into(),
            dimension_values: vec![],
            deleted_at: None,
        };
        storage.put_scenario(scenario).await;
        let visible = storage.non_deleted_scenarios_for(&definition).await;
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn apply_run_event_is_atomic_and_derives_status() {
        let storage = store();
        let run = make_run(2);
        let run_id = run.id;
        storage.put_run(run).await;

        storage
            .apply_run_event(run_id, RunEvent::ProbeSucceeded)
            .await
            .unwrap();
        let (run, commands) = storage
            .apply_run_event(run_id, RunEvent::ProbeFailed)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Summarizing);
        assert_eq!(run.progress.completed + run.progress.failed, 2);
        assert!(!commands.is_empty());
    }

    #[tokio::test]
    async fn transcript_idempotency_lookup_detects_replay() {
        let storage = store();
        let run_id = Uuid::new_v4();
        let scenario_id = Uuid::new_v4();
        let transcript = Transcript {
            id: Uuid::new_v4(),
            run_id,
            scenario_id,
            model_id: "m1".into(),
            resolved_model_version: "m1-v1".into(),
            content: evalkit_types::TranscriptContent {
                turns: vec![],
                total_input_tokens: 0,
                total_output_tokens: 0,
                started_at: Utc::now(),
                completed_at: Utc::now(),
            },
            decision_code: None,
            decision_text: None,
            summarized_at: None,
            definition_snapshot: DefinitionContent {
                preamble: String::new(),
                template: String::new(),
                dimensions: vec![],
            },
            deleted_at: None,
        };
        storage.put_transcript(transcript).await;

        let found = storage
            .find_transcript_for_attempt(run_id, scenario_id, "m1")
            .await;
        assert!(found.is_some());
        let missing = storage
            .find_transcript_for_attempt(run_id, scenario_id, "m2")
            .await;
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn analysis_result_supersession_keeps_exactly_one_current() {
        let storage = store();
        let run_id = Uuid::new_v4();
        let first = AnalysisResult {
            id: Uuid::new_v4(),
            run_id,
            analysis_type: "basic".into(),
            status: AnalysisStatus::Current,
            input_hash: "h1".into(),
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        };
        storage.supersede_and_insert_analysis(first).await;

        let second = AnalysisResult {
            id: Uuid::new_v4(),
            run_id,
            analysis_type: "basic".into(),
            status: AnalysisStatus::Current,
            input_hash: "h2".into(),
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        };
        storage.supersede_and_insert_analysis(second).await;

        let current = storage.current_analysis(run_id, "basic").await.unwrap();
        assert_eq!(current.input_hash, "h2");
    }

    #[tokio::test]
    async fn flush_writes_snapshot_files() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path());
        storage.put_run(make_run(1)).await;
        storage.flush().await.unwrap();
        assert!(tmp.path().join("runs.json").exists());
    }

    #[tokio::test]
    async fn load_rehydrates_a_prior_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path());
        let run = make_run(4);
        let run_id = run.id;
        storage.put_run(run).await;
        storage
            .set_run_selection(run_id, vec![Uuid::new_v4(), Uuid::new_v4()])
            .await;
        storage.flush().await.unwrap();

        let reloaded = Storage::load(tmp.path()).await.unwrap();
        let run = reloaded.get_run(run_id).await.unwrap();
        assert_eq!(run.progress.total, 4);
        assert_eq!(reloaded.run_selection(run_id).await.len(), 2);
    }

    #[tokio::test]
    async fn load_with_no_prior_snapshot_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::load(tmp.path()).await.unwrap();
        assert!(storage.non_terminal_runs().await.is_empty());
    }
}
