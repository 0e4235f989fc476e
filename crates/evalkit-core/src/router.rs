//! Queue Router (§4.3): computes which durable queue a (job-type, model)
//! pair belongs on and idempotently creates provider queues at startup.

use std::collections::HashSet;
use std::sync::Arc;

use evalkit_providers::{queue_name_for, ProviderInfo, ProviderRegistry};
use evalkit_queue::JobQueue;
use tokio::sync::RwLock;

pub struct QueueRouter {
    queue: Arc<dyn JobQueue>,
    registry: Arc<ProviderRegistry>,
    created: RwLock<HashSet<String>>,
}

impl QueueRouter {
    pub fn new(queue: Arc<dyn JobQueue>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            queue,
            registry,
            created: RwLock::new(HashSet::new()),
        }
    }

    pub async fn queue_name_for_model(&self, job_type: &str, model_id: &str) -> String {
        let provider = self.registry.resolve(model_id).await;
        queue_name_for(job_type, &provider)
    }

    /// Resolves the provider-scoped probe queue for `model_id`, creating it
    /// on the durable queue the first time it's seen (§4.3: "idempotent").
    /// Returns the queue name and the provider info so the caller can size
    /// its worker's batch to `provider.max_parallel_requests`.
    pub async fn ensure_probe_queue(&self, model_id: &str) -> anyhow::Result<(String, ProviderInfo)> {
        let provider = self.registry.resolve(model_id).await;
        let queue = queue_name_for("probe_scenario", &provider);
        self.ensure_created(&queue).await?;
        Ok((queue, provider))
    }

    pub async fn ensure_summarize_queue(&self) -> anyhow::Result<String> {
        let queue = "summarize_transcript".to_string();
        self.ensure_created(&queue).await?;
        Ok(queue)
    }

    async fn ensure_created(&self, queue: &str) -> anyhow::Result<()> {
        if self.created.read().await.contains(queue) {
            return Ok(());
        }
        let mut created = self.created.write().await;
        if created.contains(queue) {
            return Ok(());
        }
        self.queue.create_queue(queue).await?;
        created.insert(queue.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalkit_providers::{ProviderTableRow, ProviderTableSource};
    use evalkit_queue::InMemoryJobQueue;

    struct StaticSource;

    #[async_trait::async_trait]
    impl ProviderTableSource for StaticSource {
        async fn load_provider_table(&self) -> anyhow::Result<Vec<ProviderTableRow>> {
            Ok(vec![ProviderTableRow {
                model_id: "gpt-4".to_string(),
                provider: ProviderInfo {
                    provider_id: "openai".to_string(),
                    max_parallel_requests: 3,
                    requests_per_minute: 60,
                    enabled: true,
                },
            }])
        }
    }

    #[tokio::test]
    async fn ensure_probe_queue_creates_once_and_reports_provider_limits() {
        let queue = Arc::new(InMemoryJobQueue::default());
        let registry = Arc::new(ProviderRegistry::new(Arc::new(StaticSource)));
        let router = QueueRouter::new(queue.clone(), registry);

        let (name1, info) = router.ensure_probe_queue("gpt-4").await.unwrap();
        let (name2, _) = router.ensure_probe_queue("gpt-4").await.unwrap();

        assert_eq!(name1, "probe_openai");
        assert_eq!(name1, name2);
        assert_eq!(info.max_parallel_requests, 3);
        assert!(queue.stats(&name1).await.is_ok());
    }
}
