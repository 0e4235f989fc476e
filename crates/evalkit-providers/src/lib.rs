//! Provider Registry (§4.1): an in-memory, TTL-cached table mapping
//! model-id to the provider that owns it, plus that provider's rate-limit
//! budget. The real transcript/summary producers are out of scope (they
//! are black-box subprocesses); this crate only resolves *which* provider
//! and *what limits* apply to a given model-id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const UNKNOWN_PROVIDER: &str = "unknown provider";
pub const DEFAULT_QUEUE: &str = "probe_scenario";

/// A provider's identity and the budget the rate limiter should enforce
/// for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub provider_id: String,
    pub max_parallel_requests: usize,
    pub requests_per_minute: u32,
    pub enabled: bool,
}

/// One row of the persisted settings store this registry is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTableRow {
    pub model_id: String,
    pub provider: ProviderInfo,
}

/// Supplies the current provider table. Implemented by whatever persists
/// settings; the registry itself never talks to storage directly so it can
/// be TTL-cached and tested without one.
#[async_trait::async_trait]
pub trait ProviderTableSource: Send + Sync {
    async fn load_provider_table(&self) -> anyhow::Result<Vec<ProviderTableRow>>;
}

/// Lazy, TTL-cached (1 minute) provider lookup table (§4.1).
pub struct ProviderRegistry {
    source: Arc<dyn ProviderTableSource>,
    ttl: Duration,
    cache: RwLock<Option<(Instant, HashMap<String, ProviderInfo>)>>,
}

impl ProviderRegistry {
    pub fn new(source: Arc<dyn ProviderTableSource>) -> Self {
        Self {
            source,
            ttl: DEFAULT_TTL,
            cache: RwLock::new(None),
        }
    }

    pub fn with_ttl(source: Arc<dyn ProviderTableSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn refresh(&self) -> HashMap<String, ProviderInfo> {
        match self.source.load_provider_table().await {
            Ok(rows) => {
                let map: HashMap<String, ProviderInfo> = rows
                    .into_iter()
                    .filter(|r| r.provider.enabled)
                    .map(|r| (r.model_id, r.provider))
                    .collect();
                *self.cache.write().await = Some((Instant::now(), map.clone()));
                map
            }
            Err(err) => {
                tracing::warn!(error = %err, "provider table source unavailable, falling back to cache");
                self.cache
                    .read()
                    .await
                    .as_ref()
                    .map(|(_, m)| m.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Resolves a model-id to its owning provider, refreshing the cache if
    /// it has expired. A cache miss falls through to stale data if the
    /// source is unavailable, and finally to [`UNKNOWN_PROVIDER`].
    pub async fn resolve(&self, model_id: &str) -> ProviderInfo {
        let needs_refresh = {
            let cache = self.cache.read().await;
            match cache.as_ref() {
                Some((fetched_at, _)) => fetched_at.elapsed() >= self.ttl,
                None => true,
            }
        };

        let table = if needs_refresh {
            self.refresh().await
        } else {
            self.cache.read().await.as_ref().unwrap().1.clone()
        };

        table.get(model_id).cloned().unwrap_or_else(|| ProviderInfo {
            provider_id: UNKNOWN_PROVIDER.to_string(),
            max_parallel_requests: 1,
            requests_per_minute: 60,
            enabled: true,
        })
    }

    /// Forces the next [`Self::resolve`] call to rebuild the cache, used
    /// when settings change.
    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
    }
}

/// Computes the queue a job type/model pair should be routed to (§4.3).
pub fn queue_name_for(job_type: &str, provider: &ProviderInfo) -> String {
    match job_type {
        "probe_scenario" => {
            if provider.provider_id == UNKNOWN_PROVIDER {
                DEFAULT_QUEUE.to_string()
            } else {
                format!("probe_{}", provider.provider_id)
            }
        }
        "summarize_transcript" => "summarize_transcript".to_string(),
        _ => DEFAULT_QUEUE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSource {
        rows: Vec<ProviderTableRow>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProviderTableSource for StaticSource {
        async fn load_provider_table(&self) -> anyhow::Result<Vec<ProviderTableRow>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.clone())
        }
    }

    fn row(model: &str, provider: &str) -> ProviderTableRow {
        ProviderTableRow {
            model_id: model.to_string(),
            provider: ProviderInfo {
                provider_id: provider.to_string(),
                max_parallel_requests: 2,
                requests_per_minute: 30,
                enabled: true,
            },
        }
    }

    #[tokio::test]
    async fn resolves_known_model() {
        let source = Arc::new(StaticSource {
            rows: vec![row("gpt-4", "openai")],
            calls: AtomicUsize::new(0),
        });
        let registry = ProviderRegistry::new(source);
        let info = registry.resolve("gpt-4").await;
        assert_eq!(info.provider_id, "openai");
        assert_eq!(info.max_parallel_requests, 2);
    }

    #[tokio::test]
    async fn unknown_model_falls_through_to_default() {
        let source = Arc::new(StaticSource {
            rows: vec![row("gpt-4", "openai")],
            calls: AtomicUsize::new(0),
        });
        let registry = ProviderRegistry::new(source);
        let info = registry.resolve("totally-unknown").await;
        assert_eq!(info.provider_id, UNKNOWN_PROVIDER);
        assert_eq!(queue_name_for("probe_scenario", &info), DEFAULT_QUEUE);
    }

    #[tokio::test]
    async fn cache_is_reused_within_ttl() {
        let source = Arc::new(StaticSource {
            rows: vec![row("gpt-4", "openai")],
            calls: AtomicUsize::new(0),
        });
        let registry = ProviderRegistry::with_ttl(source.clone(), Duration::from_secs(60));
        registry.resolve("gpt-4").await;
        registry.resolve("gpt-4").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_cache_forces_refresh() {
        let source = Arc::new(StaticSource {
            rows: vec![row("gpt-4", "openai")],
            calls: AtomicUsize::new(0),
        });
        let registry = ProviderRegistry::with_ttl(source.clone(), Duration::from_secs(60));
        registry.resolve("gpt-4").await;
        registry.clear_cache().await;
        registry.resolve("gpt-4").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn queue_name_routes_per_provider() {
        let info = ProviderInfo {
            provider_id: "anthropic".to_string(),
            max_parallel_requests: 3,
            requests_per_minute: 50,
            enabled: true,
        };
        assert_eq!(queue_name_for("probe_scenario", &info), "probe_anthropic");
        assert_eq!(
            queue_name_for("summarize_transcript", &info),
            "summarize_transcript"
        );
    }
}
