use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::Instant;

use crate::bucket::TokenBucket;
use crate::{CompletionEvent, LiveCounters};

const RING_BUFFER_SIZE: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct ProviderLimiterConfig {
    pub max_concurrent: usize,
    pub requests_per_minute: u32,
}

impl ProviderLimiterConfig {
    fn spacing(&self) -> Duration {
        if self.requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(
                (60_000u64).div_ceil(self.requests_per_minute as u64),
            )
        }
    }
}

struct SpacingState {
    bucket: TokenBucket,
    last_start: Option<Instant>,
}

/// One provider's (or `<provider>:summarize`'s) independent limiter: its own
/// semaphore, reservoir, and ring buffer — §5 "no cross-provider sharing".
struct ProviderLimiter {
    config: ProviderLimiterConfig,
    semaphore: Arc<Semaphore>,
    spacing_state: Mutex<SpacingState>,
    ring: Mutex<VecDeque<CompletionEvent>>,
    queued: std::sync::atomic::AtomicUsize,
    done: std::sync::atomic::AtomicUsize,
}

impl ProviderLimiter {
    fn new(config: ProviderLimiterConfig) -> Self {
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            spacing_state: Mutex::new(SpacingState {
                bucket: TokenBucket::new(config.requests_per_minute, Instant::now()),
                last_start: None,
            }),
            ring: Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE)),
            queued: std::sync::atomic::AtomicUsize::new(0),
            done: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Blocks until both the reservoir and the spacing rule admit a start.
    /// Spacing wins when both limits tighten simultaneously (§4.2).
    async fn admit(&self) {
        loop {
            let now = Instant::now();
            let mut state = self.spacing_state.lock().await;

            let spacing = self.config.spacing();
            let spacing_ready = state
                .last_start
                .map(|last| now.duration_since(last) >= spacing)
                .unwrap_or(true);

            if spacing_ready && state.bucket.try_take(now) {
                state.last_start = Some(now);
                return;
            }

            let wait_for_spacing = state
                .last_start
                .map(|last| spacing.saturating_sub(now.duration_since(last)))
                .unwrap_or(Duration::ZERO);
            let wait_for_tokens = if spacing_ready {
                state.bucket.time_until_refill(now)
            } else {
                Duration::ZERO
            };
            let wait = wait_for_spacing.max(wait_for_tokens).max(Duration::from_millis(1));
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }

    async fn record_completion(&self, event: CompletionEvent) {
        let mut ring = self.ring.lock().await;
        if ring.len() == RING_BUFFER_SIZE {
            ring.pop_front();
        }
        ring.push_back(event);
        self.done.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn live_counters(&self) -> LiveCounters {
        LiveCounters {
            running: self.config.max_concurrent - self.semaphore.available_permits(),
            queued: self.queued.load(std::sync::atomic::Ordering::Relaxed),
            done: self.done.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    async fn recent_completions(&self) -> Vec<CompletionEvent> {
        self.ring.lock().await.iter().cloned().collect()
    }
}

/// Per-call options to [`RateLimiterRegistry::schedule`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleOpts {
    /// When set (summarization traffic), routes through a separate
    /// `<provider>:summarize` limiter whose effective concurrency is
    /// `max(providerConcurrency, override)`.
    pub concurrency_override: Option<usize>,
}

/// Owns every provider's limiter. Providers are created lazily from
/// `base_config` the first time they're scheduled against.
pub struct RateLimiterRegistry {
    configs: RwLock<HashMap<String, ProviderLimiterConfig>>,
    limiters: RwLock<HashMap<String, Arc<ProviderLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_provider_config(&self, provider: &str, config: ProviderLimiterConfig) {
        self.configs
            .write()
            .await
            .insert(provider.to_string(), config);
    }

    async fn limiter_for(&self, key: &str, config: ProviderLimiterConfig) -> Arc<ProviderLimiter> {
        if let Some(existing) = self.limiters.read().await.get(key) {
            return existing.clone();
        }
        let mut limiters = self.limiters.write().await;
        limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ProviderLimiter::new(config)))
            .clone()
    }

    /// Runs `f` once both the concurrency and rate limits admit it. Errors
    /// from `f` propagate unchanged; the slot is always released.
    pub async fn schedule<F, Fut, T, E>(
        &self,
        provider: &str,
        model_id: &str,
        scenario_id: &str,
        opts: ScheduleOpts,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let base = self
            .configs
            .read()
            .await
            .get(provider)
            .copied()
            .unwrap_or(ProviderLimiterConfig {
                max_concurrent: 1,
                requests_per_minute: 60,
            });

        let (key, config): (String, ProviderLimiterConfig) = match opts.concurrency_override {
            Some(override_n) => (
                format!("{provider}:summarize"),
                ProviderLimiterConfig {
                    max_concurrent: base.max_concurrent.max(override_n),
                    requests_per_minute: base.requests_per_minute,
                },
            ),
            None => (provider.to_string(), base),
        };

        let limiter = self.limiter_for(&key, config).await;
        limiter.queued.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let permit = limiter.semaphore.clone().acquire_owned().await;
        limiter.queued.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        limiter.admit().await;
        tracing::debug!(provider = %key, %model_id, %scenario_id, "rate limiter admitted call");

        let started_at = chrono::Utc::now();
        let started_instant = Instant::now();
        let result = f().await;
        let duration_ms = Instant::now().duration_since(started_instant).as_millis() as u64;

        limiter
            .record_completion(CompletionEvent {
                model_id: model_id.to_string(),
                scenario_id: scenario_id.to_string(),
                success: result.is_ok(),
                started_at,
                duration_ms,
            })
            .await;

        drop(permit);
        result
    }

    pub async fn live_counters(&self, provider: &str) -> LiveCounters {
        match self.limiters.read().await.get(provider) {
            Some(limiter) => limiter.live_counters(),
            None => LiveCounters::default(),
        }
    }

    pub async fn recent_completions(&self, provider: &str) -> Vec<CompletionEvent> {
        match self.limiters.read().await.get(provider) {
            Some(limiter) => limiter.recent_completions().await,
            None => Vec::new(),
        }
    }

    /// Disconnects every existing limiter and rebuilds from current configs.
    /// In-flight work drains against the old `Arc`; queued work is dropped —
    /// the durable queue will redeliver it (§4.2).
    pub async fn reload_limiters(&self) {
        self.limiters.write().await.clear();
    }

    /// Narrower form of [`Self::reload_limiters`]: drops only the
    /// `<provider>:summarize` limiters, used when just the summarization
    /// concurrency knob changes.
    pub async fn clear_summarize_limiters(&self) {
        self.limiters
            .write()
            .await
            .retain(|key, _| !key.ends_with(":summarize"));
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
