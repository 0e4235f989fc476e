//! Per-provider rate limiting (§4.2): a semaphore bounds concurrency, a
//! token bucket bounds the rolling-minute start rate, and a minimum-spacing
//! rule keeps bursts from draining the bucket in one instant.

mod bucket;
mod registry;

pub use registry::{ProviderLimiterConfig, RateLimiterRegistry, ScheduleOpts};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One completed (or failed) call, kept in a provider's ring buffer of the
/// last 10 completions for live metrics / ETA computation.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    pub model_id: String,
    pub scenario_id: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Live counters exposed per provider limiter.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LiveCounters {
    pub running: usize,
    pub queued: usize,
    pub done: usize,
}
