use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deskline_core::session::fingerprint;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Fixed-window request limiter keyed by endpoint and user
#[derive(Clone)]
pub struct EndpointRateLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
    sync_limit: u32,
    pull_limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Clone, Copy)]
pub enum ProtectedEndpoint {
    Sync,
    Pull,
    /// Opening a realtime stream; shares the pull budget
    Realtime,
}

#[derive(Default)]
struct EndpointCounters {
    allowed: AtomicU64,
    limited: AtomicU64,
}

#[derive(Default)]
struct RateLimitMetrics {
    sync: EndpointCounters,
    pull: EndpointCounters,
    realtime: EndpointCounters,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub sync_allowed: u64,
    pub sync_limited: u64,
    pub pull_allowed: u64,
    pub pull_limited: u64,
    pub realtime_allowed: u64,
    pub realtime_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.sync_rate_limit_per_window,
            config.pull_rate_limit_per_window,
        )
    }

    fn new(window: Duration, sync_limit: u32, pull_limit: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window,
            sync_limit,
            pull_limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, endpoint: ProtectedEndpoint, user_id: &str) -> Result<(), AppError> {
        let limit = match endpoint {
            ProtectedEndpoint::Sync => self.sync_limit,
            ProtectedEndpoint::Pull | ProtectedEndpoint::Realtime => self.pull_limit,
        };

        let key = format!("{}:{user_id}", endpoint.label());
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let entry = guard.entry(key).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        let counters = self.counters(endpoint);
        if entry.count >= limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs()
                .max(1);
            counters.limited.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                endpoint = endpoint.label(),
                user = %fingerprint(user_id),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                format!("Rate limit exceeded for {}", endpoint.label()),
                retry_after_secs,
            ));
        }

        entry.count += 1;
        counters.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RateLimitMetricsSnapshot {
            sync_allowed: load(&self.metrics.sync.allowed),
            sync_limited: load(&self.metrics.sync.limited),
            pull_allowed: load(&self.metrics.pull.allowed),
            pull_limited: load(&self.metrics.pull.limited),
            realtime_allowed: load(&self.metrics.realtime.allowed),
            realtime_limited: load(&self.metrics.realtime.limited),
        }
    }

    fn counters(&self, endpoint: ProtectedEndpoint) -> &EndpointCounters {
        match endpoint {
            ProtectedEndpoint::Sync => &self.metrics.sync,
            ProtectedEndpoint::Pull => &self.metrics.pull,
            ProtectedEndpoint::Realtime => &self.metrics.realtime,
        }
    }
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Pull => "pull",
            Self::Realtime => "realtime",
        }
    }
}
