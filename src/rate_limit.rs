use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Duration;
use tracing::debug;

pub const WINDOW_SECONDS: i64 = 60;
pub const SWEEP_INTERVAL_SECONDS: u64 = 5 * 60;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Metadata,
    Download,
    Health,
}

impl Tier {
    fn label(self) -> &'static str {
        match self {
            Tier::Metadata => "metadata",
            Tier::Download => "download",
            Tier::Health => "health",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub metadata_per_window: u32,
    pub download_per_window: u32,
    pub health_per_window: u32,
    pub window_seconds: i64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            metadata_per_window: 30,
            download_per_window: 5,
            health_per_window: 120,
            window_seconds: WINDOW_SECONDS,
        }
    }
}

impl RateLimits {
    fn budget(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Metadata => self.metadata_per_window,
            Tier::Download => self.download_per_window,
            Tier::Health => self.health_per_window,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { retry_after_seconds: u64 },
}

#[derive(Debug)]
struct Bucket {
    window_start: DateTime<Utc>,
    count: u32,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, Tier), Bucket>>,
    limits: RateLimits,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limits,
            clock,
        }
    }

    // Read-check-increment under one guard so concurrent bursts from the
    // same client cannot slip past the budget.
    pub fn check(&self, client_key: &str, tier: Tier) -> Decision {
        let now = self.clock.now();
        let window = ChronoDuration::seconds(self.limits.window_seconds);
        let budget = self.limits.budget(tier);

        let mut buckets = self.buckets.lock().expect("rate limit map poisoned");
        let bucket = buckets
            .entry((client_key.to_string(), tier))
            .or_insert(Bucket {
                window_start: now,
                count: 0,
            });

        if now - bucket.window_start >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= budget {
            let reset_at = bucket.window_start + window;
            let retry_after_seconds = (reset_at - now).num_seconds().max(1) as u64;
            debug!(
                "rate limit denied tier={} client={} retry_after={}s",
                tier.label(),
                client_key,
                retry_after_seconds
            );
            return Decision::Denied {
                retry_after_seconds,
            };
        }

        bucket.count += 1;
        Decision::Allowed
    }

    pub fn sweep(&self) {
        let now = self.clock.now();
        let window = ChronoDuration::seconds(self.limits.window_seconds);

        let mut buckets = self.buckets.lock().expect("rate limit map poisoned");
        let before = buckets.len();
        buckets.retain(|_, bucket| now - bucket.window_start < window);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!("rate limit sweep removed {removed} stale bucket(s)");
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("rate limit map poisoned").len()
    }
}

pub fn spawn_sweeper(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECONDS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            limiter.sweep();
        }
    });
}
