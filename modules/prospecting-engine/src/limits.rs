//! Per-provider token-bucket admission control.
//!
//! One bucket per provider key. Waiters queue on the bucket's async mutex,
//! which is fair, so admission is FIFO per key under contention. The bucket
//! state only moves while the mutex is held.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use prospecting_common::ProviderError;

pub const KEY_MAPS_SEARCH: &str = "maps.textsearch";
pub const KEY_MAPS_DETAILS: &str = "maps.details";
pub const KEY_LLM_TEXT: &str = "llm.text";
pub const KEY_LLM_VISION: &str = "llm.vision";
pub const KEY_BROWSER: &str = "browser";
pub const KEY_SEARCH: &str = "search";

/// Parameters for one bucket. Read once at process start.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
    pub max_wait: Duration,
}

impl BucketConfig {
    pub fn per_second(refill_per_second: f64) -> Self {
        Self {
            capacity: (refill_per_second * 2.0).max(1.0),
            refill_per_second,
            max_wait: Duration::from_secs(60),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct Bucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping while the bucket refills. The mutex guard is
    /// held across the sleep so later arrivals wait their turn.
    async fn take(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens =
                (state.tokens + elapsed * self.config.refill_per_second).min(self.config.capacity);
            state.last_refill = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }

            let deficit = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.config.refill_per_second);
            tokio::time::sleep(wait).await;
        }
    }
}

pub struct RateLimiter {
    buckets: HashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(buckets: impl IntoIterator<Item = (String, BucketConfig)>) -> Self {
        Self {
            buckets: buckets
                .into_iter()
                .map(|(key, config)| (key, Bucket::new(config)))
                .collect(),
        }
    }

    /// Standard bucket set keyed by the provider call sites.
    pub fn standard(
        maps_per_sec: f64,
        llm_per_sec: f64,
        vision_per_sec: f64,
        browser_per_sec: f64,
    ) -> Self {
        Self::new([
            (KEY_MAPS_SEARCH.to_string(), BucketConfig::per_second(maps_per_sec)),
            (KEY_MAPS_DETAILS.to_string(), BucketConfig::per_second(maps_per_sec)),
            (KEY_LLM_TEXT.to_string(), BucketConfig::per_second(llm_per_sec)),
            (KEY_LLM_VISION.to_string(), BucketConfig::per_second(vision_per_sec)),
            (KEY_BROWSER.to_string(), BucketConfig::per_second(browser_per_sec)),
            (KEY_SEARCH.to_string(), BucketConfig::per_second(maps_per_sec)),
        ])
    }

    /// Block until a token for `key` is available, the configured max wait
    /// elapses, or the run is cancelled.
    pub async fn acquire(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let bucket = self.buckets.get(key).ok_or_else(|| {
            ProviderError::Permanent(format!("unknown rate limit key: {key}"))
        })?;

        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = tokio::time::timeout(bucket.config.max_wait, bucket.take()) => {
                result.map_err(|_| {
                    warn!(key, "Rate limit wait exceeded max_wait");
                    ProviderError::RateLimitTimeout(key.to_string())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(capacity: f64, refill: f64, max_wait: Duration) -> RateLimiter {
        RateLimiter::new([(
            "test".to_string(),
            BucketConfig {
                capacity,
                refill_per_second: refill,
                max_wait,
            },
        )])
    }

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_then_waits() {
        let rl = limiter(2.0, 1.0, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        rl.acquire("test", &cancel).await.unwrap();
        rl.acquire("test", &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));

        // Third token needs a full refill second.
        rl.acquire("test", &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_elapses_into_timeout() {
        let rl = limiter(1.0, 0.1, Duration::from_secs(2));
        let cancel = CancellationToken::new();

        rl.acquire("test", &cancel).await.unwrap();
        let err = rl.acquire("test", &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimitTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_wait() {
        let rl = Arc::new(limiter(1.0, 0.01, Duration::from_secs(600)));
        let cancel = CancellationToken::new();

        rl.acquire("test", &cancel).await.unwrap();

        let rl2 = rl.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { rl2.acquire("test", &cancel2).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn admission_is_fifo_under_contention() {
        let rl = Arc::new(limiter(1.0, 1.0, Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        rl.acquire("test", &cancel).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3u32 {
            let rl = rl.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                rl.acquire("test", &cancel).await.unwrap();
                order.lock().await.push(i);
            }));
            // Let task i reach the bucket queue before spawning i+1.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unknown_key_is_permanent() {
        let rl = limiter(1.0, 1.0, Duration::from_secs(1));
        let err = rl
            .acquire("nope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }
}
