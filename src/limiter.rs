//! Keyed token-bucket registry used by the throttling stage.
//!
//! One bucket per client identity (`"{ip}:{username}"`), created lazily on
//! the first request and owned exclusively by this registry. All map access
//! goes through a single lock so that refill-and-consume is one critical
//! section; two concurrent requests from the same identity can never both
//! win the last token.
//!
//! Idle entries are removed by a periodic sweep running on its own task; an
//! identity that is not currently throttled simply gets a fresh full bucket
//! on its next request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Historical defaults for deployments that do not configure the limiter.
pub const DEFAULT_TOKEN_RATE: u32 = 50;
pub const DEFAULT_BURST_SIZE: u32 = 150;
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    /// Tokens per second.
    rate: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn full(capacity: u32, rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            rate,
            tokens: capacity as f64,
            refilled_at: now,
        }
    }

    /// tokens = min(capacity, tokens + elapsed * rate)
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity as f64);
        self.refilled_at = now;
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Token count as of `now`, without mutating the bucket.
    fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        (self.tokens + elapsed * self.rate).min(self.capacity as f64)
    }
}

/// Concurrency-safe identity → bucket registry.
pub struct RateLimiterStore {
    rate: f64,
    burst: u32,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiterStore {
    pub fn new(token_rate: u32, burst_size: u32) -> Self {
        Self {
            rate: token_rate as f64,
            burst: burst_size,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Refill the identity's bucket and try to consume one token.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    pub fn allow_at(&self, identity: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(identity.to_string())
            .or_insert_with(|| TokenBucket::full(self.burst, self.rate, now));
        bucket.try_consume(now)
    }

    /// Current token count for a tracked identity.
    pub fn tokens(&self, identity: &str) -> Option<f64> {
        self.tokens_at(identity, Instant::now())
    }

    pub fn tokens_at(&self, identity: &str, now: Instant) -> Option<f64> {
        let buckets = self.buckets.lock();
        buckets.get(identity).map(|b| b.available(now))
    }

    /// Drop an identity's throttling history. Called after a successful
    /// round trip so that the next request starts with a full bucket.
    pub fn forget(&self, identity: &str) {
        self.buckets.lock().remove(identity);
    }

    /// Remove every identity whose bucket currently holds at least one
    /// token. Identities that are being throttled keep their state; a
    /// removed identity simply gets a fresh bucket on its next request.
    pub fn evict_idle(&self) {
        self.evict_idle_at(Instant::now());
    }

    pub fn evict_idle_at(&self, now: Instant) {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.available(now) < 1.0);
        debug!(
            evicted = before - buckets.len(),
            tracked = buckets.len(),
            "swept idle rate-limiter entries"
        );
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Periodic idle-eviction sweep. Stops promptly when `stop` changes or its
/// sender is dropped.
pub fn spawn_eviction_task(
    store: Arc<RateLimiterStore>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick of a tokio interval completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("stopping rate-limiter eviction task");
                    return;
                }
                _ = ticker.tick() => {
                    debug!("running rate-limiter eviction sweep");
                    store.evict_idle();
                }
            }
        }
    })
}
