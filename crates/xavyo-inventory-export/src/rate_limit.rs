//! Request pacing and retry backoff.
//!
//! [`RateBudget`] keeps one token bucket per lane so management-plane,
//! directory and sink traffic are paced independently. [`BackoffPolicy`]
//! computes the delay before a retried request.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::Audience;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for exponential backoff in milliseconds (default: 1000ms).
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 60000ms).
    pub max_delay_ms: u64,
    /// Jitter factor as a fraction of delay (default: 0.25 = 25%).
    pub jitter_factor: f64,
    /// Retries after the first attempt (default: 5).
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_factor: 0.25,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Short delays for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 50,
            jitter_factor: 0.25,
            max_retries: 3,
        }
    }

    /// Validates the policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be > 0".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("max_delay_ms must be >= base_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor must be in range [0.0, 1.0]".to_string());
        }
        Ok(())
    }

    /// Parses a `Retry-After` header given in seconds.
    ///
    /// HTTP-date values are not supported and yield `None`.
    #[must_use]
    pub fn parse_retry_after(header_value: &str) -> Option<u64> {
        header_value.trim().parse::<u64>().ok()
    }

    /// `base * 2^attempt`, capped at `max_delay_ms`.
    #[must_use]
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;
        let delay_ms = (base * 2_f64.powi(attempt.min(31) as i32)).min(max);
        Duration::from_millis(delay_ms as u64)
    }

    /// Adds up to `jitter_factor * delay` of random jitter.
    #[must_use]
    pub fn add_jitter(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as f64;
        let jitter_range = delay_ms * self.jitter_factor;
        if jitter_range <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_range);
        Duration::from_millis((delay_ms + jitter) as u64)
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// A server-supplied `Retry-After` takes precedence over the exponential
    /// schedule but is still capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let delay = match retry_after_secs {
            Some(secs) => {
                let requested = Duration::from_secs(secs);
                let cap = Duration::from_millis(self.max_delay_ms);
                if requested > cap {
                    warn!(
                        retry_after_secs = secs,
                        cap_ms = self.max_delay_ms,
                        "Retry-After exceeds max delay, capping"
                    );
                    cap
                } else {
                    requested
                }
            }
            None => self.calculate_backoff_delay(attempt),
        };
        self.add_jitter(delay)
    }
}

/// Independent pacing lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    ResourceManager,
    Graph,
    Sink,
}

impl Lane {
    fn index(self) -> usize {
        match self {
            Self::ResourceManager => 0,
            Self::Graph => 1,
            Self::Sink => 2,
        }
    }
}

impl From<Audience> for Lane {
    fn from(audience: Audience) -> Self {
        match audience {
            Audience::ResourceManager => Self::ResourceManager,
            Audience::Graph => Self::Graph,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ResourceManager => "resource_manager",
            Self::Graph => "graph",
            Self::Sink => "sink",
        })
    }
}

/// Token bucket with a burst of one, so requests are spaced evenly.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(tokens_per_second: u32) -> Self {
        Self {
            tokens: 1.0,
            max_tokens: 1.0,
            refill_rate: f64::from(tokens_per_second),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Takes a token, or returns how long until one is available.
    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait_secs = (1.0 - self.tokens) / self.refill_rate;
            Err(Duration::from_secs_f64(wait_secs))
        }
    }
}

/// Run-wide request budget shared by every worker.
#[derive(Debug)]
pub struct RateBudget {
    lanes: Option<[Mutex<TokenBucket>; 3]>,
}

impl RateBudget {
    /// Creates a budget allowing `requests_per_second` per lane; 0 disables pacing.
    #[must_use]
    pub fn new(requests_per_second: u32) -> Self {
        let lanes = (requests_per_second > 0).then(|| {
            [
                Mutex::new(TokenBucket::new(requests_per_second)),
                Mutex::new(TokenBucket::new(requests_per_second)),
                Mutex::new(TokenBucket::new(requests_per_second)),
            ]
        });
        Self { lanes }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self { lanes: None }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lanes.is_some()
    }

    /// Waits until the lane has capacity for one request.
    pub async fn acquire(&self, lane: Lane) {
        let Some(lanes) = &self.lanes else {
            return;
        };
        let bucket = &lanes[lane.index()];
        loop {
            let wait = {
                let mut bucket = bucket.lock().await;
                match bucket.try_acquire() {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            debug!(
                lane = %lane,
                wait_ms = wait.as_millis() as u64,
                "Rate budget exhausted, waiting"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
