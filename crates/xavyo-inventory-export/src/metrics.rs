//! Run counters for observability.
//!
//! Counters are shared by every worker of a run and carry no control
//! semantics; the snapshot is attached to the run result.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters updated by the fetcher, token provider and emitter.
#[derive(Debug, Default)]
pub struct ExportMetrics {
    requests: AtomicU64,
    throttled: AtomicU64,
    retries: AtomicU64,
    retry_delay_ms: AtomicU64,
    token_acquisitions: AtomicU64,
    auth_refreshes: AtomicU64,
    sink_sends: AtomicU64,
    sink_retries: AtomicU64,
}

impl ExportMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a 429/503 response.
    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one backoff sleep before a retried request.
    pub fn record_retry(&self, delay_ms: u64) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.retry_delay_ms.fetch_add(delay_ms, Ordering::Relaxed);
    }

    pub fn record_token_acquisition(&self) {
        self.token_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a refresh forced by a 401/403.
    pub fn record_auth_refresh(&self) {
        self.auth_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_send(&self) {
        self.sink_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_retry(&self) {
        self.sink_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            retry_delay_ms: self.retry_delay_ms.load(Ordering::Relaxed),
            token_acquisitions: self.token_acquisitions.load(Ordering::Relaxed),
            auth_refreshes: self.auth_refreshes.load(Ordering::Relaxed),
            sink_sends: self.sink_sends.load(Ordering::Relaxed),
            sink_retries: self.sink_retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ExportMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub throttled: u64,
    pub retries: u64,
    pub retry_delay_ms: u64,
    pub token_acquisitions: u64,
    pub auth_refreshes: u64,
    pub sink_sends: u64,
    pub sink_retries: u64,
}

impl MetricsSnapshot {
    /// Average backoff delay in milliseconds.
    #[must_use]
    pub fn average_retry_delay_ms(&self) -> f64 {
        if self.retries == 0 {
            0.0
        } else {
            self.retry_delay_ms as f64 / self.retries as f64
        }
    }

    /// Share of requests that were throttled.
    #[must_use]
    pub fn throttle_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.throttled as f64 / self.requests as f64
        }
    }
}
