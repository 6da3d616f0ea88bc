//! Run summary returned to the trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EventError, ExportError};
use crate::metrics::MetricsSnapshot;

/// Run-level error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunErrorKind {
    Auth,
    Throttled,
    Client,
    Server,
    Event,
    SinkDelivery,
}

/// Where an error was caught.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "camelCase")]
pub enum ErrorScope {
    Run,
    Subscription(String),
    Listing(String),
    Node(String),
    Batch(u64),
}

/// One recorded failure. A run accumulates these instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub kind: RunErrorKind,
    pub scope: ErrorScope,
    pub source_id: Option<String>,
    pub message: String,
}

impl RunError {
    #[must_use]
    pub fn fetch(scope: ErrorScope, error: &ExportError) -> Self {
        Self {
            kind: error.kind(),
            scope,
            source_id: None,
            message: error.to_string(),
        }
    }

    #[must_use]
    pub fn event(source_id: Option<String>, error: &EventError) -> Self {
        let scope = source_id
            .clone()
            .map_or(ErrorScope::Run, ErrorScope::Node);
        Self {
            kind: RunErrorKind::Event,
            scope,
            source_id,
            message: error.to_string(),
        }
    }

    /// An event too large to fit in any batch.
    #[must_use]
    pub fn oversized(source_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: RunErrorKind::SinkDelivery,
            scope: ErrorScope::Node(source_id.clone()),
            source_id: Some(source_id),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn sink_delivery(batch: u64, source_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: RunErrorKind::SinkDelivery,
            scope: ErrorScope::Batch(batch),
            source_id: Some(source_id),
            message: message.into(),
        }
    }
}

/// Terminal state of one subscription traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionStatus {
    /// Every listing was exhausted without a fetch error.
    Done,
    /// At least one listing failed; siblings were still attempted.
    Failed,
    /// Cancellation drained the worklist before it was exhausted.
    Cancelled,
    /// No worker was started for this subscription.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOutcome {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub nodes: u64,
}

impl SubscriptionOutcome {
    #[must_use]
    pub fn skipped(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            status: SubscriptionStatus::Skipped,
            nodes: 0,
        }
    }
}

/// Summary of one export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes_visited: u64,
    pub events_emitted: u64,
    pub batches_failed: u64,
    pub fallback_events: u64,
    pub cancelled: bool,
    pub subscriptions: Vec<SubscriptionOutcome>,
    pub errors: Vec<RunError>,
    pub metrics: MetricsSnapshot,
}

impl RunResult {
    /// Errors of the given kind.
    pub fn errors_of(&self, kind: RunErrorKind) -> impl Iterator<Item = &RunError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    /// True when nothing was recorded as failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.batches_failed == 0
    }
}
