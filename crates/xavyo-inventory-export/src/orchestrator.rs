//! Run orchestration.
//!
//! A run acquires credentials for both audiences, lists the root
//! subscriptions and walks each one on a bounded pool of workers. Workers
//! forward nodes over a channel to a single consumer that normalizes them
//! and owns the emitter, so batches never interleave.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::{Audience, ClientCredentialsProvider, IdentityProvider, TokenProvider};
use crate::config::{ExportConfig, ExportCredentials};
use crate::emitter::BatchingEmitter;
use crate::error::ExportResult;
use crate::fetcher::PagedFetcher;
use crate::metrics::ExportMetrics;
use crate::model::HierarchyNode;
use crate::normalize::{normalize, Normalized};
use crate::rate_limit::RateBudget;
use crate::result::{
    ErrorScope, RunError, RunErrorKind, RunResult, SubscriptionOutcome, SubscriptionStatus,
};
use crate::sink::{EventSink, HttpEventSink};
use crate::walker::{HierarchyWalker, WalkMessage};

const CHANNEL_CAPACITY: usize = 256;

/// Drives export runs for one tenant.
pub struct RunOrchestrator {
    config: ExportConfig,
    identity: Arc<dyn IdentityProvider>,
    sink: Arc<dyn EventSink>,
}

impl RunOrchestrator {
    #[must_use]
    pub fn new(
        config: ExportConfig,
        identity: Arc<dyn IdentityProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            identity,
            sink,
        }
    }

    /// Builds an orchestrator using the client-credentials flow and the HTTP sink.
    pub fn from_config(config: ExportConfig, credentials: ExportCredentials) -> ExportResult<Self> {
        config.validate()?;
        let identity = ClientCredentialsProvider::new(
            credentials,
            config.endpoints(),
            config.tenant_id.clone(),
            config.request_timeout(),
        )?;
        let sink = HttpEventSink::from_config(&config)?;
        Ok(Self::new(config, Arc::new(identity), Arc::new(sink)))
    }

    #[must_use]
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Runs one full export pass.
    ///
    /// Returns `Err` only when the configuration is invalid or a credential
    /// for either audience cannot be obtained at startup. Every later failure
    /// is recorded in the result. Cancelling `cancel` stops new requests and
    /// new subscription workers; buffered events are still flushed. The
    /// result is marked cancelled only when cancellation cut work short.
    pub async fn run(&self, cancel: CancellationToken) -> ExportResult<RunResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("export_run", run_id = %run_id, tenant_id = %self.config.tenant_id);
        self.execute(run_id, cancel).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid, cancel: CancellationToken) -> ExportResult<RunResult> {
        let config = &self.config;
        config.validate()?;
        let started_at = Utc::now();
        info!("Export run started");

        let metrics = Arc::new(ExportMetrics::new());
        let budget = Arc::new(RateBudget::new(config.rate_limit_per_second));
        let backoff = config.backoff_policy();

        let tokens = Arc::new(TokenProvider::new(
            Arc::clone(&self.identity),
            config.token_safety_margin(),
            backoff.clone(),
            Arc::clone(&metrics),
        ));
        for audience in Audience::ALL {
            if let Err(e) = tokens.get_token(audience).await {
                error!(audience = %audience, error = %e, "Startup authentication failed");
                return Err(e);
            }
        }

        let fetcher = PagedFetcher::new(
            tokens,
            Arc::clone(&budget),
            backoff.clone(),
            Arc::clone(&metrics),
            config.request_timeout(),
        )?
        .with_cancellation(cancel.clone());
        let fetcher = Arc::new(fetcher);
        let endpoints = config.endpoints();
        let walker = HierarchyWalker::new(
            fetcher,
            &endpoints.management,
            &endpoints.graph,
            config.api_versions.clone(),
            config.page_size,
            config.resolve_principals,
            cancel.clone(),
        );

        let mut errors = Vec::new();
        let mut subscriptions = Vec::new();

        let listing = walker.list_subscriptions(&config.subscription_scope).await;
        errors.extend(listing.errors);
        let mut cancelled = listing.cancelled;
        subscriptions.extend(
            listing
                .unavailable
                .into_iter()
                .map(SubscriptionOutcome::skipped),
        );

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let dispatcher = tokio::spawn(
            dispatch(
                walker,
                listing.subscriptions,
                config.max_concurrent_subscriptions,
                cancel.clone(),
                tx,
            )
            .in_current_span(),
        );

        let mut emitter = BatchingEmitter::new(
            Arc::clone(&self.sink),
            config.batch_max_bytes,
            config.batch_max_count,
            backoff,
            budget,
            Arc::clone(&metrics),
        );
        let mut nodes_visited = 0u64;
        let mut fallback_events = 0u64;

        while let Some(message) = rx.recv().await {
            match message {
                WalkMessage::Node(node) => {
                    nodes_visited += 1;
                    match normalize(&node) {
                        Ok(Normalized { event, fallback }) => {
                            if fallback {
                                debug!(
                                    source_id = %event.source_id,
                                    "Unrecognized record shape, using fallback schema"
                                );
                                fallback_events += 1;
                            }
                            emitter.emit(event).await;
                        }
                        Err(e) => {
                            warn!(kind = %node.kind, error = %e, "Node failed normalization");
                            errors.push(RunError::event(node.id.clone(), &e));
                        }
                    }
                }
                WalkMessage::Error(err) => errors.push(err),
            }
        }

        emitter.flush().await;

        match dispatcher.await {
            Ok(report) => {
                cancelled |= report.interrupted;
                subscriptions.extend(report.outcomes);
            }
            Err(e) => {
                error!(error = %e, "Subscription dispatcher failed");
                errors.push(RunError {
                    kind: RunErrorKind::Server,
                    scope: ErrorScope::Run,
                    source_id: None,
                    message: format!("Subscription dispatcher failed: {e}"),
                });
            }
        }

        errors.extend(emitter.take_errors());
        let stats = emitter.stats();

        let result = RunResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            nodes_visited,
            events_emitted: stats.events_emitted,
            batches_failed: stats.batches_failed,
            fallback_events,
            cancelled,
            subscriptions,
            errors,
            metrics: metrics.snapshot(),
        };

        info!(
            nodes_visited = result.nodes_visited,
            events_emitted = result.events_emitted,
            batches_failed = result.batches_failed,
            errors = result.errors.len(),
            cancelled,
            "Export run finished"
        );
        Ok(result)
    }
}

/// Outcomes of every dispatched or skipped subscription.
struct DispatchReport {
    outcomes: Vec<SubscriptionOutcome>,
    /// Cancellation skipped a subscription or cut a walk short.
    interrupted: bool,
}

/// Starts one worker per subscription, at most `max_concurrent` at a time.
///
/// Once `cancel` fires no further worker is started and the remaining
/// subscriptions are reported as skipped.
async fn dispatch(
    walker: HierarchyWalker,
    subscriptions: Vec<HierarchyNode>,
    max_concurrent: usize,
    cancel: CancellationToken,
    tx: mpsc::Sender<WalkMessage>,
) -> DispatchReport {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut workers = Vec::new();
    let mut skipped = Vec::new();
    let mut pending = subscriptions.into_iter();

    while let Some(subscription) = pending.next() {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            skipped.push(subscription_label(&subscription));
            skipped.extend(pending.by_ref().map(|s| subscription_label(&s)));
            info!(skipped = skipped.len(), "Cancelled, not starting remaining subscriptions");
            break;
        };

        let label = subscription_label(&subscription);
        let walker = walker.clone();
        let tx = tx.clone();
        let handle = tokio::spawn(
            async move {
                let _permit = permit;
                walker.walk_subscription(subscription, &tx).await
            }
            .in_current_span(),
        );
        workers.push((label, handle));
    }
    drop(tx);

    let mut outcomes = Vec::with_capacity(workers.len() + skipped.len());
    for (label, handle) in workers {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                error!(subscription_id = %label, error = %e, "Subscription worker failed");
                outcomes.push(SubscriptionOutcome {
                    subscription_id: label,
                    status: SubscriptionStatus::Failed,
                    nodes: 0,
                });
            }
        }
    }
    let interrupted = !skipped.is_empty()
        || outcomes
            .iter()
            .any(|o| o.status == SubscriptionStatus::Cancelled);
    outcomes.extend(skipped.into_iter().map(SubscriptionOutcome::skipped));
    DispatchReport {
        outcomes,
        interrupted,
    }
}

fn subscription_label(subscription: &HierarchyNode) -> String {
    subscription
        .id
        .clone()
        .or_else(|| subscription.subscription_guid())
        .unwrap_or_default()
}
