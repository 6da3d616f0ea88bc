//! Size- and count-bounded batching of export events.
//!
//! Events are serialized on arrival and buffered in order. A batch is sent
//! when the next event would push it past either ceiling, when it reaches
//! the count ceiling, or on an explicit [`BatchingEmitter::flush`].

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::EventError;
use crate::metrics::ExportMetrics;
use crate::model::ExportEvent;
use crate::rate_limit::{BackoffPolicy, Lane, RateBudget};
use crate::result::RunError;
use crate::sink::EventSink;

/// Result of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    Sent { events: usize },
    /// Every attempt failed; the events were recorded as errors.
    Dropped { events: usize },
}

/// Running delivery totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitterStats {
    pub events_emitted: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
}

pub struct BatchingEmitter {
    sink: Arc<dyn EventSink>,
    max_bytes: usize,
    max_count: usize,
    backoff: BackoffPolicy,
    budget: Arc<RateBudget>,
    metrics: Arc<ExportMetrics>,
    buffer: Vec<(String, Vec<u8>)>,
    buffered_bytes: usize,
    next_batch: u64,
    stats: EmitterStats,
    errors: Vec<RunError>,
}

impl BatchingEmitter {
    #[must_use]
    pub fn new(
        sink: Arc<dyn EventSink>,
        max_bytes: usize,
        max_count: usize,
        backoff: BackoffPolicy,
        budget: Arc<RateBudget>,
        metrics: Arc<ExportMetrics>,
    ) -> Self {
        Self {
            sink,
            max_bytes,
            max_count: max_count.max(1),
            backoff,
            budget,
            metrics,
            buffer: Vec::new(),
            buffered_bytes: 0,
            next_batch: 1,
            stats: EmitterStats::default(),
            errors: Vec::new(),
        }
    }

    /// Buffers an event, sending the current batch first if it would overflow.
    pub async fn emit(&mut self, event: ExportEvent) {
        let line = match event.to_ndjson_line() {
            Ok(line) => line,
            Err(e) => {
                let err = EventError::Serialization {
                    source_id: event.source_id.clone(),
                    cause: e.to_string(),
                };
                self.errors.push(RunError::event(Some(event.source_id), &err));
                return;
            }
        };

        if line.len() > self.max_bytes {
            error!(
                source_id = %event.source_id,
                size = line.len(),
                max = self.max_bytes,
                "Event exceeds the batch size limit, not sent"
            );
            self.errors.push(RunError::oversized(
                event.source_id,
                format!(
                    "Message too large: {} bytes (max {})",
                    line.len(),
                    self.max_bytes
                ),
            ));
            return;
        }

        if !self.buffer.is_empty() && self.buffered_bytes + line.len() > self.max_bytes {
            self.flush().await;
        }

        self.buffered_bytes += line.len();
        self.buffer.push((event.source_id, line));

        if self.buffer.len() >= self.max_count {
            self.flush().await;
        }
    }

    /// Sends whatever is buffered as one batch.
    ///
    /// Failed sends are retried with backoff. When retries run out the batch
    /// is dropped as a unit and one error per contained event is recorded.
    pub async fn flush(&mut self) -> FlushOutcome {
        if self.buffer.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch_no = self.next_batch;
        self.next_batch += 1;
        let entries = std::mem::take(&mut self.buffer);
        let mut body = Vec::with_capacity(self.buffered_bytes);
        self.buffered_bytes = 0;
        for (_, line) in &entries {
            body.extend_from_slice(line);
        }
        let events = entries.len();

        let mut attempt = 0u32;
        loop {
            self.budget.acquire(Lane::Sink).await;
            self.metrics.record_sink_send();

            match self.sink.send_batch(&body).await {
                Ok(ack) => {
                    debug!(
                        batch = batch_no,
                        events,
                        bytes = body.len(),
                        latency_ms = ack.latency_ms,
                        "Batch delivered"
                    );
                    self.stats.events_emitted += events as u64;
                    self.stats.batches_sent += 1;
                    return FlushOutcome::Sent { events };
                }
                Err(e) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for(attempt, None);
                    warn!(
                        batch = batch_no,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch delivery failed, retrying"
                    );
                    self.metrics.record_sink_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        batch = batch_no,
                        events,
                        attempts = attempt + 1,
                        error = %e,
                        "Batch dropped after exhausting retries"
                    );
                    self.stats.batches_failed += 1;
                    let message = format!(
                        "Batch {batch_no} dropped after {} attempts: {e}",
                        attempt + 1
                    );
                    self.errors.extend(entries.into_iter().map(|(source_id, _)| {
                        RunError::sink_delivery(batch_no, source_id, &message)
                    }));
                    return FlushOutcome::Dropped { events };
                }
            }
        }
    }

    /// Number of events waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn stats(&self) -> EmitterStats {
        self.stats
    }

    /// Drains the per-event errors recorded so far.
    pub fn take_errors(&mut self) -> Vec<RunError> {
        std::mem::take(&mut self.errors)
    }
}
