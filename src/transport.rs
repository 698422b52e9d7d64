//! Best-effort outbound delivery of metrics snapshots
//!
//! Sends are retried with bounded exponential backoff but never block event
//! ingestion: the backoff is a deadline the next flush cycle checks, not a
//! sleep. A payload that fails is requeued at the front for the next cycle;
//! after the attempt budget is exhausted it is surfaced as a failure and
//! preserved at the back of the queue for a later flush.

use crate::config::RetryConfig;
use crate::error::TrackError;
use crate::events::TransportFailure;
use crate::metrics::AggregateMetrics;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::io::Write;

/// Destination for exported snapshots, provided by the embedding application
pub trait MetricsSink {
    fn send(&mut self, snapshot: &AggregateMetrics) -> Result<(), TrackError>;
}

struct PendingExport {
    snapshot: AggregateMetrics,
    attempts: u32,
}

/// Outbound queue with deadline-gated retry
pub struct RetrySender {
    sink: Box<dyn MetricsSink>,
    policy: RetryConfig,
    queue: VecDeque<PendingExport>,
    not_before: Option<DateTime<Utc>>,
}

impl RetrySender {
    pub fn new(sink: Box<dyn MetricsSink>, policy: RetryConfig) -> Result<Self, TrackError> {
        policy.validate()?;
        Ok(Self {
            sink,
            policy,
            queue: VecDeque::new(),
            not_before: None,
        })
    }

    /// Queue a snapshot for the next flush cycle
    pub fn enqueue(&mut self, snapshot: AggregateMetrics) {
        self.queue.push_back(PendingExport {
            snapshot,
            attempts: 0,
        });
    }

    /// Try to drain the queue. Returns failures whose attempt budget was
    /// exhausted this cycle; their payloads stay queued at the back.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<TransportFailure> {
        let mut failures = Vec::new();

        if self.not_before.is_some_and(|deadline| now < deadline) {
            return failures;
        }
        self.not_before = None;

        loop {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            match self.sink.send(&front.snapshot) {
                Ok(()) => {
                    self.queue.pop_front();
                }
                Err(error) => {
                    front.attempts += 1;
                    let attempts = front.attempts;
                    let delay = self.backoff_delay_ms(attempts);

                    if attempts >= self.policy.max_attempts {
                        log::error!(
                            "metrics export failed after {} attempts: {}",
                            attempts,
                            error
                        );
                        if let Some(mut spent) = self.queue.pop_front() {
                            spent.attempts = 0;
                            self.queue.push_back(spent);
                        }
                        failures.push(TransportFailure {
                            error: error.to_string(),
                            attempts,
                            pending: self.queue.len(),
                            timestamp: now,
                        });
                    } else {
                        log::warn!(
                            "metrics export attempt {} failed, retrying in {}ms: {}",
                            attempts,
                            delay,
                            error
                        );
                    }

                    self.not_before = Some(now + Duration::milliseconds(delay));
                    break;
                }
            }
        }

        failures
    }

    fn backoff_delay_ms(&self, attempts: u32) -> i64 {
        let exponent = attempts.saturating_sub(1).min(16);
        let delay =
            self.policy.base_delay_ms as f64 * self.policy.multiplier.powi(exponent as i32);
        delay as i64
    }

    /// Snapshots waiting for delivery
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Sink that collects snapshots in memory
#[derive(Default)]
pub struct CollectorSink {
    pub snapshots: Vec<AggregateMetrics>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSink for CollectorSink {
    fn send(&mut self, snapshot: &AggregateMetrics) -> Result<(), TrackError> {
        self.snapshots.push(snapshot.clone());
        Ok(())
    }
}

/// Sink that writes one JSON document per snapshot, newline-delimited
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> MetricsSink for JsonLinesSink<W> {
    fn send(&mut self, snapshot: &AggregateMetrics) -> Result<(), TrackError> {
        let json = serde_json::to_string(snapshot)?;
        writeln!(self.writer, "{}", json)
            .map_err(|e| TrackError::TransportError(e.to_string()))?;
        Ok(())
    }
}
