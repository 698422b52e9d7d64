//! Structural-change batching
//!
//! Classifies raw change notifications, tallies running counters and
//! coalesces bursts into one immutable batch per quiet period via a debounce
//! timer. Added elements matching the trackable criteria are announced
//! immediately so other analyzers can pick them up before the batch flushes.

use crate::analyzers::{Analyzer, AnalyzerContext};
use crate::bus::{Signal, Topic};
use crate::config::MutationConfig;
use crate::error::TrackError;
use crate::events::{ChangeKind, MutationBatch, MutationRecord, StructuralChange, TrackableElement};
use crate::schedule::{TimerId, TimerTask};
use chrono::Duration;
use serde::{Deserialize, Serialize};

const NAME: &str = "mutations";
const TOPICS: &[Topic] = &[Topic::MutationObserved];

/// Running counters over everything observed, batches included or pending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationStats {
    pub total_mutations: u64,
    pub added_nodes: u64,
    pub removed_nodes: u64,
    pub attribute_changes: u64,
    pub text_changes: u64,
    pub batches_flushed: u64,
}

impl MutationStats {
    /// Mean batch size over flushed batches
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_flushed == 0 {
            return 0.0;
        }
        self.total_mutations as f64 / self.batches_flushed as f64
    }
}

/// Digest of one flushed batch for the activity summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDigest {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub count: u32,
    pub child_list: u32,
    pub attributes: u32,
    pub text: u32,
}

/// Recent batches plus running counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub recent: Vec<BatchDigest>,
    pub stats: MutationStats,
}

/// Consumes structural changes; owns the pending queue and debounce timer
pub struct MutationAggregator {
    config: MutationConfig,
    queue: Vec<MutationRecord>,
    stats: MutationStats,
    debounce: Option<TimerId>,
    paused: bool,
    digests: Vec<BatchDigest>,
}

impl MutationAggregator {
    pub fn new(config: MutationConfig) -> Result<Self, TrackError> {
        config.validate()?;
        Ok(Self {
            config,
            queue: Vec::new(),
            stats: MutationStats::default(),
            debounce: None,
            paused: false,
            digests: Vec::new(),
        })
    }

    fn process(&mut self, change: &StructuralChange, cx: &mut AnalyzerContext<'_>) {
        if self.paused {
            return;
        }

        // Attribute changes outside the tracked filter are ignored entirely
        if change.kind == ChangeKind::Attribute && !self.config.attribute_filter.is_empty() {
            let tracked = change
                .attribute_name
                .as_deref()
                .is_some_and(|name| self.config.attribute_filter.iter().any(|f| f == name));
            if !tracked {
                return;
            }
        }

        self.stats.total_mutations += 1;
        match change.kind {
            ChangeKind::ChildList => {
                self.stats.added_nodes += change.added.len() as u64;
                self.stats.removed_nodes += change.removed.len() as u64;
            }
            ChangeKind::Attribute => self.stats.attribute_changes += 1,
            ChangeKind::Text => self.stats.text_changes += 1,
        }

        self.queue.push(MutationRecord {
            kind: change.kind,
            target: change.target.clone(),
            timestamp: change.timestamp,
            attribute_name: change.attribute_name.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            added: change.added.clone(),
            removed: change.removed.clone(),
        });

        // Late-appearing trackable elements are announced before the batch
        // flush so visibility tracking can begin right away
        for added in &change.added {
            if self
                .config
                .trackable_markers
                .iter()
                .any(|marker| added.contains(marker.as_str()))
            {
                cx.out.emit(Signal::TrackableAdded(TrackableElement {
                    target: added.clone(),
                    timestamp: change.timestamp,
                }));
            }
        }

        // Every notification resets the quiet period
        let due = change.timestamp + Duration::milliseconds(self.config.debounce_ms);
        match self.debounce {
            Some(timer) if cx.scheduler.rearm(timer, due) => {}
            _ => {
                self.debounce = Some(cx.scheduler.schedule_once(
                    NAME,
                    TimerTask::DebounceFlush,
                    due,
                ));
            }
        }
    }

    fn flush(&mut self, at: chrono::DateTime<chrono::Utc>, cx: &mut AnalyzerContext<'_>) {
        self.debounce = None;
        if self.queue.is_empty() {
            return;
        }

        let records = std::mem::take(&mut self.queue);
        let batch = MutationBatch {
            timestamp: at,
            count: records.len() as u32,
            records,
        };

        self.stats.batches_flushed += 1;
        self.digests.push(BatchDigest {
            timestamp: batch.timestamp,
            count: batch.count,
            child_list: count_kind(&batch, ChangeKind::ChildList),
            attributes: count_kind(&batch, ChangeKind::Attribute),
            text: count_kind(&batch, ChangeKind::Text),
        });

        cx.metrics.mutations.push(batch.clone());
        cx.out.emit(Signal::BatchProcessed(batch));
    }

    /// Stop consuming notifications; accumulated statistics are kept and the
    /// pending queue stays intact for the next flush after resume
    pub fn pause(&mut self, cx: &mut AnalyzerContext<'_>) {
        self.paused = true;
        if let Some(timer) = self.debounce.take() {
            cx.scheduler.cancel(timer);
        }
        log::debug!("mutation aggregator paused");
    }

    /// Resume consuming notifications; a pending queue left over from before
    /// the pause is scheduled for flush
    pub fn resume(&mut self, cx: &mut AnalyzerContext<'_>) {
        self.paused = false;
        if !self.queue.is_empty() && self.debounce.is_none() {
            self.debounce = Some(cx.scheduler.schedule_once(
                NAME,
                TimerTask::DebounceFlush,
                cx.now + Duration::milliseconds(self.config.debounce_ms),
            ));
        }
        log::debug!("mutation aggregator resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Running counters
    pub fn stats(&self) -> MutationStats {
        self.stats
    }

    /// The last `limit` batch digests plus running counters
    pub fn activity_summary(&self, limit: usize) -> ActivitySummary {
        let start = self.digests.len().saturating_sub(limit);
        ActivitySummary {
            recent: self.digests[start..].to_vec(),
            stats: self.stats,
        }
    }

    /// Records waiting for the next flush
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

fn count_kind(batch: &MutationBatch, kind: ChangeKind) -> u32 {
    batch.records.iter().filter(|r| r.kind == kind).count() as u32
}

impl Analyzer for MutationAggregator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn topics(&self) -> &'static [Topic] {
        TOPICS
    }

    fn start(&mut self, _cx: &mut AnalyzerContext<'_>) {
        log::debug!("mutation aggregator started");
    }

    fn stop(&mut self, cx: &mut AnalyzerContext<'_>) -> Result<(), TrackError> {
        // Flush whatever is pending instead of dropping it
        if let Some(timer) = self.debounce.take() {
            cx.scheduler.cancel(timer);
        }
        let now = cx.now;
        self.flush(now, cx);
        log::debug!(
            "mutation aggregator stopped: {} mutations in {} batches",
            self.stats.total_mutations,
            self.stats.batches_flushed
        );
        Ok(())
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.stats = MutationStats::default();
        self.debounce = None;
        self.digests.clear();
    }

    fn on_signal(
        &mut self,
        signal: &Signal,
        cx: &mut AnalyzerContext<'_>,
    ) -> Result<(), TrackError> {
        if let Signal::Mutation(change) = signal {
            self.process(change, cx);
        }
        Ok(())
    }

    fn on_timer(
        &mut self,
        task: &TimerTask,
        at: chrono::DateTime<chrono::Utc>,
        cx: &mut AnalyzerContext<'_>,
    ) {
        if matches!(task, TimerTask::DebounceFlush) {
            self.flush(at, cx);
        }
    }
}
