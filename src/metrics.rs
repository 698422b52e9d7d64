//! Shared metrics store and on-demand snapshots
//!
//! The engine owns the shared containers each analyzer appends to; analyzers
//! keep their own private indices. A snapshot is recomputed from the current
//! containers on demand and never independently mutated.

use crate::events::{ClickEvent, DwellRecord, MutationBatch, RageClickEvent, ScrollPoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared containers appended to by the analyzers during tracking
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsStore {
    pub clicks: Vec<ClickEvent>,
    pub rage_clicks: Vec<RageClickEvent>,
    pub scroll: Vec<ScrollPoint>,
    pub visibility: Vec<DwellRecord>,
    pub mutations: Vec<MutationBatch>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every container to empty
    pub fn clear(&mut self) {
        self.clicks.clear();
        self.rage_clicks.clear();
        self.scroll.clear();
        self.visibility.clear();
        self.mutations.clear();
    }
}

/// Session identity published when tracking starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
}

/// Final session digest published when tracking stops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub stop_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub metrics: AggregateMetrics,
}

/// Session metadata embedded in every snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: Uuid,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

/// Event counts across the shared containers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_clicks: usize,
    pub total_rage_clicks: usize,
    pub scroll_events: usize,
    pub visibility_events: usize,
    pub mutation_batches: usize,
}

/// Point-in-time snapshot of everything the tracker has derived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub session: SessionMeta,
    pub summary: MetricsSummary,
    pub data: MetricsStore,
}

impl AggregateMetrics {
    /// Build a snapshot from the current store state. Pure with respect to
    /// the store: two captures with no intervening events are equal.
    pub fn capture(
        session_id: Uuid,
        start_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        store: &MetricsStore,
    ) -> Self {
        let duration_ms = start_time
            .map(|start| (now - start).num_milliseconds().max(0))
            .unwrap_or(0);

        Self {
            session: SessionMeta {
                session_id,
                start_time,
                duration_ms,
            },
            summary: MetricsSummary {
                total_clicks: store.clicks.len(),
                total_rage_clicks: store.rage_clicks.len(),
                scroll_events: store.scroll.len(),
                visibility_events: store.visibility.len(),
                mutation_batches: store.mutations.len(),
            },
            data: store.clone(),
        }
    }
}
