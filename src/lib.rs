//! Tracelens - in-process engine for deriving behavioral signals from raw
//! user-interaction streams
//!
//! Raw events (clicks, scroll samples, visibility transitions, structural
//! changes) flow through a synchronous dispatcher into stateful analyzers
//! that maintain rolling windows, grids and session records, and publish
//! derived signals in real time: click-density heatmaps, rage-click alerts,
//! scroll-pattern classification, per-element dwell statistics and debounced
//! change batches.
//!
//! ## Modules
//!
//! - **bus**: topic-keyed synchronous publish/subscribe dispatcher
//! - **analyzers**: click, scroll, visibility and mutation analyzers
//! - **engine**: session lifecycle, ingestion and metrics snapshots
//! - **transport**: best-effort outbound delivery with bounded backoff

pub mod analyzers;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod schedule;
pub mod transport;

pub use bus::{Dispatcher, Handler, Outbox, Signal, SubscriptionId, Topic};
pub use config::{
    ClickConfig, MutationConfig, RetryConfig, ScrollConfig, TrackerConfig, VisibilityConfig,
};
pub use engine::{TrackerEngine, TrackerState};
pub use error::TrackError;
pub use events::RawEvent;
pub use metrics::{AggregateMetrics, MetricsStore};

pub use analyzers::{ClickAnalyzer, MutationAggregator, ScrollAnalyzer, VisibilityAnalyzer};

/// Engine version embedded in exported payloads
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
