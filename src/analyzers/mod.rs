//! Stateful analyzers driven by the dispatcher
//!
//! Each analyzer owns its private indices, consumes one or more raw topics,
//! and emits derived signals through the context outbox. The engine builds
//! the context around every delivery, so analyzers never touch the clock,
//! the scheduler or the shared store directly.

pub mod clicks;
pub mod mutations;
pub mod scroll;
pub mod visibility;

use crate::bus::{Outbox, Signal, Topic};
use crate::error::TrackError;
use crate::metrics::MetricsStore;
use crate::schedule::{Scheduler, TimerTask};
use chrono::{DateTime, Utc};

pub use clicks::ClickAnalyzer;
pub use mutations::MutationAggregator;
pub use scroll::ScrollAnalyzer;
pub use visibility::VisibilityAnalyzer;

/// Everything an analyzer may touch while handling a signal or timer
pub struct AnalyzerContext<'a> {
    /// Time of the triggering event or timer deadline
    pub now: DateTime<Utc>,
    /// Derived signals queued for delivery after the handler returns
    pub out: &'a mut Outbox,
    /// Timer table shared across the engine
    pub scheduler: &'a mut Scheduler,
    /// Shared containers owned by the engine
    pub metrics: &'a mut MetricsStore,
}

/// A stateful consumer of raw signals registered with the engine
pub trait Analyzer {
    /// Stable name, used for logging and timer ownership
    fn name(&self) -> &'static str;

    /// Topics this analyzer consumes
    fn topics(&self) -> &'static [Topic];

    /// Called when tracking starts, or immediately on late registration
    fn start(&mut self, cx: &mut AnalyzerContext<'_>);

    /// Called when tracking stops; failures are collected and logged by the
    /// engine, never propagated to the caller of `stop`
    fn stop(&mut self, cx: &mut AnalyzerContext<'_>) -> Result<(), TrackError>;

    /// Reset private indices to their initial state
    fn clear(&mut self);

    /// Handle one delivered signal
    fn on_signal(&mut self, signal: &Signal, cx: &mut AnalyzerContext<'_>)
        -> Result<(), TrackError>;

    /// Handle a timer this analyzer scheduled; `at` is the deadline the fire
    /// corresponds to, not the poll time
    fn on_timer(&mut self, task: &TimerTask, at: DateTime<Utc>, cx: &mut AnalyzerContext<'_>) {
        let _ = (task, at, cx);
    }
}
