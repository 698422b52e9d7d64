//! Element visibility and dwell-time analysis
//!
//! Tracks enter/exit transitions per element, keeps one open viewing session
//! at a time, emits periodic progress while an element stays visible and
//! finalizes a dwell record once cumulative visible time meets the configured
//! minimum.

use crate::analyzers::{Analyzer, AnalyzerContext};
use crate::bus::{Signal, Topic};
use crate::config::VisibilityConfig;
use crate::error::TrackError;
use crate::events::{
    DwellProgress, DwellRecord, ElementMeta, VisibilityPhase, VisibilityTransition,
};
use crate::schedule::{TimerId, TimerTask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const NAME: &str = "visibility";
const TOPICS: &[Topic] = &[Topic::VisibilityChanged, Topic::TrackableAdded];

/// One viewing session for an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilitySession {
    pub start: DateTime<Utc>,
    /// None while the session is open
    pub end: Option<DateTime<Utc>>,
    /// Running duration while open, final duration once closed (ms)
    pub duration_ms: i64,
    /// Intersection ratio reported at the enter transition
    pub ratio_at_start: f64,
}

/// Per-element dwell state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityRecord {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ElementMeta>,
    pub sessions: Vec<VisibilitySession>,
    /// Sum of closed sessions' durations (ms)
    pub total_ms: i64,
    pub visible: bool,
    /// Longest single session seen so far (ms)
    pub max_session_ms: i64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Summary row for the most-viewed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellSummary {
    pub target: String,
    pub total_ms: i64,
    pub session_count: u32,
    pub max_session_ms: i64,
    pub avg_session_ms: i64,
}

/// A currently visible element with its live session duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveVisibility {
    pub target: String,
    pub current_session_ms: i64,
    pub total_ms: i64,
}

/// Aggregate visibility statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityStats {
    pub tracked_elements: usize,
    pub currently_visible: usize,
    /// Dwell records that met the minimum and were finalized
    pub finalized_views: u32,
    /// Mean cumulative dwell across elements with nonzero dwell (ms)
    pub avg_dwell_ms: i64,
}

/// Consumes visibility transitions; owns per-element viewing records
pub struct VisibilityAnalyzer {
    config: VisibilityConfig,
    records: HashMap<String, VisibilityRecord>,
    timers: HashMap<String, TimerId>,
    finalized: u32,
}

impl VisibilityAnalyzer {
    pub fn new(config: VisibilityConfig) -> Result<Self, TrackError> {
        config.validate()?;
        Ok(Self {
            config,
            records: HashMap::new(),
            timers: HashMap::new(),
            finalized: 0,
        })
    }

    fn process(&mut self, transition: &VisibilityTransition, cx: &mut AnalyzerContext<'_>) {
        match transition.phase {
            VisibilityPhase::Enter => self.on_enter(transition, cx),
            VisibilityPhase::Exit => self.on_exit(&transition.target, transition.timestamp, cx),
        }
    }

    fn on_enter(&mut self, transition: &VisibilityTransition, cx: &mut AnalyzerContext<'_>) {
        let now = transition.timestamp;
        let record = self
            .records
            .entry(transition.target.clone())
            .or_insert_with(|| empty_record(&transition.target));

        if record.meta.is_none() {
            record.meta = transition.meta.clone();
        }

        // At most one open session per element; a repeated enter is a no-op
        if record.visible {
            return;
        }

        record.visible = true;
        if record.first_seen.is_none() {
            record.first_seen = Some(now);
        }
        record.sessions.push(VisibilitySession {
            start: now,
            end: None,
            duration_ms: 0,
            ratio_at_start: transition.ratio,
        });

        let timer = cx.scheduler.schedule_interval(
            NAME,
            TimerTask::DwellProgress {
                target: transition.target.clone(),
            },
            now,
            self.config.update_interval_ms,
        );
        self.timers.insert(transition.target.clone(), timer);
    }

    fn on_exit(&mut self, target: &str, now: DateTime<Utc>, cx: &mut AnalyzerContext<'_>) {
        if let Some(timer) = self.timers.remove(target) {
            cx.scheduler.cancel(timer);
        }

        let Some(record) = self.records.get_mut(target) else {
            return;
        };
        // Closing with no open session is a no-op
        if !record.visible {
            return;
        }

        record.visible = false;
        if let Some(session) = record.sessions.last_mut() {
            session.end = Some(now);
            session.duration_ms = (now - session.start).num_milliseconds();
            if session.duration_ms > record.max_session_ms {
                record.max_session_ms = session.duration_ms;
            }
        }
        record.total_ms = record
            .sessions
            .iter()
            .filter(|s| s.end.is_some())
            .map(|s| s.duration_ms)
            .sum();
        record.last_seen = Some(now);

        // Sub-minimum dwell updates internal state but never surfaces
        if record.total_ms < self.config.min_visible_ms {
            return;
        }

        self.finalized += 1;
        let dwell = DwellRecord {
            target: record.target.clone(),
            meta: record.meta.clone(),
            total_ms: record.total_ms,
            session_count: record.sessions.len() as u32,
            max_session_ms: record.max_session_ms,
            first_seen: record.first_seen.unwrap_or(now),
            last_seen: now,
            timestamp: now,
        };
        cx.metrics.visibility.push(dwell.clone());
        cx.out.emit(Signal::VisibilityEnded(dwell));
    }

    fn on_progress_tick(&mut self, target: &str, at: DateTime<Utc>, cx: &mut AnalyzerContext<'_>) {
        let Some(record) = self.records.get_mut(target) else {
            if let Some(timer) = self.timers.remove(target) {
                cx.scheduler.cancel(timer);
            }
            return;
        };
        if !record.visible {
            if let Some(timer) = self.timers.remove(target) {
                cx.scheduler.cancel(timer);
            }
            return;
        }

        let Some(session) = record.sessions.last_mut() else {
            return;
        };
        session.duration_ms = (at - session.start).num_milliseconds();
        if session.duration_ms > record.max_session_ms {
            record.max_session_ms = session.duration_ms;
        }

        cx.out.emit(Signal::VisibilityUpdate(DwellProgress {
            target: record.target.clone(),
            total_ms: record.total_ms + session.duration_ms,
            current_session_ms: session.duration_ms,
            session_count: record.sessions.len() as u32,
            timestamp: at,
        }));
    }

    /// Register an element before it has ever been visible
    fn preregister(&mut self, target: &str) {
        self.records
            .entry(target.to_string())
            .or_insert_with(|| empty_record(target));
    }

    /// Top `limit` elements by cumulative dwell, filtered to the minimum
    pub fn top_viewed(&self, limit: usize) -> Vec<DwellSummary> {
        let mut rows: Vec<DwellSummary> = self
            .records
            .values()
            .filter(|r| r.total_ms >= self.config.min_visible_ms)
            .map(|r| {
                let sessions = r.sessions.len() as u32;
                DwellSummary {
                    target: r.target.clone(),
                    total_ms: r.total_ms,
                    session_count: sessions,
                    max_session_ms: r.max_session_ms,
                    avg_session_ms: if sessions > 0 {
                        r.total_ms / sessions as i64
                    } else {
                        0
                    },
                }
            })
            .collect();
        rows.sort_by(|a, b| b.total_ms.cmp(&a.total_ms).then(a.target.cmp(&b.target)));
        rows.truncate(limit);
        rows
    }

    /// Elements with an open session, with live durations up to `now`
    pub fn currently_visible(&self, now: DateTime<Utc>) -> Vec<LiveVisibility> {
        let mut rows: Vec<LiveVisibility> = self
            .records
            .values()
            .filter(|r| r.visible)
            .map(|r| {
                let current = r
                    .sessions
                    .last()
                    .filter(|s| s.end.is_none())
                    .map(|s| (now - s.start).num_milliseconds())
                    .unwrap_or(0);
                LiveVisibility {
                    target: r.target.clone(),
                    current_session_ms: current,
                    total_ms: r.total_ms,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.target.cmp(&b.target));
        rows
    }

    /// Aggregate statistics over the tracked elements
    pub fn stats(&self) -> VisibilityStats {
        let dwells: Vec<i64> = self
            .records
            .values()
            .filter(|r| r.total_ms > 0)
            .map(|r| r.total_ms)
            .collect();
        let avg_dwell_ms = if dwells.is_empty() {
            0
        } else {
            dwells.iter().sum::<i64>() / dwells.len() as i64
        };
        VisibilityStats {
            tracked_elements: self.records.len(),
            currently_visible: self.records.values().filter(|r| r.visible).count(),
            finalized_views: self.finalized,
            avg_dwell_ms,
        }
    }

    /// Full record for one element
    pub fn record(&self, target: &str) -> Option<&VisibilityRecord> {
        self.records.get(target)
    }
}

fn empty_record(target: &str) -> VisibilityRecord {
    VisibilityRecord {
        target: target.to_string(),
        meta: None,
        sessions: Vec::new(),
        total_ms: 0,
        visible: false,
        max_session_ms: 0,
        first_seen: None,
        last_seen: None,
    }
}

impl Analyzer for VisibilityAnalyzer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn topics(&self) -> &'static [Topic] {
        TOPICS
    }

    fn start(&mut self, _cx: &mut AnalyzerContext<'_>) {
        log::debug!("visibility analyzer started");
    }

    fn stop(&mut self, cx: &mut AnalyzerContext<'_>) -> Result<(), TrackError> {
        // Close every open session so dwell is frozen at stop time
        let visible: Vec<String> = self
            .records
            .values()
            .filter(|r| r.visible)
            .map(|r| r.target.clone())
            .collect();
        for target in visible {
            self.on_exit(&target, cx.now, cx);
        }
        log::debug!(
            "visibility analyzer stopped: {} elements tracked",
            self.records.len()
        );
        Ok(())
    }

    fn clear(&mut self) {
        self.records.clear();
        self.timers.clear();
        self.finalized = 0;
    }

    fn on_signal(
        &mut self,
        signal: &Signal,
        cx: &mut AnalyzerContext<'_>,
    ) -> Result<(), TrackError> {
        match signal {
            Signal::Visibility(transition) => self.process(transition, cx),
            Signal::TrackableAdded(element) => self.preregister(&element.target),
            _ => {}
        }
        Ok(())
    }

    fn on_timer(&mut self, task: &TimerTask, at: DateTime<Utc>, cx: &mut AnalyzerContext<'_>) {
        if let TimerTask::DwellProgress { target } = task {
            let target = target.clone();
            self.on_progress_tick(&target, at, cx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Outbox;
    use crate::metrics::MetricsStore;
    use crate::schedule::Scheduler;
    use chrono::{Duration, TimeZone};

    struct Harness {
        out: Outbox,
        scheduler: Scheduler,
        store: MetricsStore,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                out: Outbox::new(),
                scheduler: Scheduler::new(),
                store: MetricsStore::new(),
            }
        }

        fn feed(
            &mut self,
            analyzer: &mut VisibilityAnalyzer,
            transition: VisibilityTransition,
        ) -> Vec<Signal> {
            let mut cx = AnalyzerContext {
                now: transition.timestamp,
                out: &mut self.out,
                scheduler: &mut self.scheduler,
                metrics: &mut self.store,
            };
            analyzer
                .on_signal(&Signal::Visibility(transition), &mut cx)
                .unwrap();
            self.out.drain()
        }

        fn run_timers(
            &mut self,
            analyzer: &mut VisibilityAnalyzer,
            now: DateTime<Utc>,
        ) -> Vec<Signal> {
            let fires = self.scheduler.poll(now);
            for fire in fires {
                let mut cx = AnalyzerContext {
                    now: fire.at,
                    out: &mut self.out,
                    scheduler: &mut self.scheduler,
                    metrics: &mut self.store,
                };
                analyzer.on_timer(&fire.task, fire.at, &mut cx);
            }
            self.out.drain()
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn transition(target: &str, phase: VisibilityPhase, offset_ms: i64) -> VisibilityTransition {
        VisibilityTransition {
            target: target.to_string(),
            phase,
            ratio: 0.6,
            timestamp: base_time() + Duration::milliseconds(offset_ms),
            meta: None,
        }
    }

    #[test]
    fn test_dwell_above_minimum_is_recorded() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Enter, 0));
        let signals = harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Exit, 1200));

        assert_eq!(harness.store.visibility.len(), 1);
        assert_eq!(harness.store.visibility[0].total_ms, 1200);
        assert!(signals
            .iter()
            .any(|s| matches!(s, Signal::VisibilityEnded(r) if r.total_ms == 1200)));
    }

    #[test]
    fn test_dwell_below_minimum_never_surfaces() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("aside", VisibilityPhase::Enter, 0));
        let signals = harness.feed(&mut analyzer, transition("aside", VisibilityPhase::Exit, 400));

        assert!(harness.store.visibility.is_empty());
        assert!(signals.is_empty());
        // Internal state still advanced
        assert_eq!(analyzer.record("aside").unwrap().total_ms, 400);
    }

    #[test]
    fn test_progress_ticks_are_non_decreasing() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Enter, 0));
        let signals = harness.run_timers(&mut analyzer, base_time() + Duration::milliseconds(2500));

        let totals: Vec<i64> = signals
            .iter()
            .filter_map(|s| match s {
                Signal::VisibilityUpdate(p) => Some(p.total_ms),
                _ => None,
            })
            .collect();
        assert_eq!(totals, vec![1000, 2000]);
    }

    #[test]
    fn test_exit_stops_progress_ticks() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Enter, 0));
        harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Exit, 1500));

        let signals = harness.run_timers(&mut analyzer, base_time() + Duration::milliseconds(5000));
        assert!(signals.is_empty());
        assert_eq!(harness.scheduler.pending(), 0);
    }

    #[test]
    fn test_exit_without_open_session_is_noop() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        let signals = harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Exit, 0));
        assert!(signals.is_empty());
        assert!(harness.store.visibility.is_empty());
    }

    #[test]
    fn test_repeated_enter_keeps_single_open_session() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Enter, 0));
        harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Enter, 300));

        assert_eq!(analyzer.record("hero").unwrap().sessions.len(), 1);
    }

    #[test]
    fn test_cumulative_dwell_across_sessions() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("card", VisibilityPhase::Enter, 0));
        let first = harness.feed(&mut analyzer, transition("card", VisibilityPhase::Exit, 700));
        assert!(first.is_empty());

        harness.feed(&mut analyzer, transition("card", VisibilityPhase::Enter, 2000));
        let second = harness.feed(&mut analyzer, transition("card", VisibilityPhase::Exit, 2600));

        // 700 + 600 crosses the minimum on the second exit
        assert!(second
            .iter()
            .any(|s| matches!(s, Signal::VisibilityEnded(r) if r.total_ms == 1300)));
        let record = analyzer.record("card").unwrap();
        assert_eq!(record.max_session_ms, 700);
        assert_eq!(record.sessions.len(), 2);
    }

    #[test]
    fn test_top_viewed_filters_and_sorts() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("a", VisibilityPhase::Enter, 0));
        harness.feed(&mut analyzer, transition("a", VisibilityPhase::Exit, 1500));
        harness.feed(&mut analyzer, transition("b", VisibilityPhase::Enter, 2000));
        harness.feed(&mut analyzer, transition("b", VisibilityPhase::Exit, 5000));
        harness.feed(&mut analyzer, transition("c", VisibilityPhase::Enter, 6000));
        harness.feed(&mut analyzer, transition("c", VisibilityPhase::Exit, 6300));

        let top = analyzer.top_viewed(10);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].target, "b");
        assert_eq!(top[0].total_ms, 3000);
        assert_eq!(top[1].target, "a");
    }

    #[test]
    fn test_currently_visible_reports_live_duration() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Enter, 0));

        let live = analyzer.currently_visible(base_time() + Duration::milliseconds(1800));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].current_session_ms, 1800);

        let stats = analyzer.stats();
        assert_eq!(stats.tracked_elements, 1);
        assert_eq!(stats.currently_visible, 1);
    }

    #[test]
    fn test_trackable_added_preregisters_element() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut out = Outbox::new();
        let mut scheduler = Scheduler::new();
        let mut store = MetricsStore::new();
        let mut cx = AnalyzerContext {
            now: base_time(),
            out: &mut out,
            scheduler: &mut scheduler,
            metrics: &mut store,
        };

        analyzer
            .on_signal(
                &Signal::TrackableAdded(crate::events::TrackableElement {
                    target: "late-card".to_string(),
                    timestamp: base_time(),
                }),
                &mut cx,
            )
            .unwrap();

        let record = analyzer.record("late-card").unwrap();
        assert!(!record.visible);
        assert_eq!(analyzer.stats().tracked_elements, 1);
    }

    #[test]
    fn test_stop_freezes_open_sessions() {
        let mut analyzer = VisibilityAnalyzer::new(VisibilityConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, transition("hero", VisibilityPhase::Enter, 0));

        let mut cx = AnalyzerContext {
            now: base_time() + Duration::milliseconds(2000),
            out: &mut harness.out,
            scheduler: &mut harness.scheduler,
            metrics: &mut harness.store,
        };
        analyzer.stop(&mut cx).unwrap();

        assert_eq!(harness.store.visibility.len(), 1);
        assert_eq!(harness.store.visibility[0].total_ms, 2000);
        assert_eq!(harness.scheduler.pending(), 0);
        assert!(!analyzer.record("hero").unwrap().visible);
    }
}
