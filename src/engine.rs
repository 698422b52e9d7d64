//! Tracker engine
//!
//! Owns the session lifecycle, the dispatcher, the timer table and the shared
//! metrics store. Raw events are normalized here and published on the bus;
//! registered analyzers consume them and publish derived signals back. The
//! engine is the only component allowed to reset the shared containers.

use crate::analyzers::{Analyzer, AnalyzerContext};
use crate::bus::{Dispatcher, Handler, Outbox, Signal, SubscriptionId, Topic};
use crate::config::TrackerConfig;
use crate::error::TrackError;
use crate::events::RawEvent;
use crate::metrics::{AggregateMetrics, MetricsStore, SessionInfo, SessionSummary};
use crate::schedule::{Scheduler, TimerTask};
use crate::transport::{MetricsSink, RetrySender};
use chrono::{DateTime, Utc};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use uuid::Uuid;

const ENGINE_OWNER: &str = "engine";

/// Lifecycle state; `Stopped` is terminal, construct a new engine to restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Tracking,
    Stopped,
}

struct AnalyzerSlot {
    name: &'static str,
    handle: Rc<RefCell<dyn Analyzer>>,
}

/// Session orchestrator: registers analyzers, ingests raw events, drives
/// timers and assembles metrics snapshots
pub struct TrackerEngine {
    config: TrackerConfig,
    state: TrackerState,
    session_id: Uuid,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    dispatcher: Dispatcher,
    scheduler: Rc<RefCell<Scheduler>>,
    store: Rc<RefCell<MetricsStore>>,
    last_now: Rc<Cell<DateTime<Utc>>>,
    analyzers: Vec<AnalyzerSlot>,
    sender: Option<RetrySender>,
}

impl TrackerEngine {
    pub fn new(config: TrackerConfig) -> Result<Self, TrackError> {
        config.validate()?;
        Ok(Self {
            config,
            state: TrackerState::Idle,
            session_id: Uuid::new_v4(),
            start_time: None,
            stop_time: None,
            dispatcher: Dispatcher::new(),
            scheduler: Rc::new(RefCell::new(Scheduler::new())),
            store: Rc::new(RefCell::new(MetricsStore::new())),
            last_now: Rc::new(Cell::new(DateTime::<Utc>::MIN_UTC)),
            analyzers: Vec::new(),
            sender: None,
        })
    }

    /// Register an analyzer. Valid while idle or tracking; registering after
    /// tracking has started starts the analyzer immediately.
    pub fn attach(&mut self, analyzer: Rc<RefCell<dyn Analyzer>>) -> &mut Self {
        if self.state == TrackerState::Stopped {
            log::warn!("tracker is stopped; analyzer not registered");
            return self;
        }

        let (name, topics) = {
            let a = analyzer.borrow();
            (a.name(), a.topics())
        };

        for topic in topics {
            let handle = analyzer.clone();
            let scheduler = self.scheduler.clone();
            let store = self.store.clone();
            let last_now = self.last_now.clone();
            self.dispatcher.subscribe(
                topic.clone(),
                Box::new(move |signal, out| {
                    let now = signal.timestamp().unwrap_or_else(|| last_now.get());
                    let mut scheduler = scheduler.borrow_mut();
                    let mut metrics = store.borrow_mut();
                    let mut cx = AnalyzerContext {
                        now,
                        out,
                        scheduler: &mut scheduler,
                        metrics: &mut metrics,
                    };
                    handle.borrow_mut().on_signal(signal, &mut cx)
                }),
            );
        }

        self.analyzers.push(AnalyzerSlot {
            name,
            handle: analyzer.clone(),
        });
        log::debug!("analyzer '{}' registered", name);

        if self.state == TrackerState::Tracking {
            let now = self.last_now.get();
            self.scope(now, |cx| analyzer.borrow_mut().start(cx));
        }
        self
    }

    /// Route exported snapshots to an outbound sink with the configured
    /// retry policy
    pub fn set_sink(&mut self, sink: Box<dyn MetricsSink>) -> Result<(), TrackError> {
        self.sender = Some(RetrySender::new(sink, self.config.retry.clone())?);
        Ok(())
    }

    /// Subscribe an external consumer to a topic
    pub fn subscribe(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.dispatcher.subscribe(topic, handler)
    }

    /// Subscribe an external consumer for a single delivery
    pub fn subscribe_once(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.dispatcher.subscribe_once(topic, handler)
    }

    pub fn unsubscribe(&mut self, topic: &Topic, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(topic, id)
    }

    /// Publish a consumer-defined event on the escape-hatch topic
    pub fn publish_custom(&mut self, topic: impl Into<String>, payload: serde_json::Value) {
        self.dispatcher.publish(Signal::Custom {
            topic: topic.into(),
            payload,
        });
    }

    /// Begin tracking. A warning no-op when already tracking or stopped.
    pub fn start(&mut self, now: DateTime<Utc>) {
        match self.state {
            TrackerState::Tracking => {
                log::warn!("tracker already running");
            }
            TrackerState::Stopped => {
                log::warn!("tracker is stopped; construct a new engine to restart");
            }
            TrackerState::Idle => {
                self.state = TrackerState::Tracking;
                self.start_time = Some(now);
                self.last_now.set(now);
                log::info!("tracker started, session {}", self.session_id);

                let handles = self.handles();
                for (name, handle) in handles {
                    log::debug!("starting analyzer '{}'", name);
                    self.scope(now, |cx| handle.borrow_mut().start(cx));
                }

                if self.config.auto_export {
                    self.scheduler.borrow_mut().schedule_interval(
                        ENGINE_OWNER,
                        TimerTask::MetricsExport,
                        now,
                        self.config.export_interval_ms,
                    );
                }

                self.dispatcher.publish(Signal::TrackerStarted(SessionInfo {
                    session_id: self.session_id,
                    start_time: now,
                }));
            }
        }
    }

    /// Ingest one raw event: advance timers to the event's time, normalize,
    /// then publish. Malformed events are dropped with a warning.
    pub fn ingest(&mut self, event: RawEvent) {
        if self.state != TrackerState::Tracking {
            log::debug!("event ignored, tracker not running");
            return;
        }
        let event = match normalize(event) {
            Ok(event) => event,
            Err(error) => {
                log::warn!("dropping malformed event: {}", error);
                return;
            }
        };

        self.tick(event.timestamp());
        let signal = match event {
            RawEvent::Click(e) => Signal::Click(e),
            RawEvent::Scroll(e) => Signal::Scroll(e),
            RawEvent::Visibility(e) => Signal::Visibility(e),
            RawEvent::Mutation(e) => Signal::Mutation(e),
        };
        self.dispatcher.publish(signal);
    }

    pub fn ingest_click(&mut self, event: crate::events::ClickEvent) {
        self.ingest(RawEvent::Click(event));
    }

    pub fn ingest_scroll(&mut self, sample: crate::events::ScrollSample) {
        self.ingest(RawEvent::Scroll(sample));
    }

    pub fn ingest_visibility(&mut self, transition: crate::events::VisibilityTransition) {
        self.ingest(RawEvent::Visibility(transition));
    }

    pub fn ingest_mutation(&mut self, change: crate::events::StructuralChange) {
        self.ingest(RawEvent::Mutation(change));
    }

    /// Advance the timer table to `now`, delivering any due fires
    pub fn tick(&mut self, now: DateTime<Utc>) {
        if now > self.last_now.get() {
            self.last_now.set(now);
        }

        let fires = self.scheduler.borrow_mut().poll(now);
        for fire in fires {
            if fire.owner == ENGINE_OWNER {
                if fire.task == TimerTask::MetricsExport {
                    self.export_snapshot(fire.at);
                }
                continue;
            }
            let Some(handle) = self
                .analyzers
                .iter()
                .find(|slot| slot.name == fire.owner)
                .map(|slot| slot.handle.clone())
            else {
                continue;
            };
            self.scope(fire.at, |cx| {
                handle.borrow_mut().on_timer(&fire.task, fire.at, cx)
            });
        }
    }

    /// Run an operation with full analyzer context (scheduler, store, outbox)
    /// and publish whatever it emits. This is how analyzer operations that
    /// need engine resources are driven from outside, e.g. pausing the
    /// mutation aggregator.
    pub fn scope<R>(
        &mut self,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut AnalyzerContext<'_>) -> R,
    ) -> R {
        let mut out = Outbox::new();
        let result = {
            let mut scheduler = self.scheduler.borrow_mut();
            let mut metrics = self.store.borrow_mut();
            let mut cx = AnalyzerContext {
                now,
                out: &mut out,
                scheduler: &mut scheduler,
                metrics: &mut metrics,
            };
            f(&mut cx)
        };
        for signal in out.drain() {
            self.dispatcher.publish(signal);
        }
        result
    }

    fn export_snapshot(&mut self, at: DateTime<Utc>) {
        let snapshot = self.get_metrics(at);
        log::debug!(
            "metrics exported: {} clicks, {} scroll samples",
            snapshot.summary.total_clicks,
            snapshot.summary.scroll_events
        );
        self.dispatcher
            .publish(Signal::MetricsExported(snapshot.clone()));

        let failures = match self.sender.as_mut() {
            Some(sender) => {
                sender.enqueue(snapshot);
                sender.flush(at)
            }
            None => Vec::new(),
        };
        for failure in failures {
            self.dispatcher.publish(Signal::MetricsError(failure));
        }
    }

    /// Current snapshot; pure with respect to engine state
    pub fn get_metrics(&self, now: DateTime<Utc>) -> AggregateMetrics {
        let effective = self.stop_time.unwrap_or(now);
        AggregateMetrics::capture(
            self.session_id,
            self.start_time,
            effective,
            &self.store.borrow(),
        )
    }

    /// Reset the shared containers and every analyzer's private indices, so
    /// queries and the store agree on a single empty state. Analyzer-owned
    /// timers are cancelled alongside the state they referenced.
    pub fn clear(&mut self) {
        self.store.borrow_mut().clear();
        for slot in &self.analyzers {
            slot.handle.borrow_mut().clear();
            self.scheduler.borrow_mut().cancel_owned(slot.name);
        }
        log::info!("metrics cleared");
        self.dispatcher.publish(Signal::MetricsCleared);
    }

    /// Stop tracking: deliver due timers, stop analyzers (collecting and
    /// logging failures), cancel all timers and publish the final snapshot.
    pub fn stop(&mut self, now: DateTime<Utc>) {
        if self.state != TrackerState::Tracking {
            log::warn!("tracker is not running");
            return;
        }

        self.tick(now);

        let handles = self.handles();
        for (name, handle) in handles {
            let result = self.scope(now, |cx| handle.borrow_mut().stop(cx));
            if let Err(error) = result {
                log::error!("analyzer '{}' failed to stop: {}", name, error);
            }
        }

        self.scheduler.borrow_mut().clear();
        self.state = TrackerState::Stopped;
        self.stop_time = Some(now);

        // Give queued exports one last flush before teardown
        let failures = match self.sender.as_mut() {
            Some(sender) => sender.flush(now),
            None => Vec::new(),
        };
        for failure in failures {
            self.dispatcher.publish(Signal::MetricsError(failure));
        }

        let metrics = self.get_metrics(now);
        let duration_ms = metrics.session.duration_ms;
        log::info!("tracker stopped after {}ms", duration_ms);
        self.dispatcher.publish(Signal::TrackerStopped(SessionSummary {
            session_id: self.session_id,
            stop_time: now,
            duration_ms,
            metrics,
        }));
    }

    /// Stop if tracking, then drop every subscription and analyzer
    pub fn destroy(&mut self, now: DateTime<Utc>) {
        if self.state == TrackerState::Tracking {
            self.stop(now);
        }
        self.dispatcher.clear();
        self.scheduler.borrow_mut().clear();
        self.analyzers.clear();
        log::info!("tracker destroyed");
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_tracking(&self) -> bool {
        self.state == TrackerState::Tracking
    }

    fn handles(&self) -> Vec<(&'static str, Rc<RefCell<dyn Analyzer>>)> {
        self.analyzers
            .iter()
            .map(|slot| (slot.name, slot.handle.clone()))
            .collect()
    }
}

/// Validate and normalize a raw event before it reaches the bus: non-finite
/// numbers and empty target keys are rejected, out-of-range percentages and
/// ratios are clamped.
fn normalize(event: RawEvent) -> Result<RawEvent, TrackError> {
    match event {
        RawEvent::Click(e) => {
            if !(e.x.is_finite() && e.y.is_finite()) {
                return Err(TrackError::MalformedEvent(
                    "click coordinates must be finite".to_string(),
                ));
            }
            if e.target.is_empty() {
                return Err(TrackError::MalformedEvent(
                    "click target must not be empty".to_string(),
                ));
            }
            Ok(RawEvent::Click(e))
        }
        RawEvent::Scroll(mut e) => {
            if !(e.offset.is_finite() && e.percent.is_finite()) {
                return Err(TrackError::MalformedEvent(
                    "scroll sample must be finite".to_string(),
                ));
            }
            e.percent = e.percent.clamp(0.0, 100.0);
            Ok(RawEvent::Scroll(e))
        }
        RawEvent::Visibility(mut e) => {
            if e.target.is_empty() {
                return Err(TrackError::MalformedEvent(
                    "visibility target must not be empty".to_string(),
                ));
            }
            if !e.ratio.is_finite() {
                return Err(TrackError::MalformedEvent(
                    "intersection ratio must be finite".to_string(),
                ));
            }
            e.ratio = e.ratio.clamp(0.0, 1.0);
            Ok(RawEvent::Visibility(e))
        }
        RawEvent::Mutation(e) => {
            if e.target.is_empty() {
                return Err(TrackError::MalformedEvent(
                    "mutation target must not be empty".to_string(),
                ));
            }
            Ok(RawEvent::Mutation(e))
        }
    }
}
