//! Synchronous publish/subscribe dispatcher
//!
//! All components communicate through this bus. Topics form a closed enum with
//! a typed payload per topic; a string-keyed `Custom` topic is kept as an
//! escape hatch for forward-compatible events. Delivery is synchronous and in
//! subscription order; a failing handler is logged and isolated so remaining
//! subscribers still run.

use crate::error::TrackError;
use crate::events::{
    ClickEvent, DirectionChange, DwellProgress, DwellRecord, MilestoneEvent, MutationBatch,
    RageClickEvent, ScrollSample, StructuralChange, TrackableElement, TransportFailure,
    VisibilityTransition,
};
use crate::metrics::{AggregateMetrics, SessionInfo, SessionSummary};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

/// Cap on signals delivered by a single `publish` call, including cascades.
/// A handler may publish from within delivery; the queue below makes that
/// iterative rather than recursive, and this cap stops runaway feedback loops.
const CASCADE_LIMIT: usize = 1024;

/// Topic tags for every signal the engine knows about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    ClickRegistered,
    ScrollSampled,
    VisibilityChanged,
    MutationObserved,
    RageDetected,
    MilestoneReached,
    DirectionChanged,
    VisibilityUpdate,
    VisibilityEnded,
    TrackableAdded,
    BatchProcessed,
    TrackerStarted,
    TrackerStopped,
    MetricsCleared,
    MetricsExported,
    MetricsError,
    /// Escape hatch for consumer-defined events
    Custom(String),
}

impl Topic {
    /// Wire name of the topic
    pub fn as_str(&self) -> &str {
        match self {
            Topic::ClickRegistered => "click:registered",
            Topic::ScrollSampled => "scroll:sampled",
            Topic::VisibilityChanged => "visibility:changed",
            Topic::MutationObserved => "mutation:observed",
            Topic::RageDetected => "rage:detected",
            Topic::MilestoneReached => "milestone:reached",
            Topic::DirectionChanged => "scroll:direction-changed",
            Topic::VisibilityUpdate => "visibility:update",
            Topic::VisibilityEnded => "visibility:ended",
            Topic::TrackableAdded => "mutations:trackable-added",
            Topic::BatchProcessed => "mutations:batch-processed",
            Topic::TrackerStarted => "tracker:started",
            Topic::TrackerStopped => "tracker:stopped",
            Topic::MetricsCleared => "metrics:cleared",
            Topic::MetricsExported => "metrics:exported",
            Topic::MetricsError => "metrics:error",
            Topic::Custom(name) => name.as_str(),
        }
    }
}

/// A signal published on the bus, one variant per topic
#[derive(Debug, Clone)]
pub enum Signal {
    Click(ClickEvent),
    Scroll(ScrollSample),
    Visibility(VisibilityTransition),
    Mutation(StructuralChange),
    RageDetected(RageClickEvent),
    MilestoneReached(MilestoneEvent),
    DirectionChanged(DirectionChange),
    VisibilityUpdate(DwellProgress),
    VisibilityEnded(DwellRecord),
    TrackableAdded(TrackableElement),
    BatchProcessed(MutationBatch),
    TrackerStarted(SessionInfo),
    TrackerStopped(SessionSummary),
    MetricsCleared,
    MetricsExported(AggregateMetrics),
    MetricsError(TransportFailure),
    Custom {
        topic: String,
        payload: serde_json::Value,
    },
}

impl Signal {
    /// Topic this signal is delivered on
    pub fn topic(&self) -> Topic {
        match self {
            Signal::Click(_) => Topic::ClickRegistered,
            Signal::Scroll(_) => Topic::ScrollSampled,
            Signal::Visibility(_) => Topic::VisibilityChanged,
            Signal::Mutation(_) => Topic::MutationObserved,
            Signal::RageDetected(_) => Topic::RageDetected,
            Signal::MilestoneReached(_) => Topic::MilestoneReached,
            Signal::DirectionChanged(_) => Topic::DirectionChanged,
            Signal::VisibilityUpdate(_) => Topic::VisibilityUpdate,
            Signal::VisibilityEnded(_) => Topic::VisibilityEnded,
            Signal::TrackableAdded(_) => Topic::TrackableAdded,
            Signal::BatchProcessed(_) => Topic::BatchProcessed,
            Signal::TrackerStarted(_) => Topic::TrackerStarted,
            Signal::TrackerStopped(_) => Topic::TrackerStopped,
            Signal::MetricsCleared => Topic::MetricsCleared,
            Signal::MetricsExported(_) => Topic::MetricsExported,
            Signal::MetricsError(_) => Topic::MetricsError,
            Signal::Custom { topic, .. } => Topic::Custom(topic.clone()),
        }
    }

    /// Timestamp carried by the signal, when it has one
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Signal::Click(e) => Some(e.timestamp),
            Signal::Scroll(e) => Some(e.timestamp),
            Signal::Visibility(e) => Some(e.timestamp),
            Signal::Mutation(e) => Some(e.timestamp),
            Signal::RageDetected(e) => Some(e.timestamp),
            Signal::MilestoneReached(e) => Some(e.timestamp),
            Signal::DirectionChanged(e) => Some(e.timestamp),
            Signal::VisibilityUpdate(e) => Some(e.timestamp),
            Signal::VisibilityEnded(e) => Some(e.timestamp),
            Signal::TrackableAdded(e) => Some(e.timestamp),
            Signal::BatchProcessed(e) => Some(e.timestamp),
            Signal::TrackerStarted(info) => Some(info.start_time),
            Signal::TrackerStopped(summary) => Some(summary.stop_time),
            Signal::MetricsCleared => None,
            Signal::MetricsExported(m) => m.session.start_time,
            Signal::MetricsError(e) => Some(e.timestamp),
            Signal::Custom { .. } => None,
        }
    }
}

/// Signals emitted by a handler during delivery, drained into the cascade
#[derive(Debug, Default)]
pub struct Outbox {
    signals: Vec<Signal>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a signal for delivery after the current handler returns
    pub fn emit(&mut self, signal: Signal) {
        self.signals.push(signal);
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.signals)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handler closure invoked on delivery
pub type Handler = Box<dyn FnMut(&Signal, &mut Outbox) -> Result<(), TrackError>>;

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

/// Topic-keyed dispatcher; registry lifetime equals the tracker session
#[derive(Default)]
pub struct Dispatcher {
    registry: HashMap<Topic, Vec<Subscription>>,
    next_id: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler; invocation order equals subscription order
    pub fn subscribe(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.register(topic, handler, false)
    }

    /// Subscribe a handler that is removed after its first invocation
    pub fn subscribe_once(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.register(topic, handler, true)
    }

    fn register(&mut self, topic: Topic, handler: Handler, once: bool) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        log::debug!("subscribed to '{}'", topic.as_str());
        self.registry.entry(topic).or_default().push(Subscription {
            id,
            once,
            handler,
        });
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&mut self, topic: &Topic, id: SubscriptionId) -> bool {
        match self.registry.get_mut(topic) {
            Some(subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() != before
            }
            None => false,
        }
    }

    /// Deliver a signal to the topic's subscribers, synchronously and in
    /// subscription order. Signals emitted by handlers are queued and
    /// delivered after the current one, bounded by the cascade limit.
    pub fn publish(&mut self, signal: Signal) {
        let mut queue = VecDeque::new();
        queue.push_back(signal);
        let mut delivered = 0usize;

        while let Some(signal) = queue.pop_front() {
            delivered += 1;
            if delivered > CASCADE_LIMIT {
                log::warn!(
                    "publish cascade exceeded {} signals; dropping {} queued",
                    CASCADE_LIMIT,
                    queue.len() + 1
                );
                break;
            }
            self.deliver(&signal, &mut queue);
        }
    }

    fn deliver(&mut self, signal: &Signal, queue: &mut VecDeque<Signal>) {
        let topic = signal.topic();
        let Some(subs) = self.registry.get_mut(&topic) else {
            return;
        };

        let mut outbox = Outbox::new();
        let mut spent = Vec::new();

        for sub in subs.iter_mut() {
            if let Err(error) = (sub.handler)(signal, &mut outbox) {
                log::error!("handler for '{}' failed: {}", topic.as_str(), error);
            }
            if sub.once {
                spent.push(sub.id);
            }
            queue.extend(outbox.drain());
        }

        if !spent.is_empty() {
            subs.retain(|s| !spent.contains(&s.id));
        }
    }

    /// Drop every subscription
    pub fn clear(&mut self) {
        self.registry.clear();
    }

    /// Topics with at least one live subscriber
    pub fn registered_topics(&self) -> Vec<&Topic> {
        self.registry
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(topic, _)| topic)
            .collect()
    }

    /// Number of live subscribers for a topic
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry.get(topic).map_or(0, |subs| subs.len())
    }
}
