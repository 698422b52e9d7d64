//! Core event types for the tracelens engine
//!
//! This module defines the raw interaction events fed into the engine and the
//! derived events the analyzers publish back on the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A pointer click captured by the acquisition layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    /// Page-relative x coordinate (px)
    pub x: f64,
    /// Page-relative y coordinate (px)
    pub y: f64,
    /// Screen-relative x coordinate (px)
    #[serde(default)]
    pub screen_x: f64,
    /// Screen-relative y coordinate (px)
    #[serde(default)]
    pub screen_y: f64,
    /// Stable key of the clicked element
    pub target: String,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
}

/// A scroll position sample, rate-limited upstream to one per frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollSample {
    /// Scroll offset from the top of the document (px)
    pub offset: f64,
    /// Scroll depth as a percentage of the scrollable range (0-100)
    pub percent: f64,
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,
}

/// Whether an element entered or left the visible viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityPhase {
    Enter,
    Exit,
}

/// Snapshot of element metadata taken by the acquisition layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementMeta {
    /// Element tag name, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Leading text content, truncated upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Relevant attributes captured with the element
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

/// An element visibility transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityTransition {
    /// Stable key of the tracked element
    pub target: String,
    /// Enter or exit
    pub phase: VisibilityPhase,
    /// Intersection ratio reported at the transition (0-1)
    pub ratio: f64,
    /// Transition timestamp
    pub timestamp: DateTime<Utc>,
    /// Element metadata snapshot, when provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ElementMeta>,
}

/// Classification of a structural page change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    ChildList,
    Attribute,
    Text,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::ChildList => "child_list",
            ChangeKind::Attribute => "attribute",
            ChangeKind::Text => "text",
        }
    }
}

/// A raw structural-change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralChange {
    /// Kind of change
    pub kind: ChangeKind,
    /// Stable key of the changed element
    pub target: String,
    /// Notification timestamp
    pub timestamp: DateTime<Utc>,
    /// Changed attribute name (attribute changes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    /// Previous value (attribute and text changes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    /// New value (attribute and text changes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    /// Keys of elements added under the target (child-list changes)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    /// Keys of elements removed from under the target (child-list changes)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

/// A raw interaction event, tagged by source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEvent {
    Click(ClickEvent),
    Scroll(ScrollSample),
    Visibility(VisibilityTransition),
    Mutation(StructuralChange),
}

impl RawEvent {
    /// Timestamp carried by the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RawEvent::Click(e) => e.timestamp,
            RawEvent::Scroll(e) => e.timestamp,
            RawEvent::Visibility(e) => e.timestamp,
            RawEvent::Mutation(e) => e.timestamp,
        }
    }
}

/// One click as retained by the click analyzer's indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickSample {
    pub x: f64,
    pub y: f64,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ClickEvent> for ClickSample {
    fn from(event: &ClickEvent) -> Self {
        Self {
            x: event.x,
            y: event.y,
            target: event.target.clone(),
            timestamp: event.timestamp,
        }
    }
}

/// A detected burst of rapid clicks in a small radius
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RageClickEvent {
    /// Location of the click that completed the cluster
    pub x: f64,
    pub y: f64,
    /// Element key of the completing click
    pub target: String,
    /// Number of clicks in the cluster
    pub click_count: u32,
    /// When the cluster was detected
    pub timestamp: DateTime<Utc>,
    /// Span from the earliest clustered click to the latest (ms)
    pub duration_ms: i64,
    /// The contributing clicks
    pub clicks: Vec<ClickSample>,
}

/// Scroll movement direction between two samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Down,
    Up,
    None,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Down => "down",
            ScrollDirection::Up => "up",
            ScrollDirection::None => "none",
        }
    }
}

/// Velocity-based classification of a scroll segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollPace {
    /// Below the slow threshold: attentive reading
    Reading,
    /// Between the thresholds: moderate scanning
    Scanning,
    /// Above the fast threshold: rapid searching
    Searching,
}

impl ScrollPace {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollPace::Reading => "reading",
            ScrollPace::Scanning => "scanning",
            ScrollPace::Searching => "searching",
        }
    }
}

/// An enriched scroll sample as stored in the metrics data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollPoint {
    pub offset: f64,
    pub percent: f64,
    /// Velocity in px/s; zero when the sample gap rounds to zero
    pub velocity: f64,
    pub direction: ScrollDirection,
    pub pace: ScrollPace,
    pub timestamp: DateTime<Utc>,
}

/// A scroll-depth milestone crossing, reported once per tracker lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneEvent {
    /// The configured percentage that was crossed
    pub milestone: u8,
    /// When it was crossed
    pub timestamp: DateTime<Utc>,
    /// Time from the first scroll session's start (ms)
    pub time_to_reach_ms: i64,
    /// Scroll offset at the crossing
    pub offset: f64,
}

/// A scroll direction reversal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionChange {
    pub from: ScrollDirection,
    pub to: ScrollDirection,
    /// Total reversals seen so far this session
    pub total_changes: u32,
    pub timestamp: DateTime<Utc>,
}

/// Live progress of an open viewing session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellProgress {
    pub target: String,
    /// Cumulative dwell including the running session (ms)
    pub total_ms: i64,
    /// Running duration of the open session (ms)
    pub current_session_ms: i64,
    /// Number of viewing sessions so far, including the open one
    pub session_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// A finalized dwell record for an element that met the minimum visible time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellRecord {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ElementMeta>,
    /// Cumulative visible time across all closed sessions (ms)
    pub total_ms: i64,
    pub session_count: u32,
    /// Longest single session (ms)
    pub max_session_ms: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// A classified structural-change record held for batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub kind: ChangeKind,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

/// A debounce-coalesced group of mutation records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// When the batch was flushed
    pub timestamp: DateTime<Utc>,
    /// Number of member records
    pub count: u32,
    /// Members in arrival order
    pub records: Vec<MutationRecord>,
}

/// A dynamically added element that matches the trackable criteria
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackableElement {
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

/// An outbound delivery failure after retries were exhausted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportFailure {
    pub error: String,
    /// Attempts made before giving up
    pub attempts: u32,
    /// Payloads still waiting in the outbound queue
    pub pending: usize,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_raw_event_click_round_trip() {
        let event = RawEvent::Click(ClickEvent {
            x: 120.0,
            y: 340.5,
            screen_x: 120.0,
            screen_y: 440.5,
            target: "#buy-button".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"click\""));

        let parsed: RawEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_raw_event_mutation_deserialization() {
        let json = r#"{
            "type": "mutation",
            "kind": "child_list",
            "target": "main",
            "timestamp": "2024-03-01T10:00:00Z",
            "added": ["card-1", "card-2"]
        }"#;

        let event: RawEvent = serde_json::from_str(json).unwrap();
        match event {
            RawEvent::Mutation(change) => {
                assert_eq!(change.kind, ChangeKind::ChildList);
                assert_eq!(change.added, vec!["card-1", "card-2"]);
                assert!(change.removed.is_empty());
                assert!(change.attribute_name.is_none());
            }
            other => panic!("expected mutation, got {:?}", other),
        }
    }

    #[test]
    fn test_scroll_pace_serialization() {
        let json = serde_json::to_string(&ScrollPace::Searching).unwrap();
        assert_eq!(json, "\"searching\"");
        assert_eq!(ScrollPace::Reading.as_str(), "reading");
    }

    #[test]
    fn test_visibility_transition_without_meta() {
        let json = r#"{
            "target": "hero",
            "phase": "enter",
            "ratio": 0.75,
            "timestamp": "2024-03-01T10:00:00Z"
        }"#;

        let transition: VisibilityTransition = serde_json::from_str(json).unwrap();
        assert_eq!(transition.phase, VisibilityPhase::Enter);
        assert!(transition.meta.is_none());
    }

    #[test]
    fn test_raw_event_timestamp_accessor() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let event = RawEvent::Scroll(ScrollSample {
            offset: 400.0,
            percent: 40.0,
            timestamp: ts,
        });
        assert_eq!(event.timestamp(), ts);
    }
}
