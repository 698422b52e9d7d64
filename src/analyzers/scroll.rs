//! Scroll behavior analysis
//!
//! Derives velocity, direction and pace from raw scroll samples, records
//! once-per-lifetime depth milestones, buckets activity into sessions and
//! classifies the overall behavior pattern with a rule chain.

use crate::analyzers::{Analyzer, AnalyzerContext};
use crate::bus::{Signal, Topic};
use crate::config::ScrollConfig;
use crate::error::TrackError;
use crate::events::{
    DirectionChange, MilestoneEvent, ScrollDirection, ScrollPace, ScrollPoint, ScrollSample,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const NAME: &str = "scroll";
const TOPICS: &[Topic] = &[Topic::ScrollSampled];

/// One continuous scroll episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollSession {
    pub start_time: DateTime<Utc>,
    pub start_offset: f64,
    /// None while the session is open
    pub end_time: Option<DateTime<Utc>>,
    pub end_offset: Option<f64>,
    /// Deepest percentage reached during the session
    pub max_depth: f64,
    /// Cumulative traveled distance (px)
    pub total_distance: f64,
    pub samples: Vec<ScrollPoint>,
    pub milestones: Vec<MilestoneEvent>,
    /// Average velocity over non-zero samples, computed at session end
    pub avg_velocity: f64,
    /// Mode of the session's sample paces, computed at session end
    pub dominant_pace: Option<ScrollPace>,
}

/// Counts of samples per pace bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaceCounts {
    pub reading: u64,
    pub scanning: u64,
    pub searching: u64,
}

impl PaceCounts {
    fn bump(&mut self, pace: ScrollPace) {
        match pace {
            ScrollPace::Reading => self.reading += 1,
            ScrollPace::Scanning => self.scanning += 1,
            ScrollPace::Searching => self.searching += 1,
        }
    }

    /// First pace bucket holding the maximum count, in reading, scanning,
    /// searching order; None when no samples were classified
    fn dominant(&self) -> Option<ScrollPace> {
        let buckets = [
            (ScrollPace::Reading, self.reading),
            (ScrollPace::Scanning, self.scanning),
            (ScrollPace::Searching, self.searching),
        ];
        let mut best: Option<(ScrollPace, u64)> = None;
        for (pace, count) in buckets {
            if count > 0 && best.map_or(true, |(_, max)| count > max) {
                best = Some((pace, count));
            }
        }
        best.map(|(pace, _)| pace)
    }
}

/// Aggregate scroll statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollStats {
    /// Deepest percentage reached over the tracker lifetime
    pub max_depth: f64,
    /// Reached milestones in ascending order
    pub milestones_reached: Vec<u8>,
    pub total_samples: u64,
    /// Average velocity over all non-zero samples (px/s)
    pub avg_velocity: f64,
    pub pace_counts: PaceCounts,
    pub dominant_pace: Option<ScrollPace>,
    pub direction_changes: u32,
    pub session_count: usize,
    /// 100 once the bottom milestone is reached, otherwise the max depth
    pub completion_rate: f64,
}

/// Engagement level attached to a behavior pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engagement {
    Low,
    Medium,
    High,
}

/// Rule-based classification of the overall scroll behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    EngagedReader,
    Scanner,
    Searcher,
    Bouncer,
    ReReader,
    Unknown,
}

/// Derived behavior pattern, recomputed on demand
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehaviorPattern {
    pub kind: PatternKind,
    pub engagement: Engagement,
    pub description: &'static str,
}

/// Digest of one session for timeline consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDigest {
    /// 1-based session index
    pub session: usize,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub max_depth: f64,
    pub total_distance: f64,
    pub samples: usize,
    pub milestones: usize,
}

/// Consumes scroll samples; owns sessions, milestones and direction state
pub struct ScrollAnalyzer {
    config: ScrollConfig,
    milestones: Vec<u8>,
    reached: BTreeSet<u8>,
    sessions: Vec<ScrollSession>,
    last_offset: f64,
    last_sample_time: Option<DateTime<Utc>>,
    last_direction: Option<ScrollDirection>,
    direction_changes: u32,
    max_depth: f64,
    first_session_start: Option<DateTime<Utc>>,
    pace_counts: PaceCounts,
    total_samples: u64,
    velocity_sum: f64,
    velocity_samples: u64,
}

impl ScrollAnalyzer {
    pub fn new(config: ScrollConfig) -> Result<Self, TrackError> {
        config.validate()?;
        let mut milestones = config.milestones.clone();
        milestones.sort_unstable();
        milestones.dedup();
        Ok(Self {
            config,
            milestones,
            reached: BTreeSet::new(),
            sessions: Vec::new(),
            last_offset: 0.0,
            last_sample_time: None,
            last_direction: None,
            direction_changes: 0,
            max_depth: 0.0,
            first_session_start: None,
            pace_counts: PaceCounts::default(),
            total_samples: 0,
            velocity_sum: 0.0,
            velocity_samples: 0,
        })
    }

    fn process(&mut self, sample: &ScrollSample, cx: &mut AnalyzerContext<'_>) {
        // A session opens on the first sample after a gap and stays open
        // until explicitly ended
        if !self.has_open_session() {
            self.open_session(sample);
        }

        let velocity = self.velocity(sample);
        let direction = self.direction(sample, cx);
        let pace = self.classify(velocity);

        if sample.percent > self.max_depth {
            self.max_depth = sample.percent;
        }

        self.check_milestones(sample, cx);

        let point = ScrollPoint {
            offset: sample.offset,
            percent: sample.percent,
            velocity,
            direction,
            pace,
            timestamp: sample.timestamp,
        };

        self.pace_counts.bump(pace);
        self.total_samples += 1;
        if velocity > 0.0 {
            self.velocity_sum += velocity;
            self.velocity_samples += 1;
        }

        let distance = (sample.offset - self.last_offset).abs();
        if let Some(session) = self.sessions.last_mut() {
            if sample.percent > session.max_depth {
                session.max_depth = sample.percent;
            }
            session.total_distance += distance;
            session.samples.push(point.clone());
        }

        cx.metrics.scroll.push(point);

        self.last_offset = sample.offset;
        self.last_sample_time = Some(sample.timestamp);
    }

    fn has_open_session(&self) -> bool {
        self.sessions.last().is_some_and(|s| s.end_time.is_none())
    }

    fn open_session(&mut self, sample: &ScrollSample) {
        if self.first_session_start.is_none() {
            self.first_session_start = Some(sample.timestamp);
        }
        // The opening sample is the velocity/direction reference point
        self.last_offset = sample.offset;
        self.last_sample_time = None;
        self.sessions.push(ScrollSession {
            start_time: sample.timestamp,
            start_offset: sample.offset,
            end_time: None,
            end_offset: None,
            max_depth: 0.0,
            total_distance: 0.0,
            samples: Vec::new(),
            milestones: Vec::new(),
            avg_velocity: 0.0,
            dominant_pace: None,
        });
    }

    /// Absolute distance per second; zero when the gap rounds to zero
    fn velocity(&self, sample: &ScrollSample) -> f64 {
        let Some(last_time) = self.last_sample_time else {
            return 0.0;
        };
        let elapsed_ms = (sample.timestamp - last_time).num_milliseconds();
        if elapsed_ms <= 0 {
            return 0.0;
        }
        (sample.offset - self.last_offset).abs() / (elapsed_ms as f64 / 1000.0)
    }

    fn direction(&mut self, sample: &ScrollSample, cx: &mut AnalyzerContext<'_>) -> ScrollDirection {
        let direction = if sample.offset > self.last_offset {
            ScrollDirection::Down
        } else if sample.offset < self.last_offset {
            ScrollDirection::Up
        } else {
            ScrollDirection::None
        };

        if let Some(previous) = self.last_direction {
            if direction != previous && direction != ScrollDirection::None {
                self.direction_changes += 1;
                cx.out.emit(Signal::DirectionChanged(DirectionChange {
                    from: previous,
                    to: direction,
                    total_changes: self.direction_changes,
                    timestamp: sample.timestamp,
                }));
            }
        }
        if direction != ScrollDirection::None {
            self.last_direction = Some(direction);
        }
        direction
    }

    fn classify(&self, velocity: f64) -> ScrollPace {
        if velocity < self.config.slow_threshold {
            ScrollPace::Reading
        } else if velocity < self.config.fast_threshold {
            ScrollPace::Scanning
        } else {
            ScrollPace::Searching
        }
    }

    fn check_milestones(&mut self, sample: &ScrollSample, cx: &mut AnalyzerContext<'_>) {
        let origin = self.first_session_start.unwrap_or(sample.timestamp);
        for milestone in self.milestones.clone() {
            if sample.percent >= milestone as f64 && !self.reached.contains(&milestone) {
                self.reached.insert(milestone);
                let event = MilestoneEvent {
                    milestone,
                    timestamp: sample.timestamp,
                    time_to_reach_ms: (sample.timestamp - origin).num_milliseconds(),
                    offset: sample.offset,
                };
                log::debug!("scroll milestone reached: {}%", milestone);
                if let Some(session) = self.sessions.last_mut() {
                    session.milestones.push(event.clone());
                }
                cx.out.emit(Signal::MilestoneReached(event));
            }
        }
    }

    /// Close the open session, computing its average velocity and dominant
    /// pace; a no-op when no session is open
    pub fn end_session(&mut self, now: DateTime<Utc>) {
        let last_offset = self.last_offset;
        let Some(session) = self.sessions.last_mut() else {
            return;
        };
        if session.end_time.is_some() {
            return;
        }
        session.end_time = Some(now);
        session.end_offset = Some(last_offset);

        let non_zero: Vec<f64> = session
            .samples
            .iter()
            .map(|s| s.velocity)
            .filter(|v| *v > 0.0)
            .collect();
        session.avg_velocity = if non_zero.is_empty() {
            0.0
        } else {
            non_zero.iter().sum::<f64>() / non_zero.len() as f64
        };

        let mut counts = PaceCounts::default();
        for sample in &session.samples {
            counts.bump(sample.pace);
        }
        session.dominant_pace = counts.dominant();
    }

    /// Aggregate statistics over the tracker lifetime
    pub fn stats(&self) -> ScrollStats {
        let avg_velocity = if self.velocity_samples > 0 {
            self.velocity_sum / self.velocity_samples as f64
        } else {
            0.0
        };
        let completion_rate = if self.reached.contains(&100) {
            100.0
        } else {
            self.max_depth
        };
        ScrollStats {
            max_depth: self.max_depth,
            milestones_reached: self.reached.iter().copied().collect(),
            total_samples: self.total_samples,
            avg_velocity,
            pace_counts: self.pace_counts,
            dominant_pace: self.pace_counts.dominant(),
            direction_changes: self.direction_changes,
            session_count: self.sessions.len(),
            completion_rate,
        }
    }

    /// Rule-based behavior pattern; first matching rule wins
    pub fn behavior_pattern(&self) -> BehaviorPattern {
        let stats = self.stats();
        let dominant = stats.dominant_pace;
        let depth = stats.max_depth;
        let flips = stats.direction_changes;

        if dominant == Some(ScrollPace::Reading) && depth > 75.0 {
            BehaviorPattern {
                kind: PatternKind::EngagedReader,
                engagement: Engagement::High,
                description: "reads the content attentively",
            }
        } else if dominant == Some(ScrollPace::Scanning) && depth > 50.0 {
            BehaviorPattern {
                kind: PatternKind::Scanner,
                engagement: Engagement::Medium,
                description: "scans the content for information",
            }
        } else if dominant == Some(ScrollPace::Searching) {
            BehaviorPattern {
                kind: PatternKind::Searcher,
                engagement: Engagement::Medium,
                description: "searches rapidly for specific content",
            }
        } else if depth < 25.0 && flips > 3 {
            BehaviorPattern {
                kind: PatternKind::Bouncer,
                engagement: Engagement::Low,
                description: "leaves quickly without engaging",
            }
        } else if flips > 5 && depth > 50.0 {
            BehaviorPattern {
                kind: PatternKind::ReReader,
                engagement: Engagement::High,
                description: "revisits content multiple times",
            }
        } else {
            BehaviorPattern {
                kind: PatternKind::Unknown,
                engagement: Engagement::Low,
                description: "no clear pattern",
            }
        }
    }

    /// Per-session digests; the open session's duration runs up to `now`
    pub fn timeline(&self, now: DateTime<Utc>) -> Vec<SessionDigest> {
        self.sessions
            .iter()
            .enumerate()
            .map(|(i, session)| SessionDigest {
                session: i + 1,
                start_time: session.start_time,
                duration_ms: (session.end_time.unwrap_or(now) - session.start_time)
                    .num_milliseconds(),
                max_depth: session.max_depth,
                total_distance: session.total_distance,
                samples: session.samples.len(),
                milestones: session.milestones.len(),
            })
            .collect()
    }

    /// All sessions, oldest first
    pub fn sessions(&self) -> &[ScrollSession] {
        &self.sessions
    }
}

impl Analyzer for ScrollAnalyzer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn topics(&self) -> &'static [Topic] {
        TOPICS
    }

    fn start(&mut self, _cx: &mut AnalyzerContext<'_>) {
        log::debug!("scroll analyzer started");
    }

    fn stop(&mut self, cx: &mut AnalyzerContext<'_>) -> Result<(), TrackError> {
        self.end_session(cx.now);
        log::debug!(
            "scroll analyzer stopped: {} samples, max depth {}%",
            self.total_samples,
            self.max_depth
        );
        Ok(())
    }

    fn clear(&mut self) {
        self.reached.clear();
        self.sessions.clear();
        self.last_offset = 0.0;
        self.last_sample_time = None;
        self.last_direction = None;
        self.direction_changes = 0;
        self.max_depth = 0.0;
        self.first_session_start = None;
        self.pace_counts = PaceCounts::default();
        self.total_samples = 0;
        self.velocity_sum = 0.0;
        self.velocity_samples = 0;
    }

    fn on_signal(
        &mut self,
        signal: &Signal,
        cx: &mut AnalyzerContext<'_>,
    ) -> Result<(), TrackError> {
        if let Signal::Scroll(sample) = signal {
            self.process(sample, cx);
        }
        Ok(())
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

        fn feed(&mut self, analyzer: &mut ScrollAnalyzer, sample: ScrollSample) -> Vec<Signal> {
            let mut cx = AnalyzerContext {
                now: sample.timestamp,
                out: &mut self.out,
                scheduler: &mut self.scheduler,
                metrics: &mut self.store,
            };
            analyzer
                .on_signal(&Signal::Scroll(sample), &mut cx)
                .unwrap();
            self.out.drain()
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn sample(offset: f64, percent: f64, offset_ms: i64) -> ScrollSample {
        ScrollSample {
            offset,
            percent,
            timestamp: base_time() + Duration::milliseconds(offset_ms),
        }
    }

    #[test]
    fn test_milestones_fire_once_each_in_ascending_order() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        let mut milestones = Vec::new();
        for (i, depth) in [10.0, 30.0, 60.0, 90.0, 100.0].iter().enumerate() {
            let signals = harness.feed(
                &mut analyzer,
                sample(depth * 10.0, *depth, i as i64 * 500),
            );
            for signal in signals {
                if let Signal::MilestoneReached(event) = signal {
                    milestones.push(event.milestone);
                }
            }
        }

        assert_eq!(milestones, vec![25, 50, 75, 90, 100]);
    }

    #[test]
    fn test_milestone_reported_once_per_lifetime() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        let mut fired = 0;
        for (i, depth) in [50.0, 0.0, 50.0].iter().enumerate() {
            let signals = harness.feed(&mut analyzer, sample(depth * 10.0, *depth, i as i64 * 500));
            fired += signals
                .iter()
                .filter(|s| {
                    matches!(s, Signal::MilestoneReached(e) if e.milestone == 25 || e.milestone == 50)
                })
                .count();
        }

        // 25 and 50 each fire exactly once despite the depth re-crossing them
        assert_eq!(fired, 2);
        assert_eq!(analyzer.stats().milestones_reached, vec![25, 50]);
    }

    #[test]
    fn test_velocity_and_pace_classification() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, sample(0.0, 0.0, 0));
        // 50 px over 1s: reading
        harness.feed(&mut analyzer, sample(50.0, 5.0, 1000));
        // 300 px over 1s: scanning
        harness.feed(&mut analyzer, sample(350.0, 35.0, 2000));
        // 700 px over 1s: searching
        harness.feed(&mut analyzer, sample(1050.0, 100.0, 3000));

        let points = &harness.store.scroll;
        assert_eq!(points[0].velocity, 0.0);
        assert_eq!(points[1].pace, ScrollPace::Reading);
        assert_eq!(points[2].pace, ScrollPace::Scanning);
        assert_eq!(points[3].pace, ScrollPace::Searching);
    }

    #[test]
    fn test_zero_gap_sample_has_zero_velocity() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, sample(0.0, 0.0, 0));
        harness.feed(&mut analyzer, sample(500.0, 50.0, 0));

        assert_eq!(harness.store.scroll[1].velocity, 0.0);
    }

    #[test]
    fn test_direction_change_counted_and_emitted() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, sample(0.0, 0.0, 0));
        harness.feed(&mut analyzer, sample(100.0, 10.0, 500));
        let signals = harness.feed(&mut analyzer, sample(50.0, 5.0, 1000));

        let change = signals
            .iter()
            .find_map(|s| match s {
                Signal::DirectionChanged(c) => Some(c.clone()),
                _ => None,
            })
            .expect("direction change emitted");
        assert_eq!(change.from, ScrollDirection::Down);
        assert_eq!(change.to, ScrollDirection::Up);
        assert_eq!(change.total_changes, 1);
    }

    #[test]
    fn test_session_dominant_pace_and_avg_velocity() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, sample(0.0, 0.0, 0));
        harness.feed(&mut analyzer, sample(50.0, 5.0, 1000));
        harness.feed(&mut analyzer, sample(100.0, 10.0, 2000));
        harness.feed(&mut analyzer, sample(400.0, 40.0, 3000));

        analyzer.end_session(base_time() + Duration::milliseconds(3000));

        let session = &analyzer.sessions()[0];
        assert_eq!(session.dominant_pace, Some(ScrollPace::Reading));
        // Non-zero velocities: 50, 50, 300
        assert!((session.avg_velocity - 400.0 / 3.0).abs() < 0.001);
        assert_eq!(session.end_offset, Some(400.0));
        assert_eq!(session.total_distance, 400.0);
    }

    #[test]
    fn test_new_session_opens_after_end() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, sample(0.0, 0.0, 0));
        analyzer.end_session(base_time() + Duration::milliseconds(500));
        harness.feed(&mut analyzer, sample(100.0, 10.0, 1000));

        assert_eq!(analyzer.stats().session_count, 2);
        assert!(analyzer.sessions()[0].end_time.is_some());
        assert!(analyzer.sessions()[1].end_time.is_none());
    }

    #[test]
    fn test_behavior_pattern_engaged_reader() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        // Slow steady descent to the bottom
        for i in 0..10 {
            harness.feed(
                &mut analyzer,
                sample(i as f64 * 90.0, i as f64 * 10.0, i * 1000),
            );
        }

        let pattern = analyzer.behavior_pattern();
        assert_eq!(pattern.kind, PatternKind::EngagedReader);
        assert_eq!(pattern.engagement, Engagement::High);
    }

    #[test]
    fn test_behavior_pattern_bouncer() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        // Slow shallow jitter: depth stays under 25 while direction flips
        let offsets = [0.0, 50.0, 10.0, 60.0, 20.0, 70.0, 5.0];
        for (i, offset) in offsets.iter().enumerate() {
            harness.feed(
                &mut analyzer,
                sample(*offset, offset / 10.0, i as i64 * 1000),
            );
        }

        let stats = analyzer.stats();
        assert!(stats.direction_changes > 3);
        assert!(stats.max_depth < 25.0);
        assert_eq!(analyzer.behavior_pattern().kind, PatternKind::Bouncer);
        assert_eq!(analyzer.behavior_pattern().engagement, Engagement::Low);
    }

    #[test]
    fn test_completion_rate_tracks_bottom_milestone() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, sample(0.0, 0.0, 0));
        harness.feed(&mut analyzer, sample(600.0, 60.0, 1000));
        assert_eq!(analyzer.stats().completion_rate, 60.0);

        harness.feed(&mut analyzer, sample(1000.0, 100.0, 2000));
        assert_eq!(analyzer.stats().completion_rate, 100.0);
    }

    #[test]
    fn test_clear_resets_milestones_and_sessions() {
        let mut analyzer = ScrollAnalyzer::new(ScrollConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, sample(500.0, 50.0, 0));
        analyzer.clear();

        let stats = analyzer.stats();
        assert!(stats.milestones_reached.is_empty());
        assert_eq!(stats.session_count, 0);
        assert_eq!(stats.max_depth, 0.0);
    }
}
