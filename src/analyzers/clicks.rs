//! Spatial click analysis
//!
//! Maintains a grid heatmap, per-element click counters and a sliding time
//! window for frustration detection. Heatmap intensity is relative to the
//! current maximum cell count and is recomputed across all cells on every
//! click, so previously reported intensities shift as new data arrives.

use crate::analyzers::{Analyzer, AnalyzerContext};
use crate::bus::{Signal, Topic};
use crate::config::ClickConfig;
use crate::error::TrackError;
use crate::events::{ClickEvent, ClickSample, RageClickEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const NAME: &str = "clicks";
const TOPICS: &[Topic] = &[Topic::ClickRegistered];

/// One heatmap grid cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapCell {
    /// Grid coordinates (page coordinates divided by the grid size)
    pub cell_x: i64,
    pub cell_y: i64,
    /// Page-coordinate origin of the cell (px)
    pub x: f64,
    pub y: f64,
    /// Cell span (px)
    pub width: f64,
    pub height: f64,
    /// Clicks landed in this cell
    pub count: u64,
    /// Contributing samples in arrival order
    pub clicks: Vec<ClickSample>,
    /// 0-100, relative to the current maximum cell count
    pub intensity: u8,
}

/// Per-element click accumulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementClickStat {
    pub target: String,
    pub count: u64,
    pub first_click: DateTime<Utc>,
    pub last_click: DateTime<Utc>,
    pub clicks: Vec<ClickSample>,
}

/// RGBA color for heatmap visualization consumers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub alpha: f32,
}

/// One cell prepared for rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapPoint {
    pub x: f64,
    pub y: f64,
    pub value: u64,
    pub intensity: u8,
    /// Intensity relative to the hottest cell's intensity (0-1)
    pub normalized: f64,
    pub color: HeatColor,
}

/// Click totals and leaders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickStats {
    pub total_clicks: u64,
    pub total_rage_clicks: u64,
    pub rage_click_pct: f64,
    pub unique_elements: usize,
    pub heatmap_cells: usize,
    pub top_element: Option<ElementClickStat>,
    pub top_zone: Option<HeatmapCell>,
}

/// A just-emitted cluster still absorbing trailing clicks of the same burst
struct ActiveCluster {
    x: f64,
    y: f64,
    last_click: DateTime<Utc>,
}

/// Consumes click events; owns the heatmap, element index and rage window
pub struct ClickAnalyzer {
    config: ClickConfig,
    heatmap: HashMap<(i64, i64), HeatmapCell>,
    elements: HashMap<String, ElementClickStat>,
    window: Vec<ClickSample>,
    active_cluster: Option<ActiveCluster>,
    total_clicks: u64,
    total_rage_clicks: u64,
}

impl ClickAnalyzer {
    pub fn new(config: ClickConfig) -> Result<Self, TrackError> {
        config.validate()?;
        Ok(Self {
            config,
            heatmap: HashMap::new(),
            elements: HashMap::new(),
            window: Vec::new(),
            active_cluster: None,
            total_clicks: 0,
            total_rage_clicks: 0,
        })
    }

    fn process(&mut self, event: &ClickEvent, cx: &mut AnalyzerContext<'_>) {
        self.total_clicks += 1;
        cx.metrics.clicks.push(event.clone());

        self.update_heatmap(event);
        self.track_element(event);
        self.detect_rage(event, cx);
    }

    fn update_heatmap(&mut self, event: &ClickEvent) {
        let grid = self.config.grid_size;
        let cell_x = (event.x / grid).floor() as i64;
        let cell_y = (event.y / grid).floor() as i64;

        let cell = self
            .heatmap
            .entry((cell_x, cell_y))
            .or_insert_with(|| HeatmapCell {
                cell_x,
                cell_y,
                x: cell_x as f64 * grid,
                y: cell_y as f64 * grid,
                width: grid,
                height: grid,
                count: 0,
                clicks: Vec::new(),
                intensity: 0,
            });
        cell.count += 1;
        cell.clicks.push(ClickSample::from(event));

        // Renormalize every cell against the new global maximum; O(cells)
        // per click, acceptable at the expected cell cardinality.
        let max = self.heatmap.values().map(|c| c.count).max().unwrap_or(1);
        for cell in self.heatmap.values_mut() {
            cell.intensity = ((cell.count as f64 / max as f64) * 100.0).round().min(100.0) as u8;
        }
    }

    fn track_element(&mut self, event: &ClickEvent) {
        let stat = self
            .elements
            .entry(event.target.clone())
            .or_insert_with(|| ElementClickStat {
                target: event.target.clone(),
                count: 0,
                first_click: event.timestamp,
                last_click: event.timestamp,
                clicks: Vec::new(),
            });
        stat.count += 1;
        stat.last_click = event.timestamp;
        stat.clicks.push(ClickSample::from(event));
    }

    fn detect_rage(&mut self, event: &ClickEvent, cx: &mut AnalyzerContext<'_>) {
        let now = event.timestamp;
        let sample = ClickSample::from(event);

        // Trailing clicks of an already-reported burst extend the recorded
        // cluster instead of seeding a new one, so one burst yields one alert
        // whose final click_count covers the whole burst.
        if let Some(cluster) = &self.active_cluster {
            let in_window = (now - cluster.last_click).num_milliseconds()
                < self.config.rage_window_ms;
            let in_radius = distance(cluster.x, cluster.y, sample.x, sample.y)
                < self.config.rage_radius_px;
            if in_window && in_radius {
                if let Some(record) = cx.metrics.rage_clicks.last_mut() {
                    record.click_count += 1;
                    record.duration_ms = (now - record.clicks[0].timestamp).num_milliseconds();
                    record.clicks.push(sample);
                }
                self.active_cluster = Some(ActiveCluster {
                    x: event.x,
                    y: event.y,
                    last_click: now,
                });
                return;
            }
            self.active_cluster = None;
        }

        self.window.push(sample);
        self.window
            .retain(|c| (now - c.timestamp).num_milliseconds() < self.config.rage_window_ms);

        let nearby: Vec<usize> = self
            .window
            .iter()
            .enumerate()
            .filter(|(_, c)| distance(c.x, c.y, event.x, event.y) < self.config.rage_radius_px)
            .map(|(i, _)| i)
            .collect();

        if nearby.len() >= self.config.rage_threshold {
            let clicks: Vec<ClickSample> =
                nearby.iter().map(|&i| self.window[i].clone()).collect();
            let rage = RageClickEvent {
                x: event.x,
                y: event.y,
                target: event.target.clone(),
                click_count: clicks.len() as u32,
                timestamp: now,
                duration_ms: (now - clicks[0].timestamp).num_milliseconds(),
                clicks,
            };

            log::warn!(
                "rage click on '{}': {} clicks in {}ms",
                rage.target,
                rage.click_count,
                rage.duration_ms
            );

            self.total_rage_clicks += 1;
            cx.metrics.rage_clicks.push(rage.clone());
            cx.out.emit(Signal::RageDetected(rage));

            // Consume the cluster so the same burst cannot re-trigger
            let mut keep = 0usize;
            self.window.retain(|_| {
                let retained = !nearby.contains(&keep);
                keep += 1;
                retained
            });
            self.active_cluster = Some(ActiveCluster {
                x: event.x,
                y: event.y,
                last_click: now,
            });
        }
    }

    /// Full heatmap, hottest cells first
    pub fn heatmap(&self) -> Vec<HeatmapCell> {
        let mut cells: Vec<HeatmapCell> = self.heatmap.values().cloned().collect();
        cells.sort_by(|a, b| b.count.cmp(&a.count).then(a.cell_key().cmp(&b.cell_key())));
        cells
    }

    /// Top `limit` cells by click count
    pub fn top_zones(&self, limit: usize) -> Vec<HeatmapCell> {
        let mut cells = self.heatmap();
        cells.truncate(limit);
        cells
    }

    /// Top `limit` elements by click count
    pub fn top_elements(&self, limit: usize) -> Vec<ElementClickStat> {
        let mut stats: Vec<ElementClickStat> = self.elements.values().cloned().collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then(a.target.cmp(&b.target)));
        stats.truncate(limit);
        stats
    }

    /// Totals and leaders
    pub fn stats(&self) -> ClickStats {
        let rage_click_pct = if self.total_clicks > 0 {
            (self.total_rage_clicks as f64 / self.total_clicks as f64) * 100.0
        } else {
            0.0
        };
        ClickStats {
            total_clicks: self.total_clicks,
            total_rage_clicks: self.total_rage_clicks,
            rage_click_pct,
            unique_elements: self.elements.len(),
            heatmap_cells: self.heatmap.len(),
            top_element: self.top_elements(1).into_iter().next(),
            top_zone: self.top_zones(1).into_iter().next(),
        }
    }

    /// Cells prepared for rendering, with colors on the four-band heat scale
    pub fn visualization(&self) -> Vec<HeatmapPoint> {
        let max_intensity = self
            .heatmap
            .values()
            .map(|c| c.intensity)
            .max()
            .unwrap_or(1)
            .max(1);

        self.heatmap()
            .into_iter()
            .map(|cell| HeatmapPoint {
                x: cell.x,
                y: cell.y,
                value: cell.count,
                intensity: cell.intensity,
                normalized: cell.intensity as f64 / max_intensity as f64,
                color: heat_color(cell.intensity),
            })
            .collect()
    }
}

impl HeatmapCell {
    fn cell_key(&self) -> (i64, i64) {
        (self.cell_x, self.cell_y)
    }
}

/// Map an intensity to the cold-to-hot four-band scale:
/// blue below 25, green below 50, yellow below 75, red above.
pub fn heat_color(intensity: u8) -> HeatColor {
    let i = intensity as f32;
    if intensity < 25 {
        HeatColor {
            r: 0,
            g: 0,
            b: 255,
            alpha: 0.2 + (i / 25.0) * 0.3,
        }
    } else if intensity < 50 {
        HeatColor {
            r: 0,
            g: 255,
            b: 0,
            alpha: 0.3 + ((i - 25.0) / 25.0) * 0.3,
        }
    } else if intensity < 75 {
        HeatColor {
            r: 255,
            g: 255,
            b: 0,
            alpha: 0.4 + ((i - 50.0) / 25.0) * 0.3,
        }
    } else {
        HeatColor {
            r: 255,
            g: 0,
            b: 0,
            alpha: 0.5 + ((i - 75.0) / 25.0) * 0.4,
        }
    }
}

fn distance(x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    (x2 - x1).hypot(y2 - y1)
}

impl Analyzer for ClickAnalyzer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn topics(&self) -> &'static [Topic] {
        TOPICS
    }

    fn start(&mut self, _cx: &mut AnalyzerContext<'_>) {
        log::debug!("click analyzer started");
    }

    fn stop(&mut self, _cx: &mut AnalyzerContext<'_>) -> Result<(), TrackError> {
        log::debug!(
            "click analyzer stopped: {} clicks, {} rage clicks",
            self.total_clicks,
            self.total_rage_clicks
        );
        Ok(())
    }

    fn clear(&mut self) {
        self.heatmap.clear();
        self.elements.clear();
        self.window.clear();
        self.active_cluster = None;
        self.total_clicks = 0;
        self.total_rage_clicks = 0;
    }

    fn on_signal(
        &mut self,
        signal: &Signal,
        cx: &mut AnalyzerContext<'_>,
    ) -> Result<(), TrackError> {
        if let Signal::Click(event) = signal {
            self.process(event, cx);
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

        fn feed(&mut self, analyzer: &mut ClickAnalyzer, event: &ClickEvent) -> Vec<Signal> {
            let mut cx = AnalyzerContext {
                now: event.timestamp,
                out: &mut self.out,
                scheduler: &mut self.scheduler,
                metrics: &mut self.store,
            };
            analyzer
                .on_signal(&Signal::Click(event.clone()), &mut cx)
                .unwrap();
            self.out.drain()
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn click(x: f64, y: f64, target: &str, offset_ms: i64) -> ClickEvent {
        ClickEvent {
            x,
            y,
            screen_x: x,
            screen_y: y,
            target: target.to_string(),
            timestamp: base_time() + Duration::milliseconds(offset_ms),
        }
    }

    #[test]
    fn test_rage_burst_of_four_yields_one_event_with_four_clicks() {
        let mut analyzer = ClickAnalyzer::new(ClickConfig::default()).unwrap();
        let mut harness = Harness::new();

        let mut signals = Vec::new();
        signals.extend(harness.feed(&mut analyzer, &click(100.0, 100.0, "#cta", 0)));
        signals.extend(harness.feed(&mut analyzer, &click(102.0, 101.0, "#cta", 150)));
        signals.extend(harness.feed(&mut analyzer, &click(98.0, 99.0, "#cta", 300)));
        signals.extend(harness.feed(&mut analyzer, &click(101.0, 100.0, "#cta", 450)));

        let rage_signals = signals
            .iter()
            .filter(|s| matches!(s, Signal::RageDetected(_)))
            .count();
        assert_eq!(rage_signals, 1);

        assert_eq!(harness.store.rage_clicks.len(), 1);
        let record = &harness.store.rage_clicks[0];
        assert_eq!(record.click_count, 4);
        assert_eq!(record.duration_ms, 450);
        assert_eq!(record.clicks.len(), 4);
    }

    #[test]
    fn test_rage_threshold_met_exactly() {
        let mut analyzer = ClickAnalyzer::new(ClickConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, &click(10.0, 10.0, "#a", 0));
        harness.feed(&mut analyzer, &click(12.0, 11.0, "#a", 100));
        let signals = harness.feed(&mut analyzer, &click(11.0, 9.0, "#a", 200));

        assert!(matches!(signals.as_slice(), [Signal::RageDetected(e)] if e.click_count == 3));
    }

    #[test]
    fn test_consumed_cluster_does_not_retrigger() {
        let mut analyzer = ClickAnalyzer::new(ClickConfig::default()).unwrap();
        let mut harness = Harness::new();

        for (i, offset) in [0, 100, 200].iter().enumerate() {
            harness.feed(&mut analyzer, &click(10.0 + i as f64, 10.0, "#a", *offset));
        }
        assert_eq!(harness.store.rage_clicks.len(), 1);

        // A fresh cluster must accumulate from scratch after the window has
        // moved past the burst
        harness.feed(&mut analyzer, &click(10.0, 10.0, "#a", 5000));
        harness.feed(&mut analyzer, &click(11.0, 10.0, "#a", 5100));
        assert_eq!(harness.store.rage_clicks.len(), 1);

        harness.feed(&mut analyzer, &click(12.0, 10.0, "#a", 5200));
        assert_eq!(harness.store.rage_clicks.len(), 2);
    }

    #[test]
    fn test_distant_clicks_never_cluster() {
        let mut analyzer = ClickAnalyzer::new(ClickConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, &click(0.0, 0.0, "#a", 0));
        harness.feed(&mut analyzer, &click(200.0, 0.0, "#b", 100));
        harness.feed(&mut analyzer, &click(400.0, 0.0, "#c", 200));
        harness.feed(&mut analyzer, &click(600.0, 0.0, "#d", 300));

        assert!(harness.store.rage_clicks.is_empty());
    }

    #[test]
    fn test_window_prunes_old_clicks() {
        let mut analyzer = ClickAnalyzer::new(ClickConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, &click(10.0, 10.0, "#a", 0));
        harness.feed(&mut analyzer, &click(11.0, 10.0, "#a", 2500));
        harness.feed(&mut analyzer, &click(12.0, 10.0, "#a", 5000));

        // Clicks are close in space but each pair is outside the time window
        assert!(harness.store.rage_clicks.is_empty());
    }

    #[test]
    fn test_max_count_cell_has_full_intensity() {
        let mut analyzer = ClickAnalyzer::new(ClickConfig::default()).unwrap();
        let mut harness = Harness::new();

        // Three clicks in one cell, one in another; spaced outside the rage
        // window so frustration detection stays quiet
        harness.feed(&mut analyzer, &click(10.0, 10.0, "#a", 0));
        harness.feed(&mut analyzer, &click(20.0, 20.0, "#a", 3000));
        harness.feed(&mut analyzer, &click(30.0, 10.0, "#a", 6000));
        harness.feed(&mut analyzer, &click(500.0, 500.0, "#b", 9000));

        let cells = analyzer.heatmap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].count, 3);
        assert_eq!(cells[0].intensity, 100);
        // The smaller cell's intensity shifted retroactively
        assert_eq!(cells[1].count, 1);
        assert_eq!(cells[1].intensity, 33);
        assert!(cells.iter().all(|c| c.intensity <= 100));
    }

    #[test]
    fn test_top_elements_sorted_by_count() {
        let mut analyzer = ClickAnalyzer::new(ClickConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, &click(10.0, 10.0, "#a", 0));
        harness.feed(&mut analyzer, &click(300.0, 300.0, "#b", 3000));
        harness.feed(&mut analyzer, &click(600.0, 600.0, "#b", 6000));

        let top = analyzer.top_elements(10);
        assert_eq!(top[0].target, "#b");
        assert_eq!(top[0].count, 2);
        assert_eq!(top[1].target, "#a");

        let stats = analyzer.stats();
        assert_eq!(stats.total_clicks, 3);
        assert_eq!(stats.unique_elements, 2);
        assert_eq!(stats.top_element.unwrap().target, "#b");
    }

    #[test]
    fn test_heat_color_bands() {
        assert_eq!(heat_color(10).b, 255);
        assert_eq!(heat_color(30).g, 255);
        let yellow = heat_color(60);
        assert_eq!((yellow.r, yellow.g, yellow.b), (255, 255, 0));
        assert_eq!(heat_color(90).r, 255);
        assert!((heat_color(100).alpha - 0.9).abs() < 0.001);
    }

    #[test]
    fn test_clear_resets_indices() {
        let mut analyzer = ClickAnalyzer::new(ClickConfig::default()).unwrap();
        let mut harness = Harness::new();

        harness.feed(&mut analyzer, &click(10.0, 10.0, "#a", 0));
        analyzer.clear();

        assert!(analyzer.heatmap().is_empty());
        assert_eq!(analyzer.stats().total_clicks, 0);
    }
}
