//! Analyzer and engine configuration
//!
//! Every knob the engine exposes lives here. Configs are validated at
//! construction time so a malformed setup fails at registration, never
//! mid-stream.

use crate::error::TrackError;
use serde::{Deserialize, Serialize};

fn positive_ms(value: i64, field: &str) -> Result<(), TrackError> {
    if value <= 0 {
        return Err(TrackError::InvalidConfig(format!(
            "{} must be positive, got {}",
            field, value
        )));
    }
    Ok(())
}

/// Click analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickConfig {
    /// Clicks within window and radius required to flag frustration
    pub rage_threshold: usize,
    /// Sliding time window for frustration detection (ms)
    pub rage_window_ms: i64,
    /// Spatial radius for frustration detection (px)
    pub rage_radius_px: f64,
    /// Heatmap grid cell size (px)
    pub grid_size: f64,
}

impl Default for ClickConfig {
    fn default() -> Self {
        Self {
            rage_threshold: 3,
            rage_window_ms: 2000,
            rage_radius_px: 50.0,
            grid_size: 50.0,
        }
    }
}

impl ClickConfig {
    pub fn validate(&self) -> Result<(), TrackError> {
        if self.rage_threshold < 2 {
            return Err(TrackError::InvalidConfig(format!(
                "rage_threshold must be at least 2, got {}",
                self.rage_threshold
            )));
        }
        positive_ms(self.rage_window_ms, "rage_window_ms")?;
        if !(self.rage_radius_px.is_finite() && self.rage_radius_px > 0.0) {
            return Err(TrackError::InvalidConfig(
                "rage_radius_px must be a positive finite number".to_string(),
            ));
        }
        if !(self.grid_size.is_finite() && self.grid_size > 0.0) {
            return Err(TrackError::InvalidConfig(
                "grid_size must be a positive finite number".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scroll analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    /// Depth percentages reported once per tracker lifetime
    pub milestones: Vec<u8>,
    /// Velocity below which a segment counts as reading (px/s)
    pub slow_threshold: f64,
    /// Velocity above which a segment counts as searching (px/s)
    pub fast_threshold: f64,
    /// Upstream sample interval, informational for consumers (ms)
    pub sample_interval_ms: i64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            milestones: vec![25, 50, 75, 90, 100],
            slow_threshold: 100.0,
            fast_threshold: 500.0,
            sample_interval_ms: 100,
        }
    }
}

impl ScrollConfig {
    pub fn validate(&self) -> Result<(), TrackError> {
        if !(self.slow_threshold.is_finite() && self.slow_threshold > 0.0) {
            return Err(TrackError::InvalidConfig(
                "slow_threshold must be a positive finite number".to_string(),
            ));
        }
        if !(self.fast_threshold.is_finite() && self.fast_threshold > self.slow_threshold) {
            return Err(TrackError::InvalidConfig(format!(
                "fast_threshold must exceed slow_threshold ({} <= {})",
                self.fast_threshold, self.slow_threshold
            )));
        }
        for &milestone in &self.milestones {
            if milestone == 0 || milestone > 100 {
                return Err(TrackError::InvalidConfig(format!(
                    "milestones must be in 1..=100, got {}",
                    milestone
                )));
            }
        }
        positive_ms(self.sample_interval_ms, "sample_interval_ms")?;
        Ok(())
    }
}

/// Visibility analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Intersection ratio the acquisition layer reports transitions at (0-1)
    pub ratio_threshold: f64,
    /// Minimum cumulative dwell before a record surfaces (ms)
    pub min_visible_ms: i64,
    /// Progress tick interval while an element is visible (ms)
    pub update_interval_ms: i64,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            ratio_threshold: 0.5,
            min_visible_ms: 1000,
            update_interval_ms: 1000,
        }
    }
}

impl VisibilityConfig {
    pub fn validate(&self) -> Result<(), TrackError> {
        if !(self.ratio_threshold.is_finite()
            && self.ratio_threshold > 0.0
            && self.ratio_threshold <= 1.0)
        {
            return Err(TrackError::InvalidConfig(
                "ratio_threshold must be in (0, 1]".to_string(),
            ));
        }
        positive_ms(self.min_visible_ms, "min_visible_ms")?;
        positive_ms(self.update_interval_ms, "update_interval_ms")?;
        Ok(())
    }
}

/// Mutation aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Quiet period before the pending queue flushes as one batch (ms)
    pub debounce_ms: i64,
    /// Attribute changes are only tracked for these names; empty tracks all
    pub attribute_filter: Vec<String>,
    /// An added element key containing any marker is announced immediately
    pub trackable_markers: Vec<String>,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            attribute_filter: vec!["class".to_string(), "style".to_string()],
            trackable_markers: vec![
                "data-track".to_string(),
                "article".to_string(),
                "section".to_string(),
                "product-card".to_string(),
            ],
        }
    }
}

impl MutationConfig {
    pub fn validate(&self) -> Result<(), TrackError> {
        positive_ms(self.debounce_ms, "debounce_ms")
    }
}

/// Outbound retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Send attempts before a payload is surfaced as failed
    pub max_attempts: u32,
    /// Delay before the first retry (ms)
    pub base_delay_ms: i64,
    /// Backoff multiplier applied per attempt
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), TrackError> {
        if self.max_attempts == 0 {
            return Err(TrackError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        positive_ms(self.base_delay_ms, "base_delay_ms")?;
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(TrackError::InvalidConfig(
                "multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Publish a metrics snapshot on a fixed interval while tracking
    pub auto_export: bool,
    /// Auto-export interval (ms)
    pub export_interval_ms: i64,
    /// Retry policy for the optional outbound sink
    pub retry: RetryConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            auto_export: false,
            export_interval_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), TrackError> {
        positive_ms(self.export_interval_ms, "export_interval_ms")?;
        self.retry.validate()
    }
}
