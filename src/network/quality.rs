//! Named quality presets and the automatic downgrade/upgrade policy

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    #[default]
    High,
    Max,
}

impl QualityPreset {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Max];

    /// Target resolution requested from the remote peer
    pub fn resolution(self) -> (u32, u32) {
        match self {
            Self::Low => (640, 360),
            Self::Medium => (960, 540),
            Self::High => (1280, 720),
            Self::Max => (1920, 1080),
        }
    }

    /// Frame-rate ceiling
    pub fn max_fps(self) -> f32 {
        match self {
            Self::Low => 15.0,
            Self::Medium => 24.0,
            Self::High => 30.0,
            Self::Max => 60.0,
        }
    }

    pub fn lower(self) -> Option<Self> {
        match self {
            Self::Low => None,
            Self::Medium => Some(Self::Low),
            Self::High => Some(Self::Medium),
            Self::Max => Some(Self::High),
        }
    }

    pub fn higher(self) -> Option<Self> {
        match self {
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => Some(Self::Max),
            Self::Max => None,
        }
    }
}

impl std::str::FromStr for QualityPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "max" => Ok(Self::Max),
            other => Err(format!("unknown quality preset {other:?}")),
        }
    }
}

/// Thresholds for automatic quality control.
///
/// Ratios are relative to the effective preferred frame rate, which is the
/// configured rate capped by the active preset's ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityPolicy {
    pub downgrade_ratio: f32,
    pub upgrade_ratio: f32,
    /// Consecutive unhealthy windows before stepping down
    pub downgrade_windows: u32,
    /// Consecutive healthy windows before stepping up
    pub upgrade_windows: u32,
    pub window_ms: u64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            downgrade_ratio: 0.5,
            upgrade_ratio: 0.9,
            downgrade_windows: 3,
            upgrade_windows: 10,
            window_ms: 1000,
        }
    }
}

/// Hysteresis state machine over per-window FPS measurements
#[derive(Debug, Clone)]
pub struct QualityController {
    policy: QualityPolicy,
    preferred_fps: f32,
    preset: QualityPreset,
    low_windows: u32,
    healthy_windows: u32,
}

impl QualityController {
    pub fn new(policy: QualityPolicy, preferred_fps: f32, preset: QualityPreset) -> Self {
        Self {
            policy,
            preferred_fps,
            preset,
            low_windows: 0,
            healthy_windows: 0,
        }
    }

    pub fn preset(&self) -> QualityPreset {
        self.preset
    }

    /// Follow a preset chosen elsewhere and start counting afresh.
    pub fn set_preset(&mut self, preset: QualityPreset) {
        self.preset = preset;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.low_windows = 0;
        self.healthy_windows = 0;
    }

    fn target_fps(&self) -> f32 {
        self.preferred_fps.min(self.preset.max_fps())
    }

    /// Feed one window's FPS. Returns the new preset when it changes.
    pub fn observe(&mut self, fps: f32) -> Option<QualityPreset> {
        let target = self.target_fps();

        if fps < target * self.policy.downgrade_ratio {
            self.healthy_windows = 0;
            self.low_windows += 1;
            if self.low_windows >= self.policy.downgrade_windows {
                return self.step(self.preset.lower());
            }
        } else if fps >= target * self.policy.upgrade_ratio {
            self.low_windows = 0;
            self.healthy_windows += 1;
            if self.healthy_windows >= self.policy.upgrade_windows {
                return self.step(self.preset.higher());
            }
        } else {
            // Neither clearly bad nor clearly good: a breach must be sustained
            self.reset();
        }
        None
    }

    fn step(&mut self, next: Option<QualityPreset>) -> Option<QualityPreset> {
        self.reset();
        let next = next?;
        debug!(from = ?self.preset, to = ?next, "quality controller stepped");
        self.preset = next;
        Some(next)
    }
}

/// Counts frames over fixed windows and reports each closed window's FPS
#[derive(Debug, Clone)]
pub struct FpsWindow {
    length: Duration,
    started: Option<Instant>,
    frames: u32,
}

impl FpsWindow {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            started: None,
            frames: 0,
        }
    }

    pub fn record(&mut self, now: Instant) -> Option<f32> {
        let started = *self.started.get_or_insert(now);
        self.frames += 1;

        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.length {
            return None;
        }
        let fps = self.frames as f32 / elapsed.as_secs_f32();
        self.started = Some(now);
        self.frames = 0;
        Some(fps)
    }

    pub fn reset(&mut self) {
        self.started = None;
        self.frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> QualityController {
        QualityController::new(QualityPolicy::default(), 30.0, QualityPreset::High)
    }

    #[test]
    fn downgrades_once_per_sustained_breach() {
        let mut qc = controller();
        let trace = [10.0, 10.0, 10.0, 10.0, 10.0, 29.0, 29.0];
        let changes: Vec<_> = trace.iter().filter_map(|&fps| qc.observe(fps)).collect();
        assert_eq!(changes, vec![QualityPreset::Medium]);
    }

    #[test]
    fn two_bad_windows_are_not_a_breach() {
        let mut qc = controller();
        for _ in 0..20 {
            assert_eq!(qc.observe(10.0), None);
            assert_eq!(qc.observe(10.0), None);
            assert_eq!(qc.observe(20.0), None);
        }
        assert_eq!(qc.preset(), QualityPreset::High);
    }

    #[test]
    fn hovering_at_threshold_does_not_oscillate() {
        let mut qc = controller();
        let mut changes = 0;
        for i in 0..200 {
            let fps = if i % 2 == 0 { 14.5 } else { 15.5 };
            changes += qc.observe(fps).is_some() as u32;
        }
        assert_eq!(changes, 0);
    }

    #[test]
    fn upgrade_needs_a_longer_healthy_run() {
        let mut qc = QualityController::new(QualityPolicy::default(), 30.0, QualityPreset::Medium);
        for _ in 0..9 {
            assert_eq!(qc.observe(24.0), None);
        }
        assert_eq!(qc.observe(24.0), Some(QualityPreset::High));
        assert_eq!(qc.observe(30.0), None);
    }

    #[test]
    fn stays_put_at_the_ends() {
        let mut qc = QualityController::new(QualityPolicy::default(), 30.0, QualityPreset::Low);
        for _ in 0..6 {
            assert_eq!(qc.observe(1.0), None);
        }
        assert_eq!(qc.preset(), QualityPreset::Low);
    }

    #[test]
    fn window_reports_fps_when_closed() {
        let mut window = FpsWindow::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        let mut reported = None;
        for i in 0..=20u64 {
            if let Some(fps) = window.record(t0 + Duration::from_millis(i * 50)) {
                reported = Some(fps);
            }
        }
        let fps = reported.unwrap();
        assert!((fps - 21.0).abs() < 0.01, "{fps}");
    }

    #[test]
    fn presets_parse_by_name() {
        assert_eq!("MAX".parse::<QualityPreset>(), Ok(QualityPreset::Max));
        assert!("ultra".parse::<QualityPreset>().is_err());
    }
}
