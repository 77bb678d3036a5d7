//! Policy Engine (C3, spec.md §4.3): mode selection by time-of-day/day-of-week,
//! per-mode thresholds/cooldown/concurrency, and per-node annotation
//! overrides. Configuration lives behind its own `std::sync::RwLock`,
//! independent of the utilization store's lock (spec.md §5) — reload via
//! `set_windows`/`set_default_mode` takes the write lock; decisions take the
//! read lock.

use chrono::{Datelike, Timelike, Utc, Weekday};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::BlockReason;

/// Scale-down operating mode (spec.md §4.3 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Aggressive,
    Balanced,
    Conservative,
    Disabled,
}

/// Per-mode thresholds and concurrency knobs (spec.md §4.3 table). `None`
/// fields for `Balanced` mean "use the configured (base) values".
#[derive(Debug, Clone, Copy)]
pub struct ModeProfile {
    pub cpu_threshold: Option<f64>,
    pub memory_threshold: Option<f64>,
    pub observation_window_secs: Option<u64>,
    pub max_concurrent_multiplier: Option<f64>,
    pub cooldown_multiplier: f64,
    pub extra_delay: bool,
}

fn profile_for(mode: Mode) -> ModeProfile {
    match mode {
        Mode::Aggressive => ModeProfile {
            cpu_threshold: Some(60.0),
            memory_threshold: Some(60.0),
            observation_window_secs: Some(5 * 60),
            max_concurrent_multiplier: Some(2.0),
            cooldown_multiplier: 1.0,
            extra_delay: false,
        },
        Mode::Balanced => ModeProfile {
            cpu_threshold: None,
            memory_threshold: None,
            observation_window_secs: None,
            max_concurrent_multiplier: None,
            cooldown_multiplier: 1.0,
            extra_delay: false,
        },
        Mode::Conservative => ModeProfile {
            cpu_threshold: Some(40.0),
            memory_threshold: Some(40.0),
            observation_window_secs: Some(20 * 60),
            max_concurrent_multiplier: None, // fixed at 1, handled separately
            cooldown_multiplier: 1.0,
            extra_delay: true,
        },
        Mode::Disabled => ModeProfile {
            cpu_threshold: Some(100.0),
            memory_threshold: Some(100.0),
            observation_window_secs: Some(24 * 60 * 60),
            max_concurrent_multiplier: None,
            cooldown_multiplier: 1.0,
            extra_delay: false,
        },
    }
}

/// A registered time window rule: applies on the given weekdays, between
/// `start_hour` and `end_hour` (local/UTC hour-of-day, 0-23). `start_hour >
/// end_hour` means the window wraps through midnight (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct TimeWindow {
    pub mode: Mode,
    pub days: Vec<Weekday>,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl TimeWindow {
    pub fn new(mode: Mode, days: Vec<Weekday>, start_hour: u32, end_hour: u32) -> Self {
        Self {
            mode,
            days,
            start_hour,
            end_hour,
        }
    }

    fn matches(&self, weekday: Weekday, hour: u32) -> bool {
        self.days.contains(&weekday) && hour_in_range(hour, self.start_hour, self.end_hour)
    }
}

/// `true` if `hour` falls in `[start, end)`, wrapping through midnight when
/// `start > end` (spec.md §4.3, §8 boundary behaviors).
fn hour_in_range(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Mutable policy configuration, reloadable via exported setters (spec.md §5).
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub base_cpu_threshold: f64,
    pub base_memory_threshold: f64,
    pub base_observation_window_secs: u64,
    pub base_cooldown_secs: u64,
    pub base_max_concurrent: usize,
    pub default_mode: Mode,
    pub windows: Vec<TimeWindow>,
}

impl PolicyConfig {
    pub fn from_engine_config(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            base_cpu_threshold: cfg.cpu_threshold_percent,
            base_memory_threshold: cfg.memory_threshold_percent,
            base_observation_window_secs: cfg.observation_window_secs,
            base_cooldown_secs: cfg.cooldown_secs,
            base_max_concurrent: cfg.max_drains_per_cycle,
            default_mode: Mode::Balanced,
            windows: Vec::new(),
        }
    }
}

/// Resolved thresholds/window for the active mode (spec.md §4.3's
/// `GetThresholds`).
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub observation_window_secs: u64,
}

pub struct PolicyEngine {
    config: RwLock<PolicyConfig>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// `production`: conservative by default, aggressive only in a narrow
    /// low-traffic night window.
    pub fn production(base: &crate::config::EngineConfig) -> Self {
        let mut cfg = PolicyConfig::from_engine_config(base);
        cfg.default_mode = Mode::Conservative;
        cfg.windows = vec![TimeWindow::new(
            Mode::Aggressive,
            vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            2,
            5,
        )];
        Self::new(cfg)
    }

    /// `development`: aggressive around the clock, scale-down is cheap here.
    pub fn development(base: &crate::config::EngineConfig) -> Self {
        let mut cfg = PolicyConfig::from_engine_config(base);
        cfg.default_mode = Mode::Aggressive;
        cfg.windows = Vec::new();
        Self::new(cfg)
    }

    /// `cost-saving`: aggressive by default, conservative only during
    /// business hours on weekdays.
    pub fn cost_saving(base: &crate::config::EngineConfig) -> Self {
        let mut cfg = PolicyConfig::from_engine_config(base);
        cfg.default_mode = Mode::Aggressive;
        cfg.windows = vec![TimeWindow::new(
            Mode::Conservative,
            vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            9,
            18,
        )];
        Self::new(cfg)
    }

    pub fn set_windows(&self, windows: Vec<TimeWindow>) {
        self.config.write().expect("PolicyEngine lock poisoned").windows = windows;
    }

    pub fn set_default_mode(&self, mode: Mode) {
        self.config.write().expect("PolicyEngine lock poisoned").default_mode = mode;
    }

    /// Mode selection (spec.md §4.3): scan windows in registration order,
    /// first match wins; falls back to the configured default mode.
    pub fn current_mode(&self) -> Mode {
        self.current_mode_at(Utc::now())
    }

    pub fn current_mode_at(&self, now: chrono::DateTime<Utc>) -> Mode {
        let cfg = self.config.read().expect("PolicyEngine lock poisoned");
        let weekday = now.weekday();
        let hour = now.hour();
        for window in &cfg.windows {
            if window.matches(weekday, hour) {
                return window.mode;
            }
        }
        cfg.default_mode
    }

    pub fn get_thresholds(&self) -> Thresholds {
        let cfg = self.config.read().expect("PolicyEngine lock poisoned");
        let mode = self.current_mode();
        let profile = profile_for(mode);
        Thresholds {
            cpu_threshold: profile.cpu_threshold.unwrap_or(cfg.base_cpu_threshold),
            memory_threshold: profile.memory_threshold.unwrap_or(cfg.base_memory_threshold),
            observation_window_secs: profile
                .observation_window_secs
                .unwrap_or(cfg.base_observation_window_secs),
        }
    }

    pub fn get_max_concurrent(&self) -> usize {
        let cfg = self.config.read().expect("PolicyEngine lock poisoned");
        let mode = self.current_mode();
        match mode {
            Mode::Conservative => 1,
            Mode::Disabled => 0,
            _ => {
                let profile = profile_for(mode);
                match profile.max_concurrent_multiplier {
                    Some(mult) => ((cfg.base_max_concurrent as f64) * mult).round() as usize,
                    None => cfg.base_max_concurrent,
                }
            }
        }
    }

    pub fn get_cooldown_secs(&self) -> u64 {
        let cfg = self.config.read().expect("PolicyEngine lock poisoned");
        let mode = self.current_mode();
        let profile = profile_for(mode);
        let base = (cfg.base_cooldown_secs as f64 * profile.cooldown_multiplier) as u64;
        if profile.extra_delay {
            base + cfg.base_cooldown_secs / 2
        } else {
            base
        }
    }

    /// `ShouldDelayScaleDown` (spec.md §4.3): conservative mode adds extra
    /// delay beyond the base cooldown.
    pub fn should_delay_scale_down(&self) -> bool {
        profile_for(self.current_mode()).extra_delay
    }

    /// `AllowScaleDown` (spec.md §4.3), conjunctive composition: any one
    /// check blocking is sufficient to block (spec.md §9's "Policy layering").
    pub fn allow_scale_down(
        &self,
        group_scale_down_enabled: bool,
        node_annotations: &HashMap<String, String>,
    ) -> Result<(), BlockReason> {
        self.allow_scale_down_at(group_scale_down_enabled, node_annotations, Utc::now())
    }

    pub fn allow_scale_down_at(
        &self,
        group_scale_down_enabled: bool,
        node_annotations: &HashMap<String, String>,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), BlockReason> {
        if self.current_mode_at(now) == Mode::Disabled {
            return Err(BlockReason::PolicyConstraint);
        }
        if !group_scale_down_enabled {
            return Err(BlockReason::PolicyConstraint);
        }
        if let Some(v) = node_annotations.get("scale-down") {
            if v == "disabled" {
                return Err(BlockReason::PolicyConstraint);
            }
        }
        if node_annotations.get("scale-down-disabled").map(|v| v == "true") == Some(true) {
            return Err(BlockReason::PolicyConstraint);
        }
        if let Some(raw) = node_annotations.get("scale-down-allowed-hours") {
            match parse_allowed_hours(raw) {
                Some((start, end)) => {
                    let minutes = now.hour() * 60 + now.minute();
                    let start_m = start.0 * 60 + start.1;
                    let end_m = end.0 * 60 + end.1;
                    if !minutes_in_range(minutes, start_m, end_m) {
                        return Err(BlockReason::PolicyConstraint);
                    }
                }
                None => {
                    warn!("policy: malformed scale-down-allowed-hours annotation '{raw}', failing open");
                }
            }
        }
        debug!("policy: scale-down allowed");
        Ok(())
    }
}

fn minutes_in_range(m: u32, start: u32, end: u32) -> bool {
    if start <= end {
        m >= start && m < end
    } else {
        m >= start || m < end
    }
}

/// Parses `HH:MM-HH:MM`; returns `None` on any malformed input so the caller
/// can fail open (spec.md §4.3, §8).
fn parse_allowed_hours(raw: &str) -> Option<((u32, u32), (u32, u32))> {
    let (start_str, end_str) = raw.split_once('-')?;
    Some((parse_hhmm(start_str)?, parse_hhmm(end_str)?))
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some((h, m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine_with_window(mode: Mode, days: Vec<Weekday>, start: u32, end: u32) -> PolicyEngine {
        let base = crate::config::EngineConfig::default();
        let mut cfg = PolicyConfig::from_engine_config(&base);
        cfg.windows = vec![TimeWindow::new(mode, days, start, end)];
        PolicyEngine::new(cfg)
    }

    #[test]
    fn overnight_window_matches_and_excludes_correctly() {
        let engine = engine_with_window(
            Mode::Aggressive,
            vec![Weekday::Tue],
            22,
            2,
        );
        let hour_23 = Utc.with_ymd_and_hms(2026, 7, 28, 23, 0, 0).unwrap(); // Tuesday
        assert_eq!(engine.current_mode_at(hour_23), Mode::Aggressive);
        let hour_3 = Utc.with_ymd_and_hms(2026, 7, 28, 3, 0, 0).unwrap();
        assert_eq!(engine.current_mode_at(hour_3), Mode::Balanced);
    }

    #[test]
    fn disabled_mode_blocks_unconditionally() {
        let base = crate::config::EngineConfig::default();
        let mut cfg = PolicyConfig::from_engine_config(&base);
        cfg.default_mode = Mode::Disabled;
        let engine = PolicyEngine::new(cfg);
        let now = Utc::now();
        let result = engine.allow_scale_down_at(true, &HashMap::new(), now);
        assert_eq!(result, Err(BlockReason::PolicyConstraint));
    }

    #[test]
    fn malformed_allowed_hours_fails_open() {
        let base = crate::config::EngineConfig::default();
        let cfg = PolicyConfig::from_engine_config(&base);
        let engine = PolicyEngine::new(cfg);
        let mut annotations = HashMap::new();
        annotations.insert("scale-down-allowed-hours".to_string(), "garbage".to_string());
        let result = engine.allow_scale_down(true, &annotations);
        assert!(result.is_ok());
    }

    #[test]
    fn node_scale_down_disabled_annotation_blocks() {
        let base = crate::config::EngineConfig::default();
        let cfg = PolicyConfig::from_engine_config(&base);
        let engine = PolicyEngine::new(cfg);
        let mut annotations = HashMap::new();
        annotations.insert("scale-down".to_string(), "disabled".to_string());
        let result = engine.allow_scale_down(true, &annotations);
        assert_eq!(result, Err(BlockReason::PolicyConstraint));
    }

    #[test]
    fn group_policy_disabled_blocks() {
        let base = crate::config::EngineConfig::default();
        let cfg = PolicyConfig::from_engine_config(&base);
        let engine = PolicyEngine::new(cfg);
        let result = engine.allow_scale_down(false, &HashMap::new());
        assert_eq!(result, Err(BlockReason::PolicyConstraint));
    }

    #[test]
    fn aggressive_mode_doubles_max_concurrent() {
        let base = crate::config::EngineConfig::default();
        let mut cfg = PolicyConfig::from_engine_config(&base);
        cfg.default_mode = Mode::Aggressive;
        let engine = PolicyEngine::new(cfg);
        assert_eq!(engine.get_max_concurrent(), base.max_drains_per_cycle * 2);
    }

    #[test]
    fn conservative_mode_caps_max_concurrent_at_one() {
        let base = crate::config::EngineConfig::default();
        let mut cfg = PolicyConfig::from_engine_config(&base);
        cfg.default_mode = Mode::Conservative;
        let engine = PolicyEngine::new(cfg);
        assert_eq!(engine.get_max_concurrent(), 1);
        assert!(engine.should_delay_scale_down());
    }
}
