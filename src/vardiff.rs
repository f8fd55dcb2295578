//! Per-client difficulty retargeting.
//!
//! The engine is stateless across clients: each call takes a client's recent
//! share timestamps plus its current difficulty and either proposes a new
//! difficulty or declines. Adjustments are gated (sample count, retarget
//! interval), bounded (configured min/max, 4x swing cap in proportional
//! mode), and rounded so floating-point noise never produces a pointless
//! `mining.set_difficulty` push.
//!
//! Timestamps are injected by callers rather than read from the clock here,
//! which keeps every path deterministic under test.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;

/// Most recent share timestamps retained per client.
const WINDOW_CAPACITY: usize = 100;

/// Samples required before any retarget is considered.
const MIN_SAMPLES: usize = 10;

/// Samples the average interval is computed over.
const AVG_SAMPLES: usize = 10;

/// Single-step swing cap in proportional mode.
const SWING_MIN: f64 = 0.25;
const SWING_MAX: f64 = 4.0;

/// Relative change below which a retarget is suppressed.
const MIN_RELATIVE_CHANGE: f64 = 0.01;

/// Retargeting configuration, immutable after startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VardiffConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_min_diff")]
    pub min_diff: f64,

    #[serde(default = "default_max_diff")]
    pub max_diff: f64,

    /// Desired seconds between shares.
    #[serde(default = "default_target_share_time")]
    pub target_share_time: f64,

    /// Minimum seconds between retargets on one client.
    #[serde(default = "default_retarget_time")]
    pub retarget_time: f64,

    /// Acceptable deviation around the target share time, percent.
    #[serde(default = "default_variance_percent")]
    pub variance_percent: f64,

    /// Step used by the legacy fixed-factor mode.
    #[serde(default = "default_adjustment_factor")]
    pub adjustment_factor: f64,

    /// Scale by observed-vs-target ratio (default) instead of the legacy
    /// fixed factor.
    #[serde(default = "default_use_proportional")]
    pub use_proportional: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_min_diff() -> f64 {
    0.01
}

fn default_max_diff() -> f64 {
    512.0
}

fn default_target_share_time() -> f64 {
    10.0
}

fn default_retarget_time() -> f64 {
    60.0
}

fn default_variance_percent() -> f64 {
    30.0
}

fn default_adjustment_factor() -> f64 {
    2.0
}

fn default_use_proportional() -> bool {
    true
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_diff: default_min_diff(),
            max_diff: default_max_diff(),
            target_share_time: default_target_share_time(),
            retarget_time: default_retarget_time(),
            variance_percent: default_variance_percent(),
            adjustment_factor: default_adjustment_factor(),
            use_proportional: default_use_proportional(),
        }
    }
}

/// Configuration violations caught at startup.
#[derive(Error, Debug)]
pub enum VardiffConfigError {
    #[error("vardiff.min_diff must be positive, got {0}")]
    NonPositiveMin(f64),

    #[error("vardiff.min_diff ({0}) must be below vardiff.max_diff ({1})")]
    InvertedBounds(f64, f64),

    #[error("vardiff.target_share_time must be positive, got {0}")]
    NonPositiveTarget(f64),

    #[error("vardiff.retarget_time must be positive, got {0}")]
    NonPositiveRetarget(f64),

    #[error("vardiff.variance_percent must be within (0, 100), got {0}")]
    VarianceOutOfRange(f64),

    #[error("vardiff.adjustment_factor must be above 1, got {0}")]
    AdjustmentFactorTooSmall(f64),
}

impl VardiffConfig {
    pub fn validate(&self) -> Result<(), VardiffConfigError> {
        if !(self.min_diff > 0.0) {
            return Err(VardiffConfigError::NonPositiveMin(self.min_diff));
        }
        if self.min_diff >= self.max_diff {
            return Err(VardiffConfigError::InvertedBounds(
                self.min_diff,
                self.max_diff,
            ));
        }
        if !(self.target_share_time > 0.0) {
            return Err(VardiffConfigError::NonPositiveTarget(self.target_share_time));
        }
        if !(self.retarget_time > 0.0) {
            return Err(VardiffConfigError::NonPositiveRetarget(self.retarget_time));
        }
        if !(self.variance_percent > 0.0 && self.variance_percent < 100.0) {
            return Err(VardiffConfigError::VarianceOutOfRange(self.variance_percent));
        }
        if !self.use_proportional && !(self.adjustment_factor > 1.0) {
            return Err(VardiffConfigError::AdjustmentFactorTooSmall(
                self.adjustment_factor,
            ));
        }
        Ok(())
    }

    /// Starting difficulty for a fresh client.
    ///
    /// A configured port difficulty is clamped into bounds; otherwise the
    /// geometric mean of the bounds, rounded.
    pub fn initial_difficulty(&self, port_diff: Option<f64>) -> f64 {
        match port_diff {
            Some(d) => d.clamp(self.min_diff, self.max_diff),
            None => round_difficulty((self.min_diff * self.max_diff).sqrt()),
        }
    }

    /// Consider a retarget for a client.
    ///
    /// `now_ms` is the caller's wall clock and `last_update_ms` the wall
    /// clock of the client's previous difficulty change. Returns `None`
    /// when any gate fails or the computed change is negligible.
    pub fn check_adjustment(
        &self,
        window: &ShareWindow,
        current_diff: f64,
        now_ms: u64,
        last_update_ms: u64,
    ) -> Option<Retarget> {
        if !self.enabled {
            return None;
        }
        if window.len() < MIN_SAMPLES {
            return None;
        }
        if now_ms.saturating_sub(last_update_ms) < (self.retarget_time * 1000.0) as u64 {
            return None;
        }

        let avg_interval = window.average_interval(AVG_SAMPLES)?;
        let variance = self.variance_percent / 100.0;
        let lo = self.target_share_time * (1.0 - variance);
        let hi = self.target_share_time * (1.0 + variance);

        let reason = if avg_interval < lo {
            RetargetReason::SharesTooFast
        } else if avg_interval > hi {
            RetargetReason::SharesTooSlow
        } else {
            return None;
        };

        let proposed = if self.use_proportional {
            let scale = (self.target_share_time / avg_interval).clamp(SWING_MIN, SWING_MAX);
            current_diff * scale
        } else {
            match reason {
                RetargetReason::SharesTooFast => current_diff * self.adjustment_factor,
                RetargetReason::SharesTooSlow => current_diff / self.adjustment_factor,
            }
        };

        let new_diff = round_difficulty(proposed.clamp(self.min_diff, self.max_diff));
        if ((new_diff - current_diff) / current_diff).abs() < MIN_RELATIVE_CHANGE {
            return None;
        }

        Some(Retarget {
            new_diff,
            reason,
            avg_interval,
        })
    }
}

/// A proposed difficulty change.
#[derive(Debug, Clone, PartialEq)]
pub struct Retarget {
    pub new_diff: f64,
    pub reason: RetargetReason,
    /// Observed average seconds between shares.
    pub avg_interval: f64,
}

/// Why a retarget fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetargetReason {
    SharesTooFast,
    SharesTooSlow,
}

impl RetargetReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RetargetReason::SharesTooFast => "shares too fast",
            RetargetReason::SharesTooSlow => "shares too slow",
        }
    }
}

/// Ring of recent accepted-share timestamps for one client.
///
/// Each wall-clock sample is paired with a monotonic tick at record time;
/// a sample whose tick is not strictly later than the previous one is
/// dropped rather than corrupting the ring (wall clocks jump, the
/// monotonic clock does not).
#[derive(Debug, Default)]
pub struct ShareWindow {
    stamps: VecDeque<u64>,
    last_tick: Option<Instant>,
}

impl ShareWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted share. Returns false when the clock guard
    /// rejected the sample.
    pub fn record(&mut self, wall_ms: u64, tick: Instant) -> bool {
        if let Some(last) = self.last_tick {
            if tick <= last {
                return false;
            }
        }
        self.last_tick = Some(tick);
        if self.stamps.len() == WINDOW_CAPACITY {
            self.stamps.pop_front();
        }
        self.stamps.push_back(wall_ms);
        true
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Average seconds between the most recent `n` samples.
    ///
    /// Returns `None` with fewer than two samples in range.
    pub fn average_interval(&self, n: usize) -> Option<f64> {
        let count = n.min(self.stamps.len());
        if count < 2 {
            return None;
        }
        let first = self.stamps[self.stamps.len() - count];
        let last = self.stamps[self.stamps.len() - 1];
        Some(last.saturating_sub(first) as f64 / (count - 1) as f64 / 1000.0)
    }

    /// Wall-clock span of the whole window, seconds.
    pub fn span_secs(&self) -> f64 {
        match (self.stamps.front(), self.stamps.back()) {
            (Some(&first), Some(&last)) => last.saturating_sub(first) as f64 / 1000.0,
            _ => 0.0,
        }
    }
}

/// Diagnostic hashrate estimate from a client's share window.
///
/// `difficulty * shares * 2^32 / span`. Not a control input: the retarget
/// logic never reads it. Zero with fewer than two samples or a zero span.
pub fn hashrate_estimate(difficulty: f64, window: &ShareWindow) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let span = window.span_secs();
    if span <= 0.0 {
        return 0.0;
    }
    difficulty * window.len() as f64 * 4_294_967_296.0 / span
}

/// Round a difficulty to suppress floating-point noise.
///
/// Six significant figures at or above 1, six decimal places below.
fn round_difficulty(diff: f64) -> f64 {
    if diff >= 1.0 {
        let magnitude = diff.log10().floor() as i32;
        let factor = 10f64.powi(5 - magnitude);
        (diff * factor).round() / factor
    } else {
        (diff * 1e6).round() / 1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Window with `count` shares spaced `interval_ms` apart, ending at
    /// `count * interval_ms`.
    fn window_with_interval(count: usize, interval_ms: u64) -> ShareWindow {
        let base = Instant::now();
        let mut window = ShareWindow::new();
        for i in 0..count {
            let ok = window.record(
                (i as u64 + 1) * interval_ms,
                base + Duration::from_millis((i as u64 + 1) * interval_ms),
            );
            assert!(ok);
        }
        window
    }

    fn config() -> VardiffConfig {
        VardiffConfig {
            min_diff: 0.01,
            max_diff: 512.0,
            target_share_time: 10.0,
            retarget_time: 60.0,
            variance_percent: 30.0,
            ..VardiffConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        VardiffConfig::default().validate().unwrap();
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let cfg = VardiffConfig {
            min_diff: 8.0,
            max_diff: 2.0,
            ..VardiffConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_disabled_never_adjusts() {
        let cfg = VardiffConfig {
            enabled: false,
            ..config()
        };
        let window = window_with_interval(20, 1_000);
        assert!(cfg.check_adjustment(&window, 1.0, 1_000_000, 0).is_none());
    }

    #[test]
    fn test_sample_gate() {
        let cfg = config();
        let window = window_with_interval(9, 5_000);
        assert!(cfg.check_adjustment(&window, 1.0, 1_000_000, 0).is_none());
    }

    #[test]
    fn test_retarget_time_gate() {
        let cfg = config();
        let window = window_with_interval(10, 5_000);
        // Only 59s since the last update: gated.
        assert!(cfg.check_adjustment(&window, 1.0, 59_000, 0).is_none());
        // 60s: allowed.
        assert!(cfg.check_adjustment(&window, 1.0, 60_000, 0).is_some());
    }

    #[test]
    fn test_shares_too_fast_doubles() {
        let cfg = config();
        // 10 shares, 5s apart; target 10s, lower bound 7s.
        let window = window_with_interval(10, 5_000);
        let retarget = cfg.check_adjustment(&window, 1.0, 1_000_000, 0).unwrap();

        assert_eq!(retarget.reason, RetargetReason::SharesTooFast);
        assert!((retarget.avg_interval - 5.0).abs() < 1e-9);
        assert!((retarget.new_diff - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_shares_too_slow_shrinks() {
        let cfg = config();
        // 20s apart; target 10s, upper bound 13s → scale 0.5.
        let window = window_with_interval(10, 20_000);
        let retarget = cfg.check_adjustment(&window, 8.0, 1_000_000, 0).unwrap();

        assert_eq!(retarget.reason, RetargetReason::SharesTooSlow);
        assert!((retarget.new_diff - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_within_variance_no_change() {
        let cfg = config();
        // 9s apart with 30% variance around 10s: inside [7, 13].
        let window = window_with_interval(10, 9_000);
        assert!(cfg.check_adjustment(&window, 1.0, 1_000_000, 0).is_none());
    }

    #[test]
    fn test_swing_capped_at_4x() {
        let cfg = config();
        // 0.5s apart: raw scale would be 20x.
        let window = window_with_interval(10, 500);
        let retarget = cfg.check_adjustment(&window, 1.0, 1_000_000, 0).unwrap();
        assert!((retarget.new_diff - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_swing_capped_at_quarter() {
        let cfg = config();
        // 60s apart: raw scale would be 1/6.
        let window = window_with_interval(10, 60_000);
        let retarget = cfg.check_adjustment(&window, 16.0, 1_000_000, 0).unwrap();
        assert!((retarget.new_diff - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamped_to_max_diff() {
        let cfg = VardiffConfig {
            max_diff: 3.0,
            ..config()
        };
        let window = window_with_interval(10, 500);
        let retarget = cfg.check_adjustment(&window, 1.0, 1_000_000, 0).unwrap();
        assert!((retarget.new_diff - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamped_to_min_diff() {
        let cfg = VardiffConfig {
            min_diff: 0.5,
            ..config()
        };
        let window = window_with_interval(10, 60_000);
        let retarget = cfg.check_adjustment(&window, 1.0, 1_000_000, 0).unwrap();
        assert!((retarget.new_diff - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sub_percent_change_suppressed() {
        let cfg = VardiffConfig {
            max_diff: 1.005,
            ..config()
        };
        // Fast shares want to raise, but the cap leaves <1% of headroom.
        let window = window_with_interval(10, 5_000);
        assert!(cfg.check_adjustment(&window, 1.0, 1_000_000, 0).is_none());
    }

    #[test]
    fn test_legacy_fixed_factor_mode() {
        let cfg = VardiffConfig {
            use_proportional: false,
            adjustment_factor: 2.0,
            ..config()
        };

        let fast = window_with_interval(10, 5_000);
        let up = cfg.check_adjustment(&fast, 3.0, 1_000_000, 0).unwrap();
        assert!((up.new_diff - 6.0).abs() < 1e-9);

        let slow = window_with_interval(10, 20_000);
        let down = cfg.check_adjustment(&slow, 3.0, 1_000_000, 0).unwrap();
        assert!((down.new_diff - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_initial_difficulty_from_port() {
        let cfg = config();
        assert_eq!(cfg.initial_difficulty(Some(4.0)), 4.0);
        // Clamped into bounds.
        assert_eq!(cfg.initial_difficulty(Some(10_000.0)), 512.0);
        assert_eq!(cfg.initial_difficulty(Some(0.0001)), 0.01);
    }

    #[test]
    fn test_initial_difficulty_geometric_mean() {
        let cfg = VardiffConfig {
            min_diff: 1.0,
            max_diff: 64.0,
            ..config()
        };
        assert!((cfg.initial_difficulty(None) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_rounding_six_significant_figures() {
        assert_eq!(round_difficulty(123.456789), 123.457);
        assert_eq!(round_difficulty(1.0000001), 1.0);
        assert_eq!(round_difficulty(0.123456789), 0.123457);
    }

    #[test]
    fn test_window_caps_at_capacity() {
        let window = window_with_interval(150, 1_000);
        assert_eq!(window.len(), WINDOW_CAPACITY);
    }

    #[test]
    fn test_clock_guard_drops_backward_tick() {
        let base = Instant::now();
        let mut window = ShareWindow::new();

        assert!(window.record(1_000, base + Duration::from_millis(100)));
        // Same tick: rejected.
        assert!(!window.record(2_000, base + Duration::from_millis(100)));
        // Earlier tick: rejected.
        assert!(!window.record(3_000, base + Duration::from_millis(50)));
        // Later tick: accepted.
        assert!(window.record(4_000, base + Duration::from_millis(200)));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_average_interval_uses_last_ten() {
        let base = Instant::now();
        let mut window = ShareWindow::new();
        // Five shares 20s apart, then ten shares 2s apart.
        let mut t = 0u64;
        for _ in 0..5 {
            t += 20_000;
            window.record(t, base + Duration::from_millis(t));
        }
        for _ in 0..10 {
            t += 2_000;
            window.record(t, base + Duration::from_millis(t));
        }
        let avg = window.average_interval(10).unwrap();
        assert!((avg - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_hashrate_estimate() {
        let window = window_with_interval(10, 1_000);
        // 10 shares over 9s at diff 1: 10 * 2^32 / 9.
        let expected = 10.0 * 4_294_967_296.0 / 9.0;
        assert!((hashrate_estimate(1.0, &window) - expected).abs() < 1.0);
    }

    #[test]
    fn test_hashrate_estimate_degenerate() {
        let mut window = ShareWindow::new();
        assert_eq!(hashrate_estimate(1.0, &window), 0.0);

        window.record(1_000, Instant::now());
        assert_eq!(hashrate_estimate(1.0, &window), 0.0);
    }
}
