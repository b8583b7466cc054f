//! Drawdown protection
//!
//! Tracks peak portfolio equity, measures drawdown against it, and latches a
//! protection window when the decline crosses the configured threshold. While
//! protection is active no new entries are permitted; exits keep processing.
//! The liquidation side effects of a trigger live in the engine; this module
//! owns the state and the decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DrawdownConfig;

/// Persisted drawdown-protection state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownState {
    /// High-water mark of portfolio value, non-decreasing except on reset
    pub peak_value: f64,
    pub protection_active: bool,
    pub protection_end: Option<DateTime<Utc>>,
    pub trigger_count: u32,
    /// Most negative drawdown percentage ever observed
    pub max_drawdown_seen: f64,
}

impl Default for DrawdownState {
    fn default() -> Self {
        Self {
            peak_value: 0.0,
            protection_active: false,
            protection_end: None,
            trigger_count: 0,
            max_drawdown_seen: 0.0,
        }
    }
}

pub struct DrawdownGuard {
    state: DrawdownState,
    config: DrawdownConfig,
}

impl DrawdownGuard {
    pub fn new(config: DrawdownConfig) -> Self {
        Self {
            state: DrawdownState::default(),
            config,
        }
    }

    /// Restore from persisted state, repairing a stale protection window
    pub fn from_state(state: DrawdownState, config: DrawdownConfig, now: DateTime<Utc>) -> Self {
        let mut guard = Self { state, config };
        if guard.state.protection_active {
            match guard.state.protection_end {
                Some(end) if end > now => {}
                _ => {
                    warn!("clearing stale drawdown protection on restore");
                    guard.state.protection_active = false;
                    guard.state.protection_end = None;
                }
            }
        }
        guard
    }

    pub fn state(&self) -> &DrawdownState {
        &self.state
    }

    /// Raise the peak if the new value is higher.
    ///
    /// Reaching a new peak while protection is active clears the protection:
    /// the portfolio has recovered past the level it was being protected at.
    pub fn update_peak(&mut self, value: f64) {
        if value > self.state.peak_value {
            self.state.peak_value = value;
            if self.state.protection_active {
                info!(peak = value, "new equity peak, drawdown protection cleared");
                self.state.protection_active = false;
                self.state.protection_end = None;
            }
        }
    }

    /// Drawdown of `value` against the peak, in percent (0 or negative)
    pub fn calculate_drawdown(&mut self, value: f64) -> f64 {
        if self.state.peak_value <= 0.0 {
            return 0.0;
        }
        let pct = (value - self.state.peak_value) / self.state.peak_value * 100.0;
        let pct = pct.min(0.0);
        if pct < self.state.max_drawdown_seen {
            self.state.max_drawdown_seen = pct;
        }
        pct
    }

    /// Whether the protection should fire for this portfolio value
    pub fn should_trigger(&mut self, value: f64) -> bool {
        if self.state.protection_active {
            return false;
        }
        self.calculate_drawdown(value) <= self.config.threshold_pct
    }

    /// Latch the protection window. The caller is responsible for the
    /// best-effort liquidation of open positions.
    pub fn activate(&mut self, now: DateTime<Utc>) {
        self.state.protection_active = true;
        self.state.protection_end = Some(now + Duration::days(self.config.recovery_days));
        self.state.trigger_count += 1;
        warn!(
            trigger_count = self.state.trigger_count,
            until = %self.state.protection_end.unwrap(),
            "drawdown protection activated"
        );
    }

    /// Whether the cooldown window is still holding entries shut.
    ///
    /// A window that has expired is cleared here as a side effect, so
    /// `protection_active` never outlives `protection_end`.
    pub fn is_in_recovery(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.protection_active {
            return false;
        }
        match self.state.protection_end {
            Some(end) if now < end => true,
            _ => {
                info!("drawdown protection window elapsed");
                self.state.protection_active = false;
                self.state.protection_end = None;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> DrawdownGuard {
        DrawdownGuard::new(DrawdownConfig {
            threshold_pct: -8.0,
            recovery_days: 5,
        })
    }

    #[test]
    fn test_peak_is_monotonic() {
        let mut g = guard();
        g.update_peak(100_000.0);
        g.update_peak(90_000.0);
        assert_eq!(g.state().peak_value, 100_000.0);

        g.update_peak(110_000.0);
        assert_eq!(g.state().peak_value, 110_000.0);
    }

    #[test]
    fn test_drawdown_never_positive() {
        let mut g = guard();
        g.update_peak(100_000.0);

        assert_eq!(g.calculate_drawdown(120_000.0), 0.0);
        assert!((g.calculate_drawdown(91_000.0) + 9.0).abs() < 1e-9);
        assert!((g.state().max_drawdown_seen + 9.0).abs() < 1e-9);

        // A shallower dip must not shrink the worst-seen record
        g.calculate_drawdown(95_000.0);
        assert!((g.state().max_drawdown_seen + 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_trigger_at_threshold() {
        let mut g = guard();
        g.update_peak(100_000.0);

        assert!(!g.should_trigger(93_000.0)); // -7%
        assert!(g.should_trigger(91_000.0)); // -9%
    }

    #[test]
    fn test_protection_latches_until_window_elapses() {
        let mut g = guard();
        let now = Utc::now();
        g.update_peak(100_000.0);

        assert!(g.should_trigger(91_000.0));
        g.activate(now);
        assert_eq!(g.state().trigger_count, 1);

        // Active protection suppresses re-triggering
        assert!(!g.should_trigger(85_000.0));
        assert!(g.is_in_recovery(now + Duration::days(2)));

        // Past the window the latch releases
        assert!(!g.is_in_recovery(now + Duration::days(6)));
        assert!(!g.state().protection_active);
    }

    #[test]
    fn test_new_peak_clears_protection() {
        let mut g = guard();
        let now = Utc::now();
        g.update_peak(100_000.0);
        g.activate(now);
        assert!(g.state().protection_active);

        g.update_peak(101_000.0);
        assert!(!g.state().protection_active);
        assert!(g.state().protection_end.is_none());
        assert!(!g.is_in_recovery(now));
    }

    #[test]
    fn test_restore_repairs_stale_window() {
        let now = Utc::now();
        let stale = DrawdownState {
            peak_value: 100_000.0,
            protection_active: true,
            protection_end: Some(now - Duration::days(1)),
            trigger_count: 2,
            max_drawdown_seen: -12.0,
        };

        let mut g = DrawdownGuard::from_state(
            stale,
            DrawdownConfig {
                threshold_pct: -8.0,
                recovery_days: 5,
            },
            now,
        );

        assert!(!g.state().protection_active);
        assert!(g.state().protection_end.is_none());
        // History survives the repair
        assert_eq!(g.state().trigger_count, 2);
        assert!(!g.is_in_recovery(now));
    }
}
