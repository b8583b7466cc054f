//! Market regime and recovery-mode detection
//!
//! A three-phase state machine over the benchmark index bar stream:
//! capitulation, swing-low confirmation, follow-through. While the benchmark
//! trades below its long moving average the market is "locked": no new
//! entries are allowed until the full bottoming structure confirms, at which
//! point recovery mode re-opens entries under a reduced capital multiplier
//! and a position cap. The assessment emitted each cycle is the only
//! interface the scanner and sizer consume.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::config::RegimeConfig;
use crate::indicators::{avg_volume, ema};
use crate::Candle;

/// Phase-1 event: a panic flush that marks a potential bottom
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capitulation {
    pub date: NaiveDate,
    pub low_price: f64,
}

/// Phase-2 event: the capitulation low held
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwingLow {
    pub date: NaiveDate,
    pub price: f64,
}

/// Persisted bottoming-structure state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeStructureState {
    pub capitulation: Option<Capitulation>,
    pub swing_low: Option<SwingLow>,
    pub follow_through_date: Option<NaiveDate>,
    /// Price of the previously confirmed swing low, kept across resets for
    /// higher-low comparison
    pub prior_swing_low: Option<f64>,
    pub is_higher_low: bool,
    /// Bars the capitulation low has held so far
    pub bars_held_above_low: usize,
    /// Bars elapsed since the swing low confirmed
    pub bars_since_swing_confirm: usize,
}

impl RegimeStructureState {
    /// Drop back to "no structure", preserving the best swing low seen
    fn reset(&mut self) {
        if let Some(swing) = self.swing_low.take() {
            self.prior_swing_low = Some(swing.price);
        }
        self.capitulation = None;
        self.follow_through_date = None;
        self.is_higher_low = false;
        self.bars_held_above_low = 0;
        self.bars_since_swing_confirm = 0;
    }
}

/// Persisted recovery-mode state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryModeState {
    pub active: bool,
    pub start_date: Option<NaiveDate>,
    pub activation_count: u32,
    pub lock_start_date: Option<NaiveDate>,
}

/// Everything the detector persists across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeState {
    pub structure: RegimeStructureState,
    pub recovery: RecoveryModeState,
    pub history: Vec<Candle>,
}

/// Per-cycle verdict consumed by scanning and sizing
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeAssessment {
    pub recovery_mode_active: bool,
    pub position_multiplier: f64,
    pub max_positions: usize,
    pub allow_entries: bool,
    pub profit_target_pct: f64,
    pub reason: String,
}

pub struct RegimeDetector {
    structure: RegimeStructureState,
    recovery: RecoveryModeState,
    history: VecDeque<Candle>,
    config: RegimeConfig,
    normal_max_positions: usize,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig, normal_max_positions: usize) -> Self {
        Self {
            structure: RegimeStructureState::default(),
            recovery: RecoveryModeState::default(),
            history: VecDeque::with_capacity(config.history_bars),
            config,
            normal_max_positions,
        }
    }

    pub fn from_state(state: RegimeState, config: RegimeConfig, normal_max_positions: usize) -> Self {
        Self {
            structure: state.structure,
            recovery: state.recovery,
            history: state.history.into_iter().collect(),
            config,
            normal_max_positions,
        }
    }

    pub fn to_state(&self) -> RegimeState {
        RegimeState {
            structure: self.structure.clone(),
            recovery: self.recovery.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }

    pub fn structure(&self) -> &RegimeStructureState {
        &self.structure
    }

    pub fn recovery(&self) -> &RecoveryModeState {
        &self.recovery
    }

    /// Evaluate one benchmark bar.
    ///
    /// `is_below_long_sma` is computed by the caller over the full benchmark
    /// history (the detector's own window is too short for a 200-bar mean).
    /// `breadth_pct` is the share of the universe above its short moving
    /// average; `None` skips the breadth check rather than tripping it.
    pub fn evaluate(
        &mut self,
        bar: &Candle,
        is_below_long_sma: bool,
        breadth_pct: Option<f64>,
    ) -> RegimeAssessment {
        // Reference stats come from history before this bar joins it
        let prev_close = self.history.back().map(|c| c.close);
        let volumes: Vec<f64> = self.history.iter().map(|c| c.volume).collect();
        let average_volume = avg_volume(&volumes, self.config.history_bars);

        self.push_bar(bar.clone());

        if !is_below_long_sma {
            // Healthy tape: no lock, no structure to wait on
            self.recovery = RecoveryModeState::default();
            self.structure.reset();
            return self.normal_assessment();
        }

        let date = bar.date();
        if self.recovery.lock_start_date.is_none() {
            info!(%date, "benchmark below long moving average, entry lock engaged");
            self.recovery.lock_start_date = Some(date);
        }

        if self.recovery.active {
            if let Some(reason) = self.recovery_exit_reason(bar, date, breadth_pct) {
                info!(%reason, "recovery mode deactivated");
                self.recovery.active = false;
                self.recovery.start_date = None;
                self.structure.reset();
                return self.locked_assessment(format!("recovery ended: {}", reason));
            }
            return self.recovery_assessment();
        }

        self.detect_phases(bar, date, prev_close, average_volume);

        if self.structure.follow_through_date.is_some() {
            // Follow-through while locked is exactly the recovery trigger
            self.recovery.active = true;
            self.recovery.start_date = Some(date);
            self.recovery.activation_count += 1;
            info!(
                higher_low = self.structure.is_higher_low,
                activation = self.recovery.activation_count,
                "follow-through confirmed, recovery mode active"
            );
            return self.recovery_assessment();
        }

        self.locked_assessment(self.phase_description())
    }

    fn push_bar(&mut self, bar: Candle) {
        if self.history.len() == self.config.history_bars {
            self.history.pop_front();
        }
        self.history.push_back(bar);
    }

    // ------------------------------------------------------------------
    // Phase detection
    // ------------------------------------------------------------------

    fn detect_phases(
        &mut self,
        bar: &Candle,
        date: NaiveDate,
        prev_close: Option<f64>,
        average_volume: Option<f64>,
    ) {
        if self.try_capitulation(bar, date, prev_close, average_volume) {
            return;
        }
        if self.structure.capitulation.is_some() && self.structure.swing_low.is_none() {
            self.try_swing_low_confirm(bar, date);
            return;
        }
        if self.structure.swing_low.is_some() && self.structure.follow_through_date.is_none() {
            self.try_follow_through(bar, date, prev_close, average_volume);
        }
    }

    /// Phase 1. A new capitulation always restarts the downstream phases,
    /// remembering the last confirmed swing low for higher-low comparison.
    fn try_capitulation(
        &mut self,
        bar: &Candle,
        date: NaiveDate,
        prev_close: Option<f64>,
        average_volume: Option<f64>,
    ) -> bool {
        let single_day = match (prev_close, average_volume) {
            (Some(prev), Some(avg_vol)) if prev > 0.0 && avg_vol > 0.0 => {
                let drop_pct = (bar.close - prev) / prev * 100.0;
                drop_pct <= -self.config.capitulation_drop_pct
                    && bar.volume >= self.config.capitulation_volume_ratio * avg_vol
            }
            _ => false,
        };

        let (cluster, cluster_low) = self.down_day_cluster();

        if !single_day && !cluster {
            return false;
        }

        let low_price = if single_day { bar.low } else { cluster_low.min(bar.low) };

        // Overwrite any in-progress lower phases
        self.structure.reset();
        self.structure.capitulation = Some(Capitulation { date, low_price });
        info!(%date, low = low_price, "capitulation detected");
        true
    }

    /// Trailing run of down closes and its lowest low, ending at the newest bar
    fn down_day_cluster(&self) -> (bool, f64) {
        let bars: Vec<&Candle> = self.history.iter().collect();
        if bars.len() < self.config.capitulation_down_days + 1 {
            return (false, f64::MAX);
        }

        let mut run = 0usize;
        let mut lowest = f64::MAX;
        let mut first_ref_close = 0.0;
        for i in (1..bars.len()).rev() {
            if bars[i].close < bars[i - 1].close {
                run += 1;
                lowest = lowest.min(bars[i].low);
                first_ref_close = bars[i - 1].close;
                if run >= self.config.capitulation_down_days {
                    break;
                }
            } else {
                break;
            }
        }

        if run < self.config.capitulation_down_days || first_ref_close <= 0.0 {
            return (false, f64::MAX);
        }

        let last_close = bars[bars.len() - 1].close;
        let decline_pct = (first_ref_close - last_close) / first_ref_close * 100.0;
        (decline_pct >= self.config.capitulation_cluster_pct, lowest)
    }

    /// Phase 2: the low must hold, within tolerance, for the configured bars
    fn try_swing_low_confirm(&mut self, bar: &Candle, date: NaiveDate) {
        let Some(cap_low) = self.structure.capitulation.as_ref().map(|c| c.low_price) else {
            return;
        };
        let floor = cap_low * (1.0 - self.config.swing_low_tolerance);

        if bar.low < floor {
            debug!(%date, "capitulation low undercut, structure reset");
            self.structure.reset();
            return;
        }

        self.structure.bars_held_above_low += 1;
        if self.structure.bars_held_above_low >= self.config.swing_low_confirm_bars {
            self.structure.is_higher_low = self
                .structure
                .prior_swing_low
                .map(|prior| cap_low > prior)
                .unwrap_or(false);
            self.structure.swing_low = Some(SwingLow {
                date,
                price: cap_low,
            });
            self.structure.bars_since_swing_confirm = 0;
            info!(
                %date,
                price = cap_low,
                higher_low = self.structure.is_higher_low,
                "swing low confirmed"
            );
        }
    }

    /// Phase 3: a strong up-day inside the confirmation window
    fn try_follow_through(
        &mut self,
        bar: &Candle,
        date: NaiveDate,
        prev_close: Option<f64>,
        average_volume: Option<f64>,
    ) {
        self.structure.bars_since_swing_confirm += 1;
        let bars = self.structure.bars_since_swing_confirm;

        if bars > self.config.follow_through_max_window {
            debug!(%date, "follow-through window expired, structure reset");
            self.structure.reset();
            return;
        }
        if bars < self.config.follow_through_min_wait {
            return;
        }

        let gain_pct = match prev_close {
            Some(prev) if prev > 0.0 => (bar.close - prev) / prev * 100.0,
            _ => return,
        };

        let volume_ok = average_volume
            .map(|avg| avg > 0.0 && bar.volume >= avg)
            .unwrap_or(false);

        let closes: Vec<f64> = self.history.iter().map(|c| c.close).collect();
        let above_short_ema = ema(&closes, self.config_short_ema_period())
            .last()
            .and_then(|&v| v)
            .map(|e| bar.close > e)
            .unwrap_or(false);

        let strong = gain_pct >= self.config.follow_through_gain_pct && volume_ok;
        let soft = gain_pct >= self.config.follow_through_soft_gain_pct && above_short_ema;

        if strong || soft {
            self.structure.follow_through_date = Some(date);
        }
    }

    // Short EMA period for the soft follow-through path; the 50-bar window
    // caps what is computable, so clamp against it.
    fn config_short_ema_period(&self) -> usize {
        self.config.history_bars.min(10)
    }

    // ------------------------------------------------------------------
    // Recovery-mode exit checks
    // ------------------------------------------------------------------

    fn recovery_exit_reason(
        &self,
        bar: &Candle,
        date: NaiveDate,
        breadth_pct: Option<f64>,
    ) -> Option<String> {
        if let Some(start) = self.recovery.start_date {
            let elapsed = (date - start).num_days();
            if elapsed >= self.config.recovery_max_days {
                return Some(format!("max duration ({} days)", elapsed));
            }
        }

        let down_run = self.trailing_down_days();
        if down_run >= self.config.recovery_down_day_limit {
            return Some(format!("{} consecutive down days", down_run));
        }

        if let Some(breadth) = breadth_pct {
            if breadth < self.config.breadth_floor_pct {
                return Some(format!("breadth collapsed to {:.1}%", breadth));
            }
        }

        if let Some(swing) = &self.structure.swing_low {
            let floor = swing.price * (1.0 - self.config.swing_low_break_tolerance);
            if bar.close < floor {
                return Some(format!("close {:.2} broke swing low {:.2}", bar.close, swing.price));
            }
        }

        None
    }

    fn trailing_down_days(&self) -> usize {
        let bars: Vec<&Candle> = self.history.iter().collect();
        let mut run = 0;
        for i in (1..bars.len()).rev() {
            if bars[i].close < bars[i - 1].close {
                run += 1;
            } else {
                break;
            }
        }
        run
    }

    // ------------------------------------------------------------------
    // Assessments
    // ------------------------------------------------------------------

    fn normal_assessment(&self) -> RegimeAssessment {
        RegimeAssessment {
            recovery_mode_active: false,
            position_multiplier: 1.0,
            max_positions: self.normal_max_positions,
            allow_entries: true,
            profit_target_pct: self.config.normal_profit_target_pct,
            reason: "benchmark above long moving average".to_string(),
        }
    }

    fn locked_assessment(&self, reason: String) -> RegimeAssessment {
        RegimeAssessment {
            recovery_mode_active: false,
            position_multiplier: 0.0,
            max_positions: 0,
            allow_entries: false,
            profit_target_pct: self.config.normal_profit_target_pct,
            reason,
        }
    }

    fn recovery_assessment(&self) -> RegimeAssessment {
        let max_positions = if self.structure.is_higher_low {
            self.config.recovery_max_positions_higher_low
        } else {
            self.config.recovery_max_positions
        };
        RegimeAssessment {
            recovery_mode_active: true,
            position_multiplier: self.config.recovery_position_multiplier,
            max_positions,
            allow_entries: true,
            profit_target_pct: self.config.recovery_profit_target_pct,
            reason: if self.structure.is_higher_low {
                "recovery mode (higher low)".to_string()
            } else {
                "recovery mode".to_string()
            },
        }
    }

    fn phase_description(&self) -> String {
        if self.structure.swing_low.is_some() {
            "awaiting follow-through".to_string()
        } else if self.structure.capitulation.is_some() {
            "awaiting swing-low confirmation".to_string()
        } else {
            "locked, no structure".to_string()
        }
    }
}
