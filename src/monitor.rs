//! Position monitor and tiered exit engine
//!
//! One state machine per open position. Level 0 runs on an ATR-based initial
//! stop; reaching the tier-1 target takes partial profit and arms a kill
//! switch measured from the lock price; reaching tier 2 takes another slice
//! and hands risk management to a trailing stop that only ratchets up. A
//! volatility-scaled maximum-loss floor is enforced at every level, ahead of
//! everything else. Stagnant and remnant positions are cleaned up
//! independently of stop state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::broker::BrokerPosition;
use crate::config::ExitConfig;
use crate::indicators::atr_stop;
use crate::{Symbol, VolatilityClass};

/// Persisted per-position metadata, owned exclusively by the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMeta {
    pub symbol: Symbol,
    pub quantity: f64,
    pub entry_date: DateTime<Utc>,
    pub entry_signal: String,
    pub entry_score: f64,
    pub entry_price: f64,
    /// 0 (initial), 1 (tier-1 taken), 2 (trailing). Only ever increases.
    pub profit_level: u8,
    pub tier1_lock_price: Option<f64>,
    pub peak_price: Option<f64>,
    pub kill_switch_active: bool,
    pub add_count: u32,
    pub initial_stop: f64,
    pub current_stop: f64,
    /// Risk unit: entry price minus initial stop
    pub r_unit: f64,
    pub entry_atr: f64,
    pub highest_close: f64,
    pub bars_below_ema50: u32,
    pub partial_taken: bool,
    pub volatility_class: VolatilityClass,
}

impl PositionMeta {
    pub fn unrealized_gain_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }

    pub fn days_held(&self, now: DateTime<Utc>) -> i64 {
        (now.date_naive() - self.entry_date.date_naive()).num_days()
    }

    /// Gain expressed in risk units
    pub fn r_multiple(&self, price: f64) -> f64 {
        if self.r_unit <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.r_unit
    }
}

/// Why a position (or part of it) should be sold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    HardStop,
    KillSwitch,
    TrailingStop,
    TierTarget,
    TrendBreak,
    Stagnant,
    Remnant,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::HardStop => "hard_stop",
            ExitKind::KillSwitch => "kill_switch",
            ExitKind::TrailingStop => "trailing_stop",
            ExitKind::TierTarget => "tier_target",
            ExitKind::TrendBreak => "trend_break",
            ExitKind::Stagnant => "stagnant",
            ExitKind::Remnant => "remnant",
        }
    }
}

/// Exit instruction for the engine. `fraction` is relative to the currently
/// held quantity; 1.0 means a full close.
#[derive(Debug, Clone)]
pub struct ExitAction {
    pub kind: ExitKind,
    pub fraction: f64,
    pub reason: String,
}

impl ExitAction {
    fn full(kind: ExitKind, reason: String) -> Self {
        Self {
            kind,
            fraction: 1.0,
            reason,
        }
    }

    pub fn is_full_close(&self) -> bool {
        self.fraction >= 1.0
    }
}

pub struct PositionMonitor {
    positions: HashMap<Symbol, PositionMeta>,
    config: ExitConfig,
}

impl PositionMonitor {
    pub fn new(config: ExitConfig) -> Self {
        Self {
            positions: HashMap::new(),
            config,
        }
    }

    pub fn from_metas(metas: Vec<PositionMeta>, config: ExitConfig) -> Self {
        Self {
            positions: metas.into_iter().map(|m| (m.symbol.clone(), m)).collect(),
            config,
        }
    }

    pub fn positions(&self) -> impl Iterator<Item = &PositionMeta> {
        self.positions.values()
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&PositionMeta> {
        self.positions.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.positions.keys().cloned().collect()
    }

    /// Start tracking a fill.
    ///
    /// A fresh buy initializes level-0 metadata. An add-on to an existing
    /// position bumps `add_count` and quantity and deliberately leaves the
    /// tier, kill-switch and lock-price state untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn track_position(
        &mut self,
        symbol: &Symbol,
        quantity: f64,
        price: f64,
        atr: Option<f64>,
        signal: &str,
        score: f64,
        volatility_class: VolatilityClass,
        is_addon: bool,
        now: DateTime<Utc>,
    ) {
        if is_addon {
            if let Some(meta) = self.positions.get_mut(symbol) {
                meta.add_count += 1;
                meta.quantity += quantity;
                debug!(
                    %symbol,
                    add_count = meta.add_count,
                    profit_level = meta.profit_level,
                    "add-on tracked, tier state preserved"
                );
                return;
            }
            warn!(%symbol, "add-on for untracked position, tracking as fresh entry");
        }

        let initial_stop = atr_stop(
            price,
            atr,
            self.config.initial_stop_atr_mult,
            self.config.stop_fallback_pct,
        );
        let meta = PositionMeta {
            symbol: symbol.clone(),
            quantity,
            entry_date: now,
            entry_signal: signal.to_string(),
            entry_score: score,
            entry_price: price,
            profit_level: 0,
            tier1_lock_price: None,
            peak_price: None,
            kill_switch_active: false,
            add_count: 0,
            initial_stop,
            current_stop: initial_stop,
            r_unit: price - initial_stop,
            entry_atr: atr.unwrap_or(0.0),
            highest_close: price,
            bars_below_ema50: 0,
            partial_taken: false,
            volatility_class,
        };
        info!(
            %symbol,
            quantity,
            price,
            stop = initial_stop,
            "position tracked"
        );
        self.positions.insert(symbol.clone(), meta);
    }

    /// Evaluate a position against the exit rules for this cycle.
    ///
    /// First match wins: hard stop, kill switch, trailing stop, tier-target
    /// advancement, trend break, stagnant cleanup. Tier advancement mutates
    /// the metadata immediately; the engine reports the fill afterwards via
    /// [`apply_fill`](Self::apply_fill).
    pub fn evaluate(
        &mut self,
        symbol: &Symbol,
        price: f64,
        close: f64,
        atr: Option<f64>,
        ema50: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<ExitAction> {
        if price <= 0.0 {
            warn!(%symbol, price, "skipping exit evaluation on bad price");
            return None;
        }

        let config = self.config.clone();
        let meta = self.positions.get_mut(symbol)?;

        if close > meta.highest_close {
            meta.highest_close = close;
        }

        // Kill switch arms on hold time alone, locked to the best close seen
        if !meta.kill_switch_active && meta.days_held(now) >= config.kill_switch_min_hold_days {
            meta.kill_switch_active = true;
            if meta.tier1_lock_price.is_none() {
                meta.tier1_lock_price = Some(meta.highest_close);
            }
            debug!(%symbol, "kill switch armed by minimum hold period");
        }

        // Remnants left behind by partial sells are closed outright
        if meta.partial_taken
            && (meta.quantity < config.min_shares
                || meta.quantity * price < config.min_position_value)
        {
            return Some(ExitAction::full(
                ExitKind::Remnant,
                format!("remnant {} shares below minimum", meta.quantity),
            ));
        }

        let gain_pct = meta.unrealized_gain_pct(price);

        // The volatility-scaled loss floor holds at every profit level
        let max_loss = config.max_loss_pct(meta.volatility_class);
        if gain_pct <= -max_loss {
            return Some(ExitAction::full(
                ExitKind::HardStop,
                format!(
                    "loss {:.1}% breached {} volatility floor {:.1}%",
                    gain_pct,
                    meta.volatility_class.as_str(),
                    max_loss
                ),
            ));
        }

        if meta.profit_level < 2 && price <= meta.current_stop {
            return Some(ExitAction::full(
                ExitKind::HardStop,
                format!("price {:.2} hit stop {:.2}", price, meta.current_stop),
            ));
        }

        if meta.kill_switch_active {
            if let Some(lock) = meta.tier1_lock_price {
                let trigger = lock * (1.0 - config.kill_switch_drop_pct / 100.0);
                if price <= trigger {
                    return Some(ExitAction::full(
                        ExitKind::KillSwitch,
                        format!(
                            "price {:.2} gave back {:.1}% from lock {:.2}",
                            price, config.kill_switch_drop_pct, lock
                        ),
                    ));
                }
            }
        }

        if meta.profit_level == 2 {
            // Trailing stop ratchets under each new peak and never lowers
            let peak = meta.peak_price.get_or_insert(price);
            if price > *peak {
                *peak = price;
            }
            let reference_atr = match atr {
                Some(a) if a > 0.0 => a,
                _ => meta.entry_atr,
            };
            if reference_atr > 0.0 {
                let candidate = *peak - config.trailing_atr_mult * reference_atr;
                if candidate > meta.current_stop {
                    meta.current_stop = candidate;
                }
            }
            if price <= meta.current_stop {
                return Some(ExitAction::full(
                    ExitKind::TrailingStop,
                    format!(
                        "price {:.2} hit trailing stop {:.2} (peak {:.2})",
                        price,
                        meta.current_stop,
                        meta.peak_price.unwrap_or(price)
                    ),
                ));
            }
        }

        if meta.profit_level == 0 && gain_pct >= config.tier1_gain_pct {
            meta.profit_level = 1;
            meta.tier1_lock_price = Some(price);
            meta.kill_switch_active = true;
            meta.partial_taken = true;
            info!(%symbol, gain = gain_pct, "tier-1 target reached, kill switch armed");
            return Some(ExitAction {
                kind: ExitKind::TierTarget,
                fraction: config.tier1_sell_fraction,
                reason: format!("tier-1 target at {:.1}% gain", gain_pct),
            });
        }

        if meta.profit_level == 1 && gain_pct >= config.tier2_gain_pct {
            meta.profit_level = 2;
            meta.peak_price = Some(price);
            meta.partial_taken = true;
            let reference_atr = match atr {
                Some(a) if a > 0.0 => a,
                _ => meta.entry_atr,
            };
            if reference_atr > 0.0 {
                let candidate = price - config.trailing_atr_mult * reference_atr;
                if candidate > meta.current_stop {
                    meta.current_stop = candidate;
                }
            }
            info!(%symbol, gain = gain_pct, "tier-2 target reached, trailing engaged");
            return Some(ExitAction {
                kind: ExitKind::TierTarget,
                fraction: config.tier2_sell_fraction,
                reason: format!("tier-2 target at {:.1}% gain", gain_pct),
            });
        }

        // Persistent closes under the 50-bar mean read as a broken trend
        match ema50 {
            Some(ema) if close < ema => {
                meta.bars_below_ema50 += 1;
                if meta.bars_below_ema50 >= config.trend_break_bars {
                    return Some(ExitAction::full(
                        ExitKind::TrendBreak,
                        format!("{} consecutive closes below 50-bar average", meta.bars_below_ema50),
                    ));
                }
            }
            Some(_) => meta.bars_below_ema50 = 0,
            None => {}
        }

        let days = meta.days_held(now);
        if days >= config.max_hold_days && gain_pct < config.stagnant_min_gain_pct {
            return Some(ExitAction::full(
                ExitKind::Stagnant,
                format!("{} days held with {:.1}% gain", days, gain_pct),
            ));
        }

        None
    }

    /// Record a partial fill; quantity never goes below zero
    pub fn apply_fill(&mut self, symbol: &Symbol, sold_quantity: f64) {
        if let Some(meta) = self.positions.get_mut(symbol) {
            meta.quantity = (meta.quantity - sold_quantity).max(0.0);
        }
    }

    /// Remove tracking after a full close. Must be called exactly once per
    /// exit; a leaked record would haunt the next position in the ticker.
    pub fn clean_position_metadata(&mut self, symbol: &Symbol) -> Option<PositionMeta> {
        let removed = self.positions.remove(symbol);
        if removed.is_some() {
            debug!(%symbol, "position metadata cleaned");
        } else {
            warn!(%symbol, "clean requested for untracked position");
        }
        removed
    }

    /// Cross-validate tracked metadata against broker-reported positions.
    ///
    /// Broker positions with no record get minimal synthesized metadata (a
    /// warning, not a failure); records with no live position are dropped;
    /// diverging quantities defer to the broker.
    pub fn reconcile(&mut self, broker_positions: &[BrokerPosition], now: DateTime<Utc>) {
        let live: HashMap<&Symbol, &BrokerPosition> =
            broker_positions.iter().map(|p| (&p.symbol, p)).collect();

        let stale: Vec<Symbol> = self
            .positions
            .keys()
            .filter(|s| !live.contains_key(*s))
            .cloned()
            .collect();
        for symbol in stale {
            warn!(%symbol, "tracked position not reported by broker, dropping metadata");
            self.positions.remove(&symbol);
        }

        for position in broker_positions {
            match self.positions.get_mut(&position.symbol) {
                Some(meta) => {
                    if (meta.quantity - position.quantity).abs() > f64::EPSILON {
                        warn!(
                            symbol = %position.symbol,
                            tracked = meta.quantity,
                            reported = position.quantity,
                            "quantity mismatch, deferring to broker"
                        );
                        meta.quantity = position.quantity;
                    }
                }
                None => {
                    warn!(
                        symbol = %position.symbol,
                        "broker position without metadata, synthesizing"
                    );
                    self.track_position(
                        &position.symbol,
                        position.quantity,
                        position.avg_entry_price,
                        None,
                        "reconciled",
                        0.0,
                        VolatilityClass::Medium,
                        false,
                        now,
                    );
                }
            }
        }
    }
}
