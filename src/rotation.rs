//! Stock rotation
//!
//! Per-ticker performance bookkeeping that assigns a capital-multiplier tier
//! from realized trade history. Premium names get extra capital, standard
//! names the base allocation, frozen names none at all. Freezing happens in
//! a single bad evaluation; thawing requires a run of consecutive qualifying
//! passes so one good week cannot flip a ticker back on.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::RotationConfig;
use crate::{ClosedTrade, Money, Symbol};

/// Capital tier of a ticker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Premium,
    Standard,
    Frozen,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Premium => "premium",
            Tier::Standard => "standard",
            Tier::Frozen => "frozen",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "premium" => Ok(Tier::Premium),
            "standard" => Ok(Tier::Standard),
            "frozen" => Ok(Tier::Frozen),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// Persisted per-ticker rotation record. Created on first evaluation,
/// updated on the rotation cadence, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerRecord {
    pub symbol: Symbol,
    pub tier: Tier,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    pub total_trades: u32,
    pub total_wins: u32,
    pub total_pnl: Money,
    pub total_win_pnl: Money,
    pub total_loss_pnl: Money,
    pub last_tier_change: Option<NaiveDate>,
    /// Consecutive qualifying passes while frozen; resets on any failed pass
    pub recovery_pass_count: u32,
}

impl TickerRecord {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            tier: Tier::Standard,
            consecutive_wins: 0,
            consecutive_losses: 0,
            total_trades: 0,
            total_wins: 0,
            total_pnl: Money::ZERO,
            total_win_pnl: Money::ZERO,
            total_loss_pnl: Money::ZERO,
            last_tier_change: None,
            recovery_pass_count: 0,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.total_wins as f64 / self.total_trades as f64
    }

    /// Gross winning P&L over gross losing P&L. Positive infinity when there
    /// are wins and no losses; zero with no trades.
    pub fn profit_factor(&self) -> f64 {
        let wins = self.total_win_pnl.to_f64();
        let losses = self.total_loss_pnl.to_f64().abs();
        if losses == 0.0 {
            if wins > 0.0 {
                return f64::INFINITY;
            }
            return 0.0;
        }
        wins / losses
    }

    pub fn avg_win(&self) -> f64 {
        if self.total_wins == 0 {
            return 0.0;
        }
        self.total_win_pnl.to_f64() / self.total_wins as f64
    }

    pub fn avg_loss(&self) -> f64 {
        let losses = self.total_trades - self.total_wins;
        if losses == 0 {
            return 0.0;
        }
        self.total_loss_pnl.to_f64().abs() / losses as f64
    }
}

pub struct StockRotation {
    records: HashMap<Symbol, TickerRecord>,
    last_run: Option<NaiveDate>,
    config: RotationConfig,
}

impl StockRotation {
    pub fn new(config: RotationConfig) -> Self {
        Self {
            records: HashMap::new(),
            last_run: None,
            config,
        }
    }

    pub fn from_records(
        records: Vec<TickerRecord>,
        last_run: Option<NaiveDate>,
        config: RotationConfig,
    ) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.symbol.clone(), r))
                .collect(),
            last_run,
            config,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &TickerRecord> {
        self.records.values()
    }

    pub fn record(&self, symbol: &Symbol) -> Option<&TickerRecord> {
        self.records.get(symbol)
    }

    pub fn last_run(&self) -> Option<NaiveDate> {
        self.last_run
    }

    /// Fold one closed trade into the ticker's aggregates
    pub fn record_trade(&mut self, trade: &ClosedTrade) {
        let record = self
            .records
            .entry(trade.symbol.clone())
            .or_insert_with(|| TickerRecord::new(trade.symbol.clone()));

        record.total_trades += 1;
        record.total_pnl += trade.pnl;
        if trade.is_win() {
            record.total_wins += 1;
            record.total_win_pnl += trade.pnl;
            record.consecutive_wins += 1;
            record.consecutive_losses = 0;
        } else {
            record.total_loss_pnl += trade.pnl;
            record.consecutive_losses += 1;
            record.consecutive_wins = 0;
        }
    }

    /// Whether enough days have passed since the last rotation pass
    pub fn is_due(&self, date: NaiveDate) -> bool {
        match self.last_run {
            Some(last) => (date - last).num_days() >= self.config.interval_days,
            None => true,
        }
    }

    /// Run a rotation pass over the given tickers.
    ///
    /// Returns the symbols whose tier changed. Skips silently (without
    /// consuming the cadence) when the pass is not yet due.
    pub fn evaluate_stocks(&mut self, tickers: &[Symbol], date: NaiveDate) -> Vec<Symbol> {
        if !self.is_due(date) {
            return Vec::new();
        }
        self.last_run = Some(date);

        let mut changed = Vec::new();
        for symbol in tickers {
            let record = self
                .records
                .entry(symbol.clone())
                .or_insert_with(|| TickerRecord::new(symbol.clone()));

            let old_tier = record.tier;
            Self::apply_tier(record, &self.config, date);
            if record.tier != old_tier {
                info!(
                    symbol = %record.symbol,
                    from = old_tier.as_str(),
                    to = record.tier.as_str(),
                    "rotation tier change"
                );
                changed.push(symbol.clone());
            } else {
                debug!(
                    symbol = %record.symbol,
                    tier = record.tier.as_str(),
                    win_rate = record.win_rate(),
                    "rotation pass"
                );
            }
        }
        changed
    }

    fn apply_tier(record: &mut TickerRecord, config: &RotationConfig, date: NaiveDate) {
        match record.tier {
            Tier::Frozen => {
                // Thawing needs a run of qualifying passes, not one good week
                if Self::qualifies_standard(record, config) {
                    record.recovery_pass_count += 1;
                    if record.recovery_pass_count >= config.recovery_consecutive_passes {
                        record.tier = Tier::Standard;
                        record.recovery_pass_count = 0;
                        record.last_tier_change = Some(date);
                    }
                } else {
                    record.recovery_pass_count = 0;
                }
            }
            Tier::Premium | Tier::Standard => {
                let next = if Self::qualifies_frozen(record, config) {
                    Tier::Frozen
                } else if Self::qualifies_premium(record, config) {
                    Tier::Premium
                } else {
                    Tier::Standard
                };
                if next != record.tier {
                    record.tier = next;
                    record.recovery_pass_count = 0;
                    record.last_tier_change = Some(date);
                }
            }
        }
    }

    fn qualifies_frozen(record: &TickerRecord, config: &RotationConfig) -> bool {
        record.total_trades >= config.frozen_min_trades
            && record.win_rate() < config.frozen_win_rate
    }

    fn qualifies_premium(record: &TickerRecord, config: &RotationConfig) -> bool {
        record.total_trades >= config.premium_min_trades
            && record.win_rate() >= config.premium_win_rate
            && record.total_pnl.is_positive()
            && record.profit_factor() >= config.premium_min_profit_factor
    }

    fn qualifies_standard(record: &TickerRecord, config: &RotationConfig) -> bool {
        record.total_trades >= config.standard_min_trades
            && record.win_rate() >= config.standard_win_rate
            && !Self::qualifies_frozen(record, config)
    }

    /// Capital multiplier for sizing. Frozen is untradeable, not down-weighted.
    pub fn multiplier(&self, symbol: &Symbol) -> f64 {
        match self.records.get(symbol).map(|r| r.tier) {
            Some(Tier::Premium) => self.config.premium_multiplier,
            Some(Tier::Standard) | None => self.config.standard_multiplier,
            Some(Tier::Frozen) => 0.0,
        }
    }

    /// Frozen tickers are skipped before signal evaluation
    pub fn is_tradeable(&self, symbol: &Symbol) -> bool {
        !matches!(self.records.get(symbol).map(|r| r.tier), Some(Tier::Frozen))
    }
}
