//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. Every threshold the decision
//! components consume lives here as a named, overridable field.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub drawdown: DrawdownConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // API credentials come from the environment, never the config file
        if let Ok(api_key) = std::env::var("BROKER_API_KEY") {
            config.broker.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BROKER_API_SECRET") {
            config.broker.api_secret = Some(api_secret);
        }

        Ok(config)
    }
}

/// Broker connectivity, retry and circuit-breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// Maximum retry attempts for retryable broker failures
    pub max_retries: u32,
    /// Base of the exponential backoff schedule, in seconds
    pub backoff_base_secs: u64,
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before probing recovery
    pub cooldown_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            base_url: "https://paper-api.example-broker.com".to_string(),
            api_key: None,
            api_secret: None,
            max_retries: 3,
            backoff_base_secs: 1,
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

/// Universe, cadence and scanning thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub universe: Vec<String>,
    /// Benchmark index symbol driving regime detection
    pub benchmark: String,
    /// Seconds between trading cycles
    pub cycle_interval_secs: u64,
    /// Long moving-average period on the benchmark (regime gate)
    pub benchmark_long_sma: usize,
    /// Short moving-average period used for breadth and follow-through
    pub benchmark_short_ema: usize,
    /// Minimum composite score an opportunity needs to be sized at all
    pub min_composite_score: f64,
    /// Hard cap on concurrent positions in a normal regime
    pub max_positions: usize,
    pub atr_period: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            universe: vec![
                "AAPL".to_string(),
                "MSFT".to_string(),
                "NVDA".to_string(),
                "AMZN".to_string(),
                "META".to_string(),
                "GOOGL".to_string(),
                "AMD".to_string(),
                "CRM".to_string(),
            ],
            benchmark: "SPY".to_string(),
            cycle_interval_secs: 900,
            benchmark_long_sma: 200,
            benchmark_short_ema: 21,
            min_composite_score: 55.0,
            max_positions: 25,
            atr_period: 14,
        }
    }
}

impl TradingConfig {
    pub fn universe_symbols(&self) -> Vec<Symbol> {
        self.universe.iter().map(Symbol::new).collect()
    }

    pub fn benchmark_symbol(&self) -> Symbol {
        Symbol::new(&self.benchmark)
    }
}

/// Portfolio drawdown circuit-breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownConfig {
    /// Trigger threshold in percent, negative (e.g. -8.0)
    pub threshold_pct: f64,
    /// Days of cooldown after a trigger during which no entries are allowed
    pub recovery_days: i64,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        DrawdownConfig {
            threshold_pct: -8.0,
            recovery_days: 5,
        }
    }
}

/// Market-structure and recovery-mode detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// Rolling benchmark window the detector keeps, in bars
    pub history_bars: usize,
    /// Single-day decline (percent, positive number) that marks capitulation
    pub capitulation_drop_pct: f64,
    /// Volume multiple of the rolling average required for a one-day capitulation
    pub capitulation_volume_ratio: f64,
    /// Consecutive down days that qualify as a capitulation cluster
    pub capitulation_down_days: usize,
    /// Cumulative decline (percent) the cluster must reach
    pub capitulation_cluster_pct: f64,
    /// Tolerance below the capitulation low that still counts as holding (fraction, e.g. 0.002)
    pub swing_low_tolerance: f64,
    /// Bars the low must hold before the swing low is confirmed
    pub swing_low_confirm_bars: usize,
    /// Earliest bar after confirmation on which follow-through may print
    pub follow_through_min_wait: usize,
    /// Latest bar after confirmation before the structure expires
    pub follow_through_max_window: usize,
    /// Gain (percent) that qualifies as follow-through on above-average volume
    pub follow_through_gain_pct: f64,
    /// Smaller gain that still qualifies when the close reclaims the short EMA
    pub follow_through_soft_gain_pct: f64,
    /// Position cap while recovery mode is active
    pub recovery_max_positions: usize,
    /// Position cap when the confirmed swing low is a higher low
    pub recovery_max_positions_higher_low: usize,
    /// Entry capital multiplier while recovery mode is active
    pub recovery_position_multiplier: f64,
    /// Profit target (percent) used while recovery mode is active
    pub recovery_profit_target_pct: f64,
    /// Profit target (percent) in a normal regime
    pub normal_profit_target_pct: f64,
    /// Calendar days after which recovery mode expires
    pub recovery_max_days: i64,
    /// Consecutive benchmark down days that cancel recovery mode
    pub recovery_down_day_limit: usize,
    /// Breadth floor (percent of universe above its short SMA)
    pub breadth_floor_pct: f64,
    /// Tolerated fraction below the confirmed swing low before recovery cancels
    pub swing_low_break_tolerance: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            history_bars: 50,
            capitulation_drop_pct: 1.75,
            capitulation_volume_ratio: 1.4,
            capitulation_down_days: 4,
            capitulation_cluster_pct: 4.0,
            swing_low_tolerance: 0.002,
            swing_low_confirm_bars: 1,
            follow_through_min_wait: 1,
            follow_through_max_window: 10,
            follow_through_gain_pct: 1.2,
            follow_through_soft_gain_pct: 0.8,
            recovery_max_positions: 8,
            recovery_max_positions_higher_low: 12,
            recovery_position_multiplier: 0.5,
            recovery_profit_target_pct: 6.0,
            normal_profit_target_pct: 10.0,
            recovery_max_days: 30,
            recovery_down_day_limit: 3,
            breadth_floor_pct: 35.0,
            swing_low_break_tolerance: 0.005,
        }
    }
}

/// Stock rotation tiering thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Days between rotation passes
    pub interval_days: i64,
    pub frozen_min_trades: u32,
    /// Win rate below which a ticker is frozen (fraction)
    pub frozen_win_rate: f64,
    pub premium_min_trades: u32,
    pub premium_win_rate: f64,
    pub premium_min_profit_factor: f64,
    pub standard_min_trades: u32,
    pub standard_win_rate: f64,
    /// Consecutive qualifying passes a frozen ticker needs to thaw
    pub recovery_consecutive_passes: u32,
    pub premium_multiplier: f64,
    pub standard_multiplier: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            interval_days: 7,
            frozen_min_trades: 5,
            frozen_win_rate: 0.30,
            premium_min_trades: 8,
            premium_win_rate: 0.60,
            premium_min_profit_factor: 1.5,
            standard_min_trades: 3,
            standard_win_rate: 0.40,
            recovery_consecutive_passes: 2,
            premium_multiplier: 1.5,
            standard_multiplier: 1.0,
        }
    }
}

/// Tiered-exit engine thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// ATR multiple below entry for the initial stop
    pub initial_stop_atr_mult: f64,
    /// Fallback stop distance (percent of entry) when ATR is unavailable
    pub stop_fallback_pct: f64,
    /// Unrealized gain (percent) that advances to profit level 1
    pub tier1_gain_pct: f64,
    /// Fraction of the position sold at tier 1
    pub tier1_sell_fraction: f64,
    /// Unrealized gain (percent) that advances to profit level 2
    pub tier2_gain_pct: f64,
    /// Fraction of the remaining shares sold at tier 2
    pub tier2_sell_fraction: f64,
    /// Drop from the tier-1 lock price that fires the kill switch (percent)
    pub kill_switch_drop_pct: f64,
    /// Days held after which the kill switch arms even without a tier-1 fill
    pub kill_switch_min_hold_days: i64,
    /// ATR multiple for the level-2 trailing stop
    pub trailing_atr_mult: f64,
    /// Maximum-loss floors (percent, positive) by volatility class
    pub max_loss_pct_low: f64,
    pub max_loss_pct_medium: f64,
    pub max_loss_pct_high: f64,
    pub max_loss_pct_very_high: f64,
    /// Days held beyond which an underperforming position is stagnant
    pub max_hold_days: i64,
    /// Gain (percent) a position must show to escape the stagnant rule
    pub stagnant_min_gain_pct: f64,
    /// Consecutive closes below the 50-bar EMA that flag a trend break
    pub trend_break_bars: u32,
    /// Remnants below this share count are fully liquidated
    pub min_shares: f64,
    /// Remnants below this dollar value are fully liquidated
    pub min_position_value: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        ExitConfig {
            initial_stop_atr_mult: 2.75,
            stop_fallback_pct: 8.0,
            tier1_gain_pct: 12.0,
            tier1_sell_fraction: 0.33,
            tier2_gain_pct: 20.0,
            tier2_sell_fraction: 0.50,
            kill_switch_drop_pct: 5.0,
            kill_switch_min_hold_days: 15,
            trailing_atr_mult: 2.0,
            max_loss_pct_low: 7.0,
            max_loss_pct_medium: 9.0,
            max_loss_pct_high: 12.0,
            max_loss_pct_very_high: 15.0,
            max_hold_days: 45,
            stagnant_min_gain_pct: 3.0,
            trend_break_bars: 5,
            min_shares: 1.0,
            min_position_value: 250.0,
        }
    }
}

impl ExitConfig {
    /// Maximum tolerated loss (percent, positive) for a volatility class
    pub fn max_loss_pct(&self, class: crate::VolatilityClass) -> f64 {
        use crate::VolatilityClass::*;
        match class {
            Low => self.max_loss_pct_low,
            Medium => self.max_loss_pct_medium,
            High => self.max_loss_pct_high,
            VeryHigh => self.max_loss_pct_very_high,
        }
    }
}

/// Position sizing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Base position size as a fraction of deployable cash
    pub base_position_pct: f64,
    /// Smallest dollar size worth opening
    pub min_position_value: f64,
    /// Per-ticker concentration cap as a fraction of portfolio value
    pub max_ticker_pct: f64,
    /// Volatility-class size multipliers
    pub volatility_mult_low: f64,
    pub volatility_mult_medium: f64,
    pub volatility_mult_high: f64,
    pub volatility_mult_very_high: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        SizingConfig {
            base_position_pct: 0.10,
            min_position_value: 500.0,
            max_ticker_pct: 0.15,
            volatility_mult_low: 1.1,
            volatility_mult_medium: 1.0,
            volatility_mult_high: 0.8,
            volatility_mult_very_high: 0.6,
        }
    }
}

impl SizingConfig {
    pub fn volatility_multiplier(&self, class: crate::VolatilityClass) -> f64 {
        use crate::VolatilityClass::*;
        match class {
            Low => self.volatility_mult_low,
            Medium => self.volatility_mult_medium,
            High => self.volatility_mult_high,
            VeryHigh => self.volatility_mult_very_high,
        }
    }
}

/// Durable state store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub state_dir: String,
    /// Seconds the bot may run on in-memory state while the store is down
    pub persistence_fallback_secs: i64,
    pub auto_backup: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            state_dir: "state".to_string(),
            persistence_fallback_secs: 1800,
            auto_backup: true,
        }
    }
}
