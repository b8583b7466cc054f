//! Core data types used across the trading system

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Create a candle without validation (for trusted sources)
    pub fn new_unchecked(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Validate the candle data
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Trading date of the bar
    pub fn date(&self) -> NaiveDate {
        self.datetime.date_naive()
    }

    /// Single-bar return in percent relative to the open
    pub fn change_pct(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.close - self.open) / self.open * 100.0
    }

    pub fn is_down(&self) -> bool {
        self.close < self.open
    }
}

/// Ticker symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned on every order, position and rotation record they touch.
/// Arc<str> keeps those clones at O(1) instead of re-allocating the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Volatility bucket of a position, derived from ATR relative to price.
///
/// Scales the hard maximum-loss floor: the wilder the name, the wider the
/// leash it gets before the unconditional stop fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityClass {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl VolatilityClass {
    /// Classify from the ATR-to-price ratio (daily bars)
    pub fn from_atr_ratio(atr: f64, price: f64) -> Self {
        if price <= 0.0 || atr <= 0.0 {
            return VolatilityClass::Medium;
        }
        let ratio = atr / price;
        if ratio < 0.015 {
            VolatilityClass::Low
        } else if ratio < 0.03 {
            VolatilityClass::Medium
        } else if ratio < 0.05 {
            VolatilityClass::High
        } else {
            VolatilityClass::VeryHigh
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolatilityClass::Low => "low",
            VolatilityClass::Medium => "medium",
            VolatilityClass::High => "high",
            VolatilityClass::VeryHigh => "very_high",
        }
    }
}

impl std::str::FromStr for VolatilityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(VolatilityClass::Low),
            "medium" => Ok(VolatilityClass::Medium),
            "high" => Ok(VolatilityClass::High),
            "very_high" => Ok(VolatilityClass::VeryHigh),
            other => Err(format!("unknown volatility class: {}", other)),
        }
    }
}

/// Completed round trip with precise decimal arithmetic for realized P&L
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: Money,
    pub exit_reason: String,
    pub entry_signal: String,
}

impl ClosedTrade {
    /// Return percentage over the round trip
    pub fn return_pct(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Buy => (self.exit_price - self.entry_price) / self.entry_price * 100.0,
            Side::Sell => (self.entry_price - self.exit_price) / self.entry_price * 100.0,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl.is_positive()
    }
}

/// A scanner candidate that survived signal evaluation, ready for sizing
#[derive(Debug, Clone)]
pub struct ScoredOpportunity {
    pub symbol: Symbol,
    /// Composite entry score, 0..=100
    pub score: f64,
    pub price: f64,
    pub atr: f64,
    pub volatility_class: VolatilityClass,
    /// Per-ticker health factor in (0, 1], independent of the regime gate
    pub stock_health: f64,
    pub signal: String,
}

/// Concrete order-ready allocation emitted by the sizer
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub symbol: Symbol,
    pub quantity: f64,
    pub cost: f64,
    pub price: f64,
    pub regime_multiplier: f64,
    pub rotation_multiplier: f64,
    pub volatility_multiplier: f64,
    pub health_multiplier: f64,
}

/// Outcome severity of one trading cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Success,
    Warning,
    Failure,
}

/// Structured result of a single trading cycle, produced whether or not
/// any order was submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub timestamp: DateTime<Utc>,
    pub status: CycleStatus,
    pub portfolio_value: f64,
    pub entries_submitted: usize,
    pub exits_submitted: usize,
    pub warnings: Vec<String>,
}

impl CycleOutcome {
    pub fn new(timestamp: DateTime<Utc>, portfolio_value: f64) -> Self {
        Self {
            timestamp,
            status: CycleStatus::Success,
            portfolio_value,
            entries_submitted: 0,
            exits_submitted: 0,
            warnings: Vec::new(),
        }
    }

    /// Downgrade to warning (a failure is never upgraded back)
    pub fn warn(&mut self, msg: impl Into<String>) {
        if self.status == CycleStatus::Success {
            self.status = CycleStatus::Warning;
        }
        self.warnings.push(msg.into());
    }

    pub fn fail(&mut self, msg: impl Into<String>) {
        self.status = CycleStatus::Failure;
        self.warnings.push(msg.into());
    }
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Monetary Values
// ============================================================================

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Money type for precise decimal arithmetic in monetary calculations.
///
/// Wraps `rust_decimal::Decimal` to prevent floating-point drift in realized
/// P&L tracking. `0.1 + 0.2 != 0.3` in f64; over thousands of trades the
/// rotation aggregates would drift from broker-reported balances.
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Create from f64 (indicator and price math stays in f64)
    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or_else(|_| {
            if value.is_nan() || value.is_infinite() {
                Decimal::ZERO
            } else {
                Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
            }
        }))
    }

    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::hash::Hash for Money {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl std::str::FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Money(s.parse::<Decimal>()?))
    }
}

impl From<f64> for Money {
    fn from(value: f64) -> Self {
        Money::from_f64(value)
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.to_f64()
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle::new_unchecked(
            Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
        )
    }

    #[test]
    fn test_candle_validation_accepts_good_bar() {
        assert!(candle(100.0, 105.0, 95.0, 102.0, 1000.0).is_valid());
    }

    #[test]
    fn test_candle_validation_rejects_inverted_range() {
        let c = candle(100.0, 90.0, 95.0, 92.0, 1000.0);
        assert!(matches!(
            c.validate(),
            Err(CandleValidationError::HighLessThanLow { .. })
        ));
    }

    #[test]
    fn test_candle_validation_rejects_negative_volume() {
        let c = candle(100.0, 105.0, 95.0, 102.0, -1.0);
        assert!(!c.is_valid());
    }

    #[test]
    fn test_candle_change_pct() {
        let c = candle(100.0, 105.0, 95.0, 98.0, 1000.0);
        assert!((c.change_pct() + 2.0).abs() < 1e-9);
        assert!(c.is_down());
    }

    #[test]
    fn test_symbol_roundtrip() {
        let symbol = Symbol::new("AAPL");
        assert_eq!(symbol.as_str(), "AAPL");
        let json = serde_json::to_string(&symbol).unwrap();
        let parsed: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(symbol, parsed);
    }

    #[test]
    fn test_volatility_classification() {
        assert_eq!(
            VolatilityClass::from_atr_ratio(1.0, 100.0),
            VolatilityClass::Low
        );
        assert_eq!(
            VolatilityClass::from_atr_ratio(2.0, 100.0),
            VolatilityClass::Medium
        );
        assert_eq!(
            VolatilityClass::from_atr_ratio(4.0, 100.0),
            VolatilityClass::High
        );
        assert_eq!(
            VolatilityClass::from_atr_ratio(6.0, 100.0),
            VolatilityClass::VeryHigh
        );
        // Degenerate inputs fall back to the middle bucket
        assert_eq!(
            VolatilityClass::from_atr_ratio(0.0, 100.0),
            VolatilityClass::Medium
        );
    }

    #[test]
    fn test_closed_trade_return_pct() {
        let trade = ClosedTrade {
            symbol: Symbol::new("MSFT"),
            side: Side::Buy,
            quantity: 10.0,
            entry_price: 100.0,
            exit_price: 110.0,
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            pnl: Money::from_f64(100.0),
            exit_reason: "tier1_target".to_string(),
            entry_signal: "trend_breakout".to_string(),
        };
        assert_eq!(trade.return_pct(), 10.0);
        assert!(trade.is_win());
    }

    #[test]
    fn test_cycle_outcome_status_transitions() {
        let mut outcome = CycleOutcome::new(Utc::now(), 100_000.0);
        assert_eq!(outcome.status, CycleStatus::Success);

        outcome.warn("one ticker skipped");
        assert_eq!(outcome.status, CycleStatus::Warning);

        outcome.fail("store unreachable");
        assert_eq!(outcome.status, CycleStatus::Failure);

        // A later warning must not mask the failure
        outcome.warn("another");
        assert_eq!(outcome.status, CycleStatus::Failure);
    }

    #[test]
    fn test_money_precision() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        let c = Money::from_f64(0.3);
        assert_eq!(a + b, c);
        assert_eq!((a + b).inner(), rust_decimal_macros::dec!(0.3));
    }

    #[test]
    fn test_money_div_by_zero() {
        assert_eq!(Money::from_f64(100.0) / Money::ZERO, Money::ZERO);
    }

    #[test]
    fn test_money_sum() {
        let values = vec![
            Money::from_f64(10.0),
            Money::from_f64(20.0),
            Money::from_f64(30.0),
        ];
        let total: Money = values.into_iter().sum();
        assert_eq!(total.to_f64(), 60.0);
    }
}
