//! Integration tests for the swing-trading engine
//!
//! Cross-component scenarios driven through the public engine API with a
//! mock broker: the bottoming-structure pipeline, rotation tiering, the
//! tiered exit ladder and drawdown protection.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use swing_trader::broker::{Broker, BrokerError, BrokerPosition, BrokerResult, OrderAck};
use swing_trader::config::Config;
use swing_trader::engine::{MarketSnapshot, TradingEngine};
use swing_trader::regime::RegimeDetector;
use swing_trader::rotation::{StockRotation, Tier};
use swing_trader::state_store::create_state_store;
use swing_trader::{Candle, ClosedTrade, Money, Side, Symbol};

// =============================================================================
// Test Utilities
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct SubmittedOrder {
    symbol: Symbol,
    quantity: f64,
    side: Side,
}

#[derive(Default)]
struct MockState {
    cash: f64,
    portfolio_value: f64,
    prices: HashMap<Symbol, f64>,
    positions: Vec<BrokerPosition>,
    orders: Vec<SubmittedOrder>,
}

/// In-memory broker double; every call succeeds
struct MockBroker {
    state: Mutex<MockState>,
}

impl MockBroker {
    fn new(cash: f64, portfolio_value: f64) -> Self {
        Self {
            state: Mutex::new(MockState {
                cash,
                portfolio_value,
                ..Default::default()
            }),
        }
    }

    fn set_price(&self, symbol: &str, price: f64) {
        self.state
            .lock()
            .unwrap()
            .prices
            .insert(Symbol::new(symbol), price);
    }

    fn set_portfolio_value(&self, value: f64) {
        self.state.lock().unwrap().portfolio_value = value;
    }

    fn add_position(&self, symbol: &str, quantity: f64, avg_entry_price: f64) {
        let mut state = self.state.lock().unwrap();
        state.positions.push(BrokerPosition {
            symbol: Symbol::new(symbol),
            quantity,
            avg_entry_price,
            market_value: quantity * avg_entry_price,
        });
    }

    fn orders(&self) -> Vec<SubmittedOrder> {
        self.state.lock().unwrap().orders.clone()
    }

    fn buys(&self) -> Vec<SubmittedOrder> {
        self.orders()
            .into_iter()
            .filter(|o| o.side == Side::Buy)
            .collect()
    }

    fn sells(&self) -> Vec<SubmittedOrder> {
        self.orders()
            .into_iter()
            .filter(|o| o.side == Side::Sell)
            .collect()
    }
}

#[async_trait]
impl Broker for &MockBroker {
    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn get_last_price(&self, symbol: &Symbol) -> BrokerResult<f64> {
        self.state
            .lock()
            .unwrap()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Fatal(format!("no quote for {}", symbol)))
    }

    async fn get_cash(&self) -> BrokerResult<f64> {
        Ok(self.state.lock().unwrap().cash)
    }

    async fn get_portfolio_value(&self) -> BrokerResult<f64> {
        Ok(self.state.lock().unwrap().portfolio_value)
    }

    async fn submit_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        side: Side,
    ) -> BrokerResult<OrderAck> {
        let mut state = self.state.lock().unwrap();
        state.orders.push(SubmittedOrder {
            symbol: symbol.clone(),
            quantity,
            side,
        });
        Ok(OrderAck {
            order_id: format!("order-{}", state.orders.len()),
            symbol: symbol.clone(),
            quantity,
            side,
        })
    }
}

fn candle(day_offset: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
    Candle::new_unchecked(
        Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap() + Duration::days(day_offset),
        open,
        high,
        low,
        close,
        volume,
    )
}

/// Steadily rising daily bars, enough history for the entry scanner
fn trending_candles(count: usize, base: f64, step: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let price = base + i as f64 * step;
            candle(i as i64, price - 0.2, price + 0.5, price - 0.5, price, 1000.0)
        })
        .collect()
}

fn flat_candles(count: usize, price: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| candle(i as i64, price, price + 1.0, price - 1.0, price, 1000.0))
        .collect()
}

fn test_config(universe: &[&str], state_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.trading.universe = universe.iter().map(|s| s.to_string()).collect();
    config.trading.benchmark = "SPY".to_string();
    config.store.state_dir = state_dir.to_string_lossy().into_owned();
    config.store.auto_backup = false;
    config
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "swing_it_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// =============================================================================
// Scenario A: capitulation -> swing low -> follow-through -> recovery
// =============================================================================

#[test]
fn test_scenario_bottoming_structure_to_recovery() {
    let mut detector = RegimeDetector::new(Default::default(), 25);

    // Warm up the volume average in a locked market
    for i in 0..10 {
        detector.evaluate(&candle(i, 100.0, 101.0, 99.0, 100.0, 1000.0), true, None);
    }

    // 2% drop on 1.5x average volume
    let day1 = detector.evaluate(&candle(10, 100.0, 100.0, 97.5, 98.0, 1500.0), true, None);
    assert!(!day1.allow_entries);
    assert_eq!(
        detector.structure().capitulation.as_ref().unwrap().low_price,
        97.5
    );

    // Holds above that low within tolerance
    detector.evaluate(&candle(11, 98.0, 99.0, 97.6, 98.5, 1000.0), true, None);
    assert!(detector.structure().swing_low.is_some());

    // 1.3% gain on 1.1x average volume: follow-through confirms recovery
    let day3 = detector.evaluate(&candle(12, 98.5, 100.0, 98.3, 99.8, 1150.0), true, None);
    assert!(day3.recovery_mode_active);
    assert!(day3.allow_entries);
    assert!(day3.position_multiplier < 1.0);
    assert!(day3.max_positions > 0);
}

// =============================================================================
// Scenario B: rotation tiering
// =============================================================================

#[test]
fn test_scenario_premium_tier_multiplier() {
    let mut rotation = StockRotation::new(Default::default());
    let symbol = Symbol::new("NVDA");

    // 12 closed trades, 9 wins, profit factor 1.8, positive total P&L
    for _ in 0..9 {
        rotation.record_trade(&closed_trade(&symbol, 120.0));
    }
    for _ in 0..3 {
        rotation.record_trade(&closed_trade(&symbol, -200.0));
    }

    rotation.evaluate_stocks(
        &[symbol.clone()],
        chrono::NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
    );

    let record = rotation.record(&symbol).unwrap();
    assert_eq!(record.tier, Tier::Premium);
    assert!((record.profit_factor() - 1.8).abs() < 1e-9);
    assert_eq!(rotation.multiplier(&symbol), 1.5);
}

fn closed_trade(symbol: &Symbol, pnl: f64) -> ClosedTrade {
    ClosedTrade {
        symbol: symbol.clone(),
        side: Side::Buy,
        quantity: 10.0,
        entry_price: 100.0,
        exit_price: 100.0 + pnl / 10.0,
        entry_time: Utc::now(),
        exit_time: Utc::now(),
        pnl: Money::from_f64(pnl),
        exit_reason: "tier_target".to_string(),
        entry_signal: "trend_momentum".to_string(),
    }
}

// =============================================================================
// Scenario C: entry, tier-1 partial, kill-switch exit (full engine)
// =============================================================================

#[tokio::test]
async fn test_scenario_tiered_exit_through_engine() {
    let dir = temp_dir("tiered");
    let config = test_config(&["AAPL"], &dir);
    let store = create_state_store(&dir, false).unwrap();
    let broker = MockBroker::new(50_000.0, 100_000.0);
    let now = Utc::now();

    let mut engine = TradingEngine::bootstrap(config, &broker, store, now)
        .await
        .unwrap();

    // Cycle 1: strong uptrend, benchmark healthy -> entry submitted
    let entry_price = 100.0 + 79.0 * 0.5; // last close of the trend
    broker.set_price("AAPL", entry_price);
    let mut universe = HashMap::new();
    universe.insert(Symbol::new("AAPL"), trending_candles(80, 100.0, 0.5));
    let snapshot = MarketSnapshot {
        benchmark: flat_candles(60, 500.0),
        universe,
    };

    let outcome = engine.run_cycle(now, &snapshot).await;
    assert_eq!(outcome.entries_submitted, 1);
    let buys = broker.buys();
    assert_eq!(buys.len(), 1);
    let bought = buys[0].quantity;
    assert!(bought > 0.0);
    assert_eq!(engine.monitor().open_count(), 1);

    // Cycle 2: 13% pop fires tier 1, a third comes off
    let bare = MarketSnapshot {
        benchmark: flat_candles(60, 500.0),
        universe: HashMap::new(),
    };
    let tier1_price = entry_price * 1.13;
    broker.set_price("AAPL", tier1_price);
    let outcome = engine.run_cycle(now, &bare).await;
    assert_eq!(outcome.exits_submitted, 1);
    let sells = broker.sells();
    assert_eq!(sells.len(), 1);
    assert!((sells[0].quantity - (bought * 0.33).floor()).abs() < 1e-9);
    assert_eq!(engine.monitor().open_count(), 1);

    let meta = engine.monitor().get(&Symbol::new("AAPL")).unwrap();
    assert_eq!(meta.profit_level, 1);
    assert!(meta.kill_switch_active);

    // Cycle 3: giving back more than 5% from the lock price closes the rest
    broker.set_price("AAPL", tier1_price * 0.94);
    let outcome = engine.run_cycle(now, &bare).await;
    assert_eq!(outcome.exits_submitted, 1);
    assert_eq!(engine.monitor().open_count(), 0);

    let sells = broker.sells();
    assert_eq!(sells.len(), 2);
    assert!((sells[1].quantity - (bought - sells[0].quantity)).abs() < 1e-9);

    // The round trip landed in the rotation bookkeeping
    let record = engine.rotation().record(&Symbol::new("AAPL")).unwrap();
    assert_eq!(record.total_trades, 1);
    assert!(record.total_pnl.is_positive());

    std::fs::remove_dir_all(dir).ok();
}

// =============================================================================
// Scenario D: drawdown trigger, liquidation, entry lockout
// =============================================================================

#[tokio::test]
async fn test_scenario_drawdown_protection_lifecycle() {
    let dir = temp_dir("drawdown");
    let config = test_config(&["AAPL", "MSFT"], &dir);
    let store = create_state_store(&dir, false).unwrap();
    let broker = MockBroker::new(50_000.0, 100_000.0);
    let now = Utc::now();

    // One live position the engine learns about at bootstrap
    broker.add_position("AAPL", 100.0, 100.0);
    broker.set_price("AAPL", 100.0);
    broker.set_price("MSFT", 139.5);

    let mut engine = TradingEngine::bootstrap(config, &broker, store, now)
        .await
        .unwrap();
    assert_eq!(engine.monitor().open_count(), 1);

    let bare = MarketSnapshot {
        benchmark: flat_candles(60, 500.0),
        universe: HashMap::new(),
    };

    // Cycle 1 establishes the $100k peak
    engine.run_cycle(now, &bare).await;
    assert_eq!(engine.drawdown().state().peak_value, 100_000.0);
    assert!(broker.sells().is_empty());

    // Cycle 2: -9% against the peak crosses the -8% threshold
    broker.set_portfolio_value(91_000.0);
    broker.set_price("AAPL", 91.0);
    let outcome = engine.run_cycle(now + Duration::hours(1), &bare).await;

    assert!(engine.drawdown().state().protection_active);
    assert_eq!(engine.drawdown().state().trigger_count, 1);
    assert_eq!(outcome.exits_submitted, 1);
    let sells = broker.sells();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].quantity, 100.0);
    assert_eq!(engine.monitor().open_count(), 0);

    // Cycle 3: a perfectly good setup is rejected while the window holds
    let mut universe = HashMap::new();
    universe.insert(Symbol::new("MSFT"), trending_candles(80, 100.0, 0.5));
    let tradeable = MarketSnapshot {
        benchmark: flat_candles(60, 500.0),
        universe,
    };
    let outcome = engine
        .run_cycle(now + Duration::hours(2), &tradeable)
        .await;
    assert_eq!(outcome.entries_submitted, 0);
    assert!(broker.buys().is_empty());

    // Cycle 4: past the recovery window the same setup goes through
    let outcome = engine.run_cycle(now + Duration::days(6), &tradeable).await;
    assert_eq!(outcome.entries_submitted, 1);
    assert_eq!(broker.buys().len(), 1);
    assert_eq!(broker.buys()[0].symbol, Symbol::new("MSFT"));

    std::fs::remove_dir_all(dir).ok();
}

// =============================================================================
// Persistence across restart
// =============================================================================

#[tokio::test]
async fn test_state_survives_engine_restart() {
    let dir = temp_dir("restart");
    let now = Utc::now();
    let broker = MockBroker::new(50_000.0, 100_000.0);
    broker.set_price("AAPL", 139.5);

    // First engine takes a position and checkpoints
    {
        let config = test_config(&["AAPL"], &dir);
        let store = create_state_store(&dir, false).unwrap();
        let mut engine = TradingEngine::bootstrap(config, &broker, store, now)
            .await
            .unwrap();

        let mut universe = HashMap::new();
        universe.insert(Symbol::new("AAPL"), trending_candles(80, 100.0, 0.5));
        let snapshot = MarketSnapshot {
            benchmark: flat_candles(60, 500.0),
            universe,
        };
        let outcome = engine.run_cycle(now, &snapshot).await;
        assert_eq!(outcome.entries_submitted, 1);
    }

    // The broker still reports the fill after the restart
    let bought = broker.buys()[0].quantity;
    broker.add_position("AAPL", bought, 139.5);

    // Second engine restores the same position metadata from disk
    let config = test_config(&["AAPL"], &dir);
    let store = create_state_store(&dir, false).unwrap();
    let engine = TradingEngine::bootstrap(config, &broker, store, now)
        .await
        .unwrap();

    assert_eq!(engine.monitor().open_count(), 1);
    let meta = engine.monitor().get(&Symbol::new("AAPL")).unwrap();
    assert_eq!(meta.entry_price, 139.5);
    assert_eq!(meta.profit_level, 0);
    assert!((meta.quantity - bought).abs() < 1e-9);

    std::fs::remove_dir_all(dir).ok();
}

// =============================================================================
// Per-ticker failure isolation
// =============================================================================

#[tokio::test]
async fn test_one_bad_ticker_does_not_abort_the_cycle() {
    let dir = temp_dir("isolation");
    let config = test_config(&["AAPL", "MSFT"], &dir);
    let store = create_state_store(&dir, false).unwrap();
    let broker = MockBroker::new(50_000.0, 100_000.0);
    let now = Utc::now();

    // Two live positions; only MSFT has a quote
    broker.add_position("AAPL", 10.0, 100.0);
    broker.add_position("MSFT", 10.0, 200.0);
    broker.set_price("MSFT", 150.0); // down 25%: hard stop territory

    let mut engine = TradingEngine::bootstrap(config, &broker, store, now)
        .await
        .unwrap();
    assert_eq!(engine.monitor().open_count(), 2);

    let bare = MarketSnapshot {
        benchmark: flat_candles(60, 500.0),
        universe: HashMap::new(),
    };
    let outcome = engine.run_cycle(now, &bare).await;

    // AAPL's missing quote produced a warning, MSFT still exited
    assert!(outcome.warnings.iter().any(|w| w.contains("AAPL")));
    assert_eq!(outcome.exits_submitted, 1);
    assert_eq!(broker.sells()[0].symbol, Symbol::new("MSFT"));
    assert!(engine.monitor().get(&Symbol::new("AAPL")).is_some());

    std::fs::remove_dir_all(dir).ok();
}
