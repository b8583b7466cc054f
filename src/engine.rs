//! Trading engine
//!
//! Owns the four state managers and runs one evaluation pass per scheduling
//! tick: portfolio snapshot, drawdown protection, regime assessment, exit
//! evaluation, rotation, entry scanning and sizing, then a state checkpoint.
//! One ticker's failure never aborts the others; every cycle emits a
//! structured outcome whether or not a trade happened.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::drawdown::DrawdownGuard;
use crate::indicators::{adx, ema, latest_atr, macd, rsi, sma};
use crate::market_data::breadth_above_sma;
use crate::monitor::{ExitAction, PositionMonitor};
use crate::regime::{RegimeAssessment, RegimeDetector};
use crate::rotation::StockRotation;
use crate::sizing::{PortfolioContext, PositionSizer};
use crate::state_store::{PersistenceWatchdog, StateStore};
use crate::{
    Candle, ClosedTrade, CycleOutcome, Money, ScoredOpportunity, Side, Symbol, VolatilityClass,
};

/// Market data for one cycle, fetched by the caller
#[derive(Debug, Default)]
pub struct MarketSnapshot {
    pub benchmark: Vec<Candle>,
    pub universe: HashMap<Symbol, Vec<Candle>>,
}

pub struct TradingEngine<B> {
    config: Config,
    broker: B,
    store: StateStore,
    drawdown: DrawdownGuard,
    regime: RegimeDetector,
    rotation: StockRotation,
    monitor: PositionMonitor,
    sizer: PositionSizer,
    watchdog: PersistenceWatchdog,
    last_portfolio_value: f64,
}

impl<B: Broker> TradingEngine<B> {
    /// Restore all persisted state and reconcile it against the broker
    pub async fn bootstrap(
        config: Config,
        broker: B,
        store: StateStore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Self> {
        let drawdown = match store.load_drawdown()? {
            Some(state) => DrawdownGuard::from_state(state, config.drawdown.clone(), now),
            None => DrawdownGuard::new(config.drawdown.clone()),
        };

        let regime = match store.load_regime()? {
            Some(state) => RegimeDetector::from_state(
                state,
                config.regime.clone(),
                config.trading.max_positions,
            ),
            None => RegimeDetector::new(config.regime.clone(), config.trading.max_positions),
        };

        let (records, last_run) = store.load_rotation()?;
        let rotation = StockRotation::from_records(records, last_run, config.rotation.clone());

        let mut monitor =
            PositionMonitor::from_metas(store.load_positions()?, config.exits.clone());

        match broker.get_positions().await {
            Ok(positions) => monitor.reconcile(&positions, now),
            Err(e) => warn!("startup reconciliation skipped, broker unreachable: {}", e),
        }

        let sizer = PositionSizer::new(
            config.sizing.clone(),
            config.trading.min_composite_score,
        );
        let watchdog = PersistenceWatchdog::new(config.store.persistence_fallback_secs);

        info!(
            open_positions = monitor.open_count(),
            "engine bootstrapped from persisted state"
        );

        Ok(Self {
            config,
            broker,
            store,
            drawdown,
            regime,
            rotation,
            monitor,
            sizer,
            watchdog,
            last_portfolio_value: 0.0,
        })
    }

    pub fn monitor(&self) -> &PositionMonitor {
        &self.monitor
    }

    pub fn rotation(&self) -> &StockRotation {
        &self.rotation
    }

    pub fn drawdown(&self) -> &DrawdownGuard {
        &self.drawdown
    }

    /// Run one full trading cycle against the supplied market snapshot
    pub async fn run_cycle(&mut self, now: DateTime<Utc>, market: &MarketSnapshot) -> CycleOutcome {
        let mut outcome = CycleOutcome::new(now, self.last_portfolio_value);

        // 1. Portfolio snapshot and drawdown protection
        match self.broker.get_portfolio_value().await {
            Ok(value) => {
                self.last_portfolio_value = value;
                outcome.portfolio_value = value;
                self.drawdown.update_peak(value);
                if self.drawdown.should_trigger(value) {
                    let drawdown_pct = self.drawdown.calculate_drawdown(value);
                    warn!(
                        value,
                        drawdown = drawdown_pct,
                        "drawdown threshold breached, liquidating"
                    );
                    self.liquidate_all(now, &mut outcome).await;
                    self.drawdown.activate(now);
                }
            }
            Err(e) => {
                // Stale peak state this cycle; triggers are skipped, exits are not
                outcome.warn(format!("portfolio value unavailable: {}", e));
            }
        }

        // 2. Regime assessment from the benchmark stream
        let assessment = self.assess_regime(market, &mut outcome);

        // 3. Exit evaluation, isolated per ticker
        self.process_exits(now, market, &mut outcome).await;

        // 4. Cadence-gated rotation pass
        let today = now.date_naive();
        if self.rotation.is_due(today) {
            let universe = self.config.trading.universe_symbols();
            let changed = self.rotation.evaluate_stocks(&universe, today);
            if !changed.is_empty() {
                info!(changed = changed.len(), "rotation pass moved tiers");
            }
        }

        // 5. Entry scanning and sizing
        let in_recovery = self.drawdown.is_in_recovery(now);
        let halted = self.watchdog.must_halt(now);
        if halted {
            outcome.fail("persistence fallback exhausted, new entries halted");
        }
        if assessment.allow_entries && !in_recovery && !halted {
            self.process_entries(now, market, &assessment, &mut outcome)
                .await;
        }

        // 6. Checkpoint
        self.persist(now, &mut outcome);

        info!(
            status = ?outcome.status,
            entries = outcome.entries_submitted,
            exits = outcome.exits_submitted,
            "cycle complete: {}",
            assessment.reason
        );
        outcome
    }

    // ------------------------------------------------------------------
    // Regime
    // ------------------------------------------------------------------

    fn assess_regime(
        &mut self,
        market: &MarketSnapshot,
        outcome: &mut CycleOutcome,
    ) -> RegimeAssessment {
        let Some(last_bar) = market.benchmark.last() else {
            outcome.warn("no benchmark data, entries blocked this cycle");
            return RegimeAssessment {
                recovery_mode_active: false,
                position_multiplier: 0.0,
                max_positions: 0,
                allow_entries: false,
                profit_target_pct: self.config.regime.normal_profit_target_pct,
                reason: "benchmark data unavailable".to_string(),
            };
        };

        let closes: Vec<f64> = market.benchmark.iter().map(|c| c.close).collect();
        let long_sma = sma(&closes, self.config.trading.benchmark_long_sma)
            .last()
            .and_then(|&v| v);
        // Without enough history the benchmark is given the benefit of the doubt
        let is_below = long_sma.map(|m| last_bar.close < m).unwrap_or(false);

        let breadth = breadth_above_sma(
            market.universe.values().map(|v| v.as_slice()),
            self.config.trading.benchmark_short_ema,
        );

        self.regime.evaluate(last_bar, is_below, breadth)
    }

    // ------------------------------------------------------------------
    // Exits
    // ------------------------------------------------------------------

    async fn process_exits(
        &mut self,
        now: DateTime<Utc>,
        market: &MarketSnapshot,
        outcome: &mut CycleOutcome,
    ) {
        for symbol in self.monitor.symbols() {
            let price = match self.broker.get_last_price(&symbol).await {
                Ok(p) => p,
                Err(e) => {
                    outcome.warn(format!("{}: price unavailable, exit check skipped ({})", symbol, e));
                    continue;
                }
            };

            let candles = market.universe.get(&symbol).map(|v| v.as_slice());
            let (atr_value, ema50, close) = Self::position_indicators(
                candles,
                self.config.trading.atr_period,
                price,
            );

            let Some(action) = self.monitor.evaluate(&symbol, price, close, atr_value, ema50, now)
            else {
                continue;
            };

            if let Err(e) = self.execute_exit(&symbol, price, &action, now).await {
                outcome.warn(format!("{}: exit order failed ({})", symbol, e));
                continue;
            }
            outcome.exits_submitted += 1;
        }
    }

    fn position_indicators(
        candles: Option<&[Candle]>,
        atr_period: usize,
        fallback_price: f64,
    ) -> (Option<f64>, Option<f64>, f64) {
        let Some(candles) = candles else {
            return (None, None, fallback_price);
        };
        let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let close: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let atr_value = latest_atr(&high, &low, &close, atr_period);
        let ema50 = ema(&close, 50).last().and_then(|&v| v);
        let last_close = close.last().copied().unwrap_or(fallback_price);
        (atr_value, ema50, last_close)
    }

    async fn execute_exit(
        &mut self,
        symbol: &Symbol,
        price: f64,
        action: &ExitAction,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(meta) = self.monitor.get(symbol) else {
            anyhow::bail!("no metadata for {}", symbol);
        };
        let held = meta.quantity;
        let quantity = if action.is_full_close() {
            held
        } else {
            (held * action.fraction).floor().max(1.0).min(held)
        };
        if quantity <= 0.0 {
            anyhow::bail!("nothing to sell for {}", symbol);
        }

        let entry_price = meta.entry_price;
        let entry_date = meta.entry_date;
        let entry_signal = meta.entry_signal.clone();

        self.broker
            .submit_order(symbol, quantity, Side::Sell)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        info!(
            %symbol,
            quantity,
            price,
            kind = action.kind.as_str(),
            reason = %action.reason,
            "exit order submitted"
        );

        if action.is_full_close() {
            let trade = ClosedTrade {
                symbol: symbol.clone(),
                side: Side::Buy,
                quantity,
                entry_price,
                exit_price: price,
                entry_time: entry_date,
                exit_time: now,
                pnl: Money::from_f64((price - entry_price) * quantity),
                exit_reason: action.kind.as_str().to_string(),
                entry_signal,
            };
            self.rotation.record_trade(&trade);
            if let Err(e) = self.store.record_trade(&trade) {
                warn!("trade audit write failed: {}", e);
            }
            self.monitor.clean_position_metadata(symbol);
        } else {
            self.monitor.apply_fill(symbol, quantity);
        }
        Ok(())
    }

    /// Best-effort liquidation of everything the monitor tracks. Orders are
    /// independent; one failure is logged and skipped, never rolled back.
    async fn liquidate_all(&mut self, now: DateTime<Utc>, outcome: &mut CycleOutcome) {
        for symbol in self.monitor.symbols() {
            let Some(meta) = self.monitor.get(&symbol) else {
                continue;
            };
            let quantity = meta.quantity;
            let entry_price = meta.entry_price;
            let entry_date = meta.entry_date;
            let entry_signal = meta.entry_signal.clone();

            let price = match self.broker.get_last_price(&symbol).await {
                Ok(p) => p,
                Err(_) => entry_price,
            };

            match self.broker.submit_order(&symbol, quantity, Side::Sell).await {
                Ok(_) => {
                    let trade = ClosedTrade {
                        symbol: symbol.clone(),
                        side: Side::Buy,
                        quantity,
                        entry_price,
                        exit_price: price,
                        entry_time: entry_date,
                        exit_time: now,
                        pnl: Money::from_f64((price - entry_price) * quantity),
                        exit_reason: "drawdown_protection".to_string(),
                        entry_signal,
                    };
                    self.rotation.record_trade(&trade);
                    if let Err(e) = self.store.record_trade(&trade) {
                        warn!("trade audit write failed: {}", e);
                    }
                    self.monitor.clean_position_metadata(&symbol);
                    outcome.exits_submitted += 1;
                }
                Err(e) => {
                    error!(%symbol, "liquidation order failed: {}", e);
                    outcome.warn(format!("{}: liquidation failed ({})", symbol, e));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    async fn process_entries(
        &mut self,
        now: DateTime<Utc>,
        market: &MarketSnapshot,
        assessment: &RegimeAssessment,
        outcome: &mut CycleOutcome,
    ) {
        let open = self.monitor.open_count();
        if open >= assessment.max_positions {
            return;
        }

        let mut opportunities = Vec::new();
        for symbol in self.config.trading.universe_symbols() {
            if self.monitor.get(&symbol).is_some() {
                continue;
            }
            // Frozen names never reach signal evaluation
            if !self.rotation.is_tradeable(&symbol) {
                continue;
            }
            let Some(candles) = market.universe.get(&symbol) else {
                continue;
            };
            if let Some(opportunity) =
                score_opportunity(&symbol, candles, self.config.trading.atr_period)
            {
                opportunities.push(opportunity);
            }
        }
        if opportunities.is_empty() {
            return;
        }

        let cash = match self.broker.get_cash().await {
            Ok(c) => c,
            Err(e) => {
                outcome.warn(format!("cash unavailable, entries skipped: {}", e));
                return;
            }
        };
        let existing_exposure = match self.broker.get_positions().await {
            Ok(positions) => positions
                .into_iter()
                .map(|p| (p.symbol, p.market_value))
                .collect(),
            Err(e) => {
                outcome.warn(format!("positions unavailable, entries skipped: {}", e));
                return;
            }
        };

        let ctx = PortfolioContext {
            deployable_cash: cash,
            portfolio_value: self.last_portfolio_value.max(cash),
            available_slots: assessment.max_positions - open,
            existing_exposure,
        };

        let allocations = self.sizer.allocate(
            &opportunities,
            &ctx,
            assessment.position_multiplier,
            |symbol| self.rotation.multiplier(symbol),
        );

        for allocation in allocations {
            let Some(opportunity) = opportunities.iter().find(|o| o.symbol == allocation.symbol)
            else {
                continue;
            };

            match self
                .broker
                .submit_order(&allocation.symbol, allocation.quantity, Side::Buy)
                .await
            {
                Ok(_) => {
                    info!(
                        symbol = %allocation.symbol,
                        quantity = allocation.quantity,
                        cost = allocation.cost,
                        "entry order submitted"
                    );
                    self.monitor.track_position(
                        &allocation.symbol,
                        allocation.quantity,
                        allocation.price,
                        Some(opportunity.atr),
                        &opportunity.signal,
                        opportunity.score,
                        opportunity.volatility_class,
                        false,
                        now,
                    );
                    outcome.entries_submitted += 1;
                }
                Err(e) => {
                    outcome.warn(format!("{}: entry order failed ({})", allocation.symbol, e));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn persist(&mut self, now: DateTime<Utc>, outcome: &mut CycleOutcome) {
        let result = self
            .store
            .save_drawdown(self.drawdown.state())
            .and_then(|_| self.store.save_regime(&self.regime.to_state()))
            .and_then(|_| {
                let records = self.rotation.records().cloned().collect_vec();
                self.store.replace_rotation(&records, self.rotation.last_run())
            })
            .and_then(|_| {
                let metas = self.monitor.positions().cloned().collect_vec();
                self.store.replace_positions(&metas)
            });

        match result {
            Ok(()) => self.watchdog.record_success(),
            Err(e) => {
                self.watchdog.record_failure(now);
                outcome.warn(format!("state checkpoint failed: {}", e));
            }
        }
    }
}

// =============================================================================
// Entry scoring
// =============================================================================

/// Composite 0-100 entry score from trend, momentum and strength readings.
/// Returns `None` when the history is too thin to judge.
pub fn score_opportunity(
    symbol: &Symbol,
    candles: &[Candle],
    atr_period: usize,
) -> Option<ScoredOpportunity> {
    if candles.len() < 50 {
        return None;
    }

    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();

    let price = *close.last()?;
    if price <= 0.0 {
        return None;
    }

    let sma50 = sma(&close, 50).last().and_then(|&v| v)?;
    let ema21 = ema(&close, 21).last().and_then(|&v| v)?;
    let rsi14 = rsi(&close, 14).last().and_then(|&v| v)?;
    let (_, _, histogram) = macd(&close, 12, 26, 9);
    let macd_hist = histogram.last().and_then(|&v| v).unwrap_or(0.0);
    let adx14 = adx(&high, &low, &close, 14).last().and_then(|&v| v).unwrap_or(0.0);

    let mut score = 0.0;
    if price > sma50 {
        score += 30.0;
    }
    if price > ema21 {
        score += 15.0;
    }
    if macd_hist > 0.0 {
        score += 20.0;
    }
    if (45.0..=70.0).contains(&rsi14) {
        score += 20.0;
    }
    if adx14 > 20.0 {
        score += 15.0;
    }

    let atr_value = latest_atr(&high, &low, &close, atr_period).unwrap_or(price * 0.02);
    let volatility_class = VolatilityClass::from_atr_ratio(atr_value, price);

    // Health is an independent gate: stretched names get a haircut
    let high_50 = high[high.len() - 50..]
        .iter()
        .fold(f64::MIN, |a, &b| a.max(b));
    let stock_health = if price >= high_50 * 0.95 { 1.0 } else { 0.85 };

    Some(ScoredOpportunity {
        symbol: symbol.clone(),
        score,
        price,
        atr: atr_value,
        volatility_class,
        stock_health,
        signal: "trend_momentum".to_string(),
    })
}
