//! Trading loop command
//!
//! Wires config, broker, state store and engine together, then ticks the
//! engine on the configured interval until a shutdown signal arrives. A
//! signal lets the current cycle finish; nothing is cancelled mid-cycle.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;
use tracing::{info, warn};

use swing_trader::broker::{RestBroker, RobustBroker};
use swing_trader::config::Config;
use swing_trader::engine::{MarketSnapshot, TradingEngine};
use swing_trader::market_data::{CandleCache, MarketDataClient};
use swing_trader::state_store::create_state_store;
use swing_trader::Symbol;

/// Bars needed so the long benchmark average is computable
const BENCHMARK_HISTORY: usize = 250;
const UNIVERSE_HISTORY: usize = 100;

pub fn run(
    config_path: String,
    paper: bool,
    live: bool,
    interval_override: Option<u64>,
    state_dir_override: Option<String>,
) -> Result<()> {
    if !paper && !live {
        anyhow::bail!("Must specify either --paper or --live mode");
    }

    if live {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 5 seconds to abort...");
        std::thread::sleep(Duration::from_secs(5));
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(config_path, paper, interval_override, state_dir_override))
}

async fn run_async(
    config_path: String,
    paper: bool,
    interval_override: Option<u64>,
    state_dir_override: Option<String>,
) -> Result<()> {
    let mut config = Config::from_file(&config_path).context("Failed to load configuration")?;
    if let Some(dir) = state_dir_override {
        config.store.state_dir = dir;
    }
    let interval_secs = interval_override.unwrap_or(config.trading.cycle_interval_secs);

    info!("Mode: {} trading", if paper { "PAPER" } else { "LIVE" });
    info!("Universe: {:?}", config.trading.universe);
    info!("Benchmark: {}", config.trading.benchmark);
    info!("Cycle interval: {}s", interval_secs);

    let store = create_state_store(&config.store.state_dir, config.store.auto_backup)?;
    let broker = RobustBroker::new(RestBroker::new(&config.broker)?, &config.broker);
    let data_client = MarketDataClient::new(config.broker.base_url.clone());
    let mut cache = CandleCache::new(BENCHMARK_HISTORY, interval_secs);

    let mut engine = TradingEngine::bootstrap(config.clone(), broker, store, chrono::Utc::now())
        .await
        .context("Failed to bootstrap engine")?;

    let shutdown = tokio::sync::Notify::new();
    let shutdown = std::sync::Arc::new(shutdown);
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received - finishing current cycle then stopping");
                shutdown.notify_one();
            }
        });
    }

    info!("Entering trading loop");
    let mut tick = interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let snapshot = fetch_snapshot(&data_client, &config, &mut cache).await;
                let outcome = engine.run_cycle(chrono::Utc::now(), &snapshot).await;
                for warning in &outcome.warnings {
                    warn!("cycle warning: {}", warning);
                }
            }
            _ = shutdown.notified() => {
                info!("Shutdown complete");
                break;
            }
        }
    }

    Ok(())
}

/// Pull benchmark and universe candles, falling back to the last cached
/// window per symbol when the feed is unreachable.
async fn fetch_snapshot(
    client: &MarketDataClient,
    config: &Config,
    cache: &mut CandleCache,
) -> MarketSnapshot {
    let benchmark_symbol = config.trading.benchmark_symbol();
    let benchmark = fetch_cached(client, cache, &benchmark_symbol, BENCHMARK_HISTORY).await;

    let mut universe = HashMap::new();
    for symbol in config.trading.universe_symbols() {
        let candles = fetch_cached(client, cache, &symbol, UNIVERSE_HISTORY).await;
        if !candles.is_empty() {
            universe.insert(symbol, candles);
        }
    }

    MarketSnapshot { benchmark, universe }
}

async fn fetch_cached(
    client: &MarketDataClient,
    cache: &mut CandleCache,
    symbol: &Symbol,
    limit: usize,
) -> Vec<swing_trader::Candle> {
    if let Some(fresh) = cache.get(symbol) {
        return fresh.to_vec();
    }
    match client.fetch_ohlcv(symbol, limit).await {
        Ok(candles) => {
            cache.put(symbol, candles.clone());
            candles
        }
        Err(e) => {
            warn!("{}: bar fetch failed ({}), using cached window", symbol, e);
            cache.get_stale(symbol).map(|c| c.to_vec()).unwrap_or_default()
        }
    }
}
