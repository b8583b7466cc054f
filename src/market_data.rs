//! Market data loading and management
//!
//! REST OHLCV fetching with a CSV disk cache and an in-memory per-symbol
//! window. The decision components only ever see validated candles; bad
//! bars are counted and skipped, never propagated.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::indicators::sma;
use crate::{Candle, Symbol};

// =============================================================================
// CSV disk cache
// =============================================================================

/// Load OHLCV data from CSV file (datetime, open, high, low, close, volume)
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut candles = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let datetime = dt_str
            .parse::<DateTime<Utc>>()
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(dt_str, "%Y-%m-%d %H:%M:%S")
                    .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
            })
            .context(format!("Failed to parse datetime: {}", dt_str))?;

        let parse_col = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .context(format!("Missing {} column", name))?
                .parse()
                .context(format!("Failed to parse {}", name))
        };

        candles.push(Candle {
            datetime,
            open: parse_col(1, "open")?,
            high: parse_col(2, "high")?,
            low: parse_col(3, "low")?,
            close: parse_col(4, "close")?,
            volume: parse_col(5, "volume")?,
        });
    }

    Ok(candles)
}

/// Write candles to a CSV file, creating parent directories as needed
pub fn save_csv(path: impl AsRef<Path>, candles: &[Candle]) -> Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path.as_ref()).context("Failed to create CSV file")?;
    writer.write_record(["datetime", "open", "high", "low", "close", "volume"])?;
    for candle in candles {
        writer.write_record([
            candle.datetime.to_rfc3339(),
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

/// Data-quality summary over a candle series
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub total: usize,
    pub invalid: usize,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.invalid == 0
    }
}

pub fn validate_candles(candles: &[Candle]) -> ValidationReport {
    let invalid = candles.iter().filter(|c| !c.is_valid()).count();
    if invalid > 0 {
        warn!("{}/{} candles failed validation", invalid, candles.len());
    }
    ValidationReport {
        total: candles.len(),
        invalid,
    }
}

// =============================================================================
// REST fetcher
// =============================================================================

#[derive(Debug, serde::Deserialize)]
struct BarRow {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

/// OHLCV REST client for the market-data endpoint
pub struct MarketDataClient {
    base_url: String,
    client: reqwest::Client,
}

impl MarketDataClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch up to `limit` daily bars for a symbol, oldest first
    pub async fn fetch_ohlcv(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/v1/bars/{}?timeframe=1D&limit={}",
            self.base_url,
            symbol.as_str(),
            limit
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch bars")?;

        let status = response.status();
        let text = response.text().await.context("Failed to read bar response")?;
        if !status.is_success() {
            anyhow::bail!("bar request failed ({}): {}", status, text);
        }

        let rows: Vec<BarRow> = serde_json::from_str(&text).context("Failed to parse bars")?;
        let mut candles: Vec<Candle> = rows
            .into_iter()
            .filter_map(|row| {
                let datetime = DateTime::<Utc>::from_timestamp(row.t, 0)?;
                Some(Candle::new_unchecked(
                    datetime, row.o, row.h, row.l, row.c, row.v,
                ))
            })
            .collect();
        candles.sort_by_key(|c| c.datetime);

        let report = validate_candles(&candles);
        if !report.is_valid() {
            candles.retain(|c| c.is_valid());
        }

        debug!("Fetched {} candles for {}", candles.len(), symbol);
        Ok(candles)
    }
}

// =============================================================================
// In-memory cache
// =============================================================================

/// Per-symbol candle window with a freshness TTL
pub struct CandleCache {
    data: HashMap<Symbol, Vec<Candle>>,
    fetched_at: HashMap<Symbol, Instant>,
    max_bars: usize,
    ttl: Duration,
}

impl CandleCache {
    pub fn new(max_bars: usize, ttl_secs: u64) -> Self {
        Self {
            data: HashMap::new(),
            fetched_at: HashMap::new(),
            max_bars,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Candles for a symbol, if present and fresh
    pub fn get(&self, symbol: &Symbol) -> Option<&[Candle]> {
        let age_ok = self
            .fetched_at
            .get(symbol)
            .map(|t| t.elapsed() < self.ttl)
            .unwrap_or(false);
        if !age_ok {
            return None;
        }
        self.data.get(symbol).map(|v| v.as_slice())
    }

    /// Candles regardless of freshness (fallback when the feed is down)
    pub fn get_stale(&self, symbol: &Symbol) -> Option<&[Candle]> {
        self.data.get(symbol).map(|v| v.as_slice())
    }

    pub fn put(&mut self, symbol: &Symbol, mut candles: Vec<Candle>) {
        if candles.len() > self.max_bars {
            candles.drain(0..candles.len() - self.max_bars);
        }
        self.data.insert(symbol.clone(), candles);
        self.fetched_at.insert(symbol.clone(), Instant::now());
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.data.keys()
    }
}

// =============================================================================
// Breadth
// =============================================================================

/// Percentage of symbols whose latest close sits above their `period`-bar
/// simple moving average. `None` when nothing is computable.
pub fn breadth_above_sma<'a>(
    series: impl Iterator<Item = &'a [Candle]>,
    period: usize,
) -> Option<f64> {
    let mut eligible = 0usize;
    let mut above = 0usize;

    for candles in series {
        if candles.len() < period {
            continue;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        if let Some(Some(mean)) = sma(&closes, period).last() {
            eligible += 1;
            if closes.last().copied().unwrap_or(0.0) > *mean {
                above += 1;
            }
        }
    }

    if eligible == 0 {
        return None;
    }
    Some(above as f64 / eligible as f64 * 100.0)
}

impl CandleCache {
    /// Breadth over every cached symbol, freshness ignored
    pub fn breadth(&self, period: usize) -> Option<f64> {
        breadth_above_sma(self.data.values().map(|v| v.as_slice()), period)
    }
}
