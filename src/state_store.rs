// State store for live trading
// SQLite-based persistence with JSON backup
//
// Holds the drawdown and regime state blobs, per-ticker rotation records,
// per-position exit metadata and the closed-trade audit trail. Written at
// cycle boundaries, reloaded at startup, cross-validated against the broker.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::drawdown::DrawdownState;
use crate::monitor::PositionMeta;
use crate::regime::RegimeState;
use crate::rotation::{TickerRecord, Tier};
use crate::{ClosedTrade, Money, Side, Symbol, VolatilityClass};

const KEY_DRAWDOWN: &str = "drawdown";
const KEY_REGIME: &str = "regime";
const KEY_ROTATION_LAST_RUN: &str = "rotation_last_run";

pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: PathBuf,
    auto_backup: bool,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: P, auto_backup: bool) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: json_backup_path.as_ref().to_path_buf(),
            auto_backup,
        };

        store.create_tables()?;
        info!("SQLite state store initialized");

        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bot_state (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ticker_rotation (
                symbol TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                consecutive_wins INTEGER DEFAULT 0,
                consecutive_losses INTEGER DEFAULT 0,
                total_trades INTEGER DEFAULT 0,
                total_wins INTEGER DEFAULT 0,
                total_pnl TEXT DEFAULT '0',
                total_win_pnl TEXT DEFAULT '0',
                total_loss_pnl TEXT DEFAULT '0',
                last_tier_change TEXT,
                recovery_pass_count INTEGER DEFAULT 0,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS position_meta (
                symbol TEXT PRIMARY KEY,
                quantity REAL NOT NULL,
                entry_date TEXT NOT NULL,
                entry_signal TEXT NOT NULL,
                entry_score REAL DEFAULT 0,
                entry_price REAL NOT NULL,
                profit_level INTEGER DEFAULT 0,
                tier1_lock_price REAL,
                peak_price REAL,
                kill_switch_active INTEGER DEFAULT 0,
                add_count INTEGER DEFAULT 0,
                initial_stop REAL NOT NULL,
                current_stop REAL NOT NULL,
                r_unit REAL DEFAULT 0,
                entry_atr REAL DEFAULT 0,
                highest_close REAL DEFAULT 0,
                bars_below_ema50 INTEGER DEFAULT 0,
                partial_taken INTEGER DEFAULT 0,
                volatility_class TEXT DEFAULT 'medium',
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                pnl TEXT DEFAULT '0',
                exit_reason TEXT,
                entry_signal TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    // ------------------------------------------------------------------
    // State blobs
    // ------------------------------------------------------------------

    fn save_blob(&self, key: &str, payload: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO bot_state (key, payload, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)",
            params![key, payload],
        )?;
        Ok(())
    }

    fn load_blob(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT payload FROM bot_state WHERE key = ?1")?;
        match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
            Ok(payload) => Ok(Some(payload)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_drawdown(&self, state: &DrawdownState) -> Result<()> {
        self.save_blob(KEY_DRAWDOWN, &serde_json::to_string(state)?)
    }

    pub fn load_drawdown(&self) -> Result<Option<DrawdownState>> {
        match self.load_blob(KEY_DRAWDOWN)? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn save_regime(&self, state: &RegimeState) -> Result<()> {
        self.save_blob(KEY_REGIME, &serde_json::to_string(state)?)
    }

    pub fn load_regime(&self) -> Result<Option<RegimeState>> {
        match self.load_blob(KEY_REGIME)? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Rotation records
    // ------------------------------------------------------------------

    /// Full-table replace of the rotation records at a cycle boundary
    pub fn replace_rotation(
        &self,
        records: &[TickerRecord],
        last_run: Option<NaiveDate>,
    ) -> Result<()> {
        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM ticker_rotation", [])?;
            for record in records {
                tx.execute(
                    "INSERT INTO ticker_rotation
                     (symbol, tier, consecutive_wins, consecutive_losses, total_trades,
                      total_wins, total_pnl, total_win_pnl, total_loss_pnl,
                      last_tier_change, recovery_pass_count, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, CURRENT_TIMESTAMP)",
                    params![
                        record.symbol.as_str(),
                        record.tier.as_str(),
                        record.consecutive_wins,
                        record.consecutive_losses,
                        record.total_trades,
                        record.total_wins,
                        record.total_pnl.to_string(),
                        record.total_win_pnl.to_string(),
                        record.total_loss_pnl.to_string(),
                        record.last_tier_change.map(|d| d.to_string()),
                        record.recovery_pass_count,
                    ],
                )?;
            }
            tx.commit()?;
        }

        self.save_blob(
            KEY_ROTATION_LAST_RUN,
            &serde_json::to_string(&last_run)?,
        )?;

        debug!("Rotation records replaced: {}", records.len());
        if self.auto_backup {
            self.export_json()?;
        }
        Ok(())
    }

    pub fn load_rotation(&self) -> Result<(Vec<TickerRecord>, Option<NaiveDate>)> {
        let records = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT symbol, tier, consecutive_wins, consecutive_losses, total_trades,
                        total_wins, total_pnl, total_win_pnl, total_loss_pnl,
                        last_tier_change, recovery_pass_count
                 FROM ticker_rotation",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TickerRecord {
                        symbol: Symbol::new(row.get::<_, String>(0)?),
                        tier: Tier::from_str(&row.get::<_, String>(1)?)
                            .unwrap_or(Tier::Standard),
                        consecutive_wins: row.get(2)?,
                        consecutive_losses: row.get(3)?,
                        total_trades: row.get(4)?,
                        total_wins: row.get(5)?,
                        total_pnl: Money::from_str(&row.get::<_, String>(6)?)
                            .unwrap_or(Money::ZERO),
                        total_win_pnl: Money::from_str(&row.get::<_, String>(7)?)
                            .unwrap_or(Money::ZERO),
                        total_loss_pnl: Money::from_str(&row.get::<_, String>(8)?)
                            .unwrap_or(Money::ZERO),
                        last_tier_change: row
                            .get::<_, Option<String>>(9)?
                            .and_then(|s| s.parse().ok()),
                        recovery_pass_count: row.get(10)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let last_run = match self.load_blob(KEY_ROTATION_LAST_RUN)? {
            Some(payload) => serde_json::from_str(&payload).unwrap_or(None),
            None => None,
        };

        debug!("Loaded {} rotation records", records.len());
        Ok((records, last_run))
    }

    // ------------------------------------------------------------------
    // Position metadata
    // ------------------------------------------------------------------

    /// Full-table replace of position metadata at a cycle boundary
    pub fn replace_positions(&self, metas: &[PositionMeta]) -> Result<()> {
        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM position_meta", [])?;
            for meta in metas {
                tx.execute(
                    "INSERT INTO position_meta
                     (symbol, quantity, entry_date, entry_signal, entry_score, entry_price,
                      profit_level, tier1_lock_price, peak_price, kill_switch_active,
                      add_count, initial_stop, current_stop, r_unit, entry_atr,
                      highest_close, bars_below_ema50, partial_taken, volatility_class,
                      updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                             ?15, ?16, ?17, ?18, ?19, CURRENT_TIMESTAMP)",
                    params![
                        meta.symbol.as_str(),
                        meta.quantity,
                        meta.entry_date.to_rfc3339(),
                        meta.entry_signal,
                        meta.entry_score,
                        meta.entry_price,
                        meta.profit_level,
                        meta.tier1_lock_price,
                        meta.peak_price,
                        meta.kill_switch_active as i32,
                        meta.add_count,
                        meta.initial_stop,
                        meta.current_stop,
                        meta.r_unit,
                        meta.entry_atr,
                        meta.highest_close,
                        meta.bars_below_ema50,
                        meta.partial_taken as i32,
                        meta.volatility_class.as_str(),
                    ],
                )?;
            }
            tx.commit()?;
        }

        debug!("Position metadata replaced: {}", metas.len());
        if self.auto_backup {
            self.export_json()?;
        }
        Ok(())
    }

    pub fn load_positions(&self) -> Result<Vec<PositionMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT symbol, quantity, entry_date, entry_signal, entry_score, entry_price,
                    profit_level, tier1_lock_price, peak_price, kill_switch_active,
                    add_count, initial_stop, current_stop, r_unit, entry_atr,
                    highest_close, bars_below_ema50, partial_taken, volatility_class
             FROM position_meta",
        )?;

        let metas = stmt
            .query_map([], |row| {
                let entry_date: String = row.get(2)?;
                let volatility: String = row.get(18)?;
                Ok(PositionMeta {
                    symbol: Symbol::new(row.get::<_, String>(0)?),
                    quantity: row.get(1)?,
                    entry_date: DateTime::parse_from_rfc3339(&entry_date)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    entry_signal: row.get(3)?,
                    entry_score: row.get(4)?,
                    entry_price: row.get(5)?,
                    profit_level: row.get(6)?,
                    tier1_lock_price: row.get(7)?,
                    peak_price: row.get(8)?,
                    kill_switch_active: row.get::<_, i32>(9)? != 0,
                    add_count: row.get(10)?,
                    initial_stop: row.get(11)?,
                    current_stop: row.get(12)?,
                    r_unit: row.get(13)?,
                    entry_atr: row.get(14)?,
                    highest_close: row.get(15)?,
                    bars_below_ema50: row.get(16)?,
                    partial_taken: row.get::<_, i32>(17)? != 0,
                    volatility_class: VolatilityClass::from_str(&volatility)
                        .unwrap_or(VolatilityClass::Medium),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Loaded {} position records", metas.len());
        Ok(metas)
    }

    // ------------------------------------------------------------------
    // Trade audit trail
    // ------------------------------------------------------------------

    pub fn record_trade(&self, trade: &ClosedTrade) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades
             (symbol, side, quantity, entry_price, exit_price, entry_time,
              exit_time, pnl, exit_reason, entry_signal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trade.symbol.as_str(),
                trade.side.as_str(),
                trade.quantity,
                trade.entry_price,
                trade.exit_price,
                trade.entry_time.to_rfc3339(),
                trade.exit_time.to_rfc3339(),
                trade.pnl.to_string(),
                trade.exit_reason,
                trade.entry_signal,
            ],
        )?;

        let result = if trade.is_win() { "WIN" } else { "LOSS" };
        info!(
            "Trade recorded: {} {} {:.2} @ {:.2} -> {:.2} | P&L {} | {} | {}",
            trade.side.as_str().to_uppercase(),
            trade.symbol,
            trade.quantity,
            trade.entry_price,
            trade.exit_price,
            trade.pnl,
            trade.exit_reason,
            result
        );

        Ok(())
    }

    pub fn load_trades(&self, symbol: Option<&Symbol>) -> Result<Vec<ClosedTrade>> {
        let conn = self.conn.lock().unwrap();
        let query = match symbol {
            Some(_) => {
                "SELECT symbol, side, quantity, entry_price, exit_price, entry_time,
                        exit_time, pnl, exit_reason, entry_signal
                 FROM trades WHERE symbol = ?1 ORDER BY id"
            }
            None => {
                "SELECT symbol, side, quantity, entry_price, exit_price, entry_time,
                        exit_time, pnl, exit_reason, entry_signal
                 FROM trades ORDER BY id"
            }
        };

        let mut stmt = conn.prepare(query)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let entry_time: String = row.get(5)?;
            let exit_time: String = row.get(6)?;
            let side: String = row.get(1)?;
            Ok(ClosedTrade {
                symbol: Symbol::new(row.get::<_, String>(0)?),
                side: if side == "sell" { Side::Sell } else { Side::Buy },
                quantity: row.get(2)?,
                entry_price: row.get(3)?,
                exit_price: row.get(4)?,
                entry_time: DateTime::parse_from_rfc3339(&entry_time)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                exit_time: DateTime::parse_from_rfc3339(&exit_time)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                pnl: Money::from_str(&row.get::<_, String>(7)?).unwrap_or(Money::ZERO),
                exit_reason: row.get(8)?,
                entry_signal: row.get(9)?,
            })
        };

        let trades = match symbol {
            Some(s) => stmt
                .query_map(params![s.as_str()], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(trades)
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    pub fn export_json(&self) -> Result<()> {
        let drawdown = self.load_drawdown()?;
        let regime = self.load_regime()?;
        let (rotation, last_run) = self.load_rotation()?;
        let positions = self.load_positions()?;

        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "drawdown": drawdown,
            "regime": regime,
            "rotation": rotation,
            "rotation_last_run": last_run,
            "positions": positions,
        });

        std::fs::write(&self.json_backup_path, serde_json::to_string_pretty(&state)?)?;
        debug!("State exported to: {}", self.json_backup_path.display());
        Ok(())
    }
}

/// Factory: store rooted in a state directory
pub fn create_state_store<P: AsRef<Path>>(state_dir: P, auto_backup: bool) -> Result<StateStore> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)?;

    let db_path = state_dir.join("swing_trader.db");
    let json_path = state_dir.join("swing_trader.json");

    StateStore::new(db_path, json_path, auto_backup)
}

// =============================================================================
// Persistence watchdog
// =============================================================================

/// Tracks how long the bot has run without a successful checkpoint.
///
/// A save failure starts a bounded in-memory fallback window; once the window
/// is exhausted the engine must stop committing new risk rather than keep
/// trading on unpersisted state.
#[derive(Debug)]
pub struct PersistenceWatchdog {
    first_failure: Option<DateTime<Utc>>,
    fallback: chrono::Duration,
}

impl PersistenceWatchdog {
    pub fn new(fallback_secs: i64) -> Self {
        Self {
            first_failure: None,
            fallback: chrono::Duration::seconds(fallback_secs),
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        if self.first_failure.is_none() {
            warn!("state checkpoint failed, running on in-memory fallback");
            self.first_failure = Some(now);
        }
    }

    pub fn record_success(&mut self) {
        if self.first_failure.take().is_some() {
            info!("state checkpoint recovered");
        }
    }

    /// True once the fallback window has been exhausted
    pub fn must_halt(&self, now: DateTime<Utc>) -> bool {
        match self.first_failure {
            Some(first) => now - first >= self.fallback,
            None => false,
        }
    }
}
