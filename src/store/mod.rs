use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection behind a mutex).
///
/// Implements the append-only session logs (signals, quotes, game snapshots
/// and trade history, all partitioned by `session_date`), the single current
/// exit-parameter set (replaced atomically), session reports and the
/// cumulative learnings record.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// In-memory database for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Balance ──────────────────────────────────────────────────────────────

    pub fn record_balance(&self, balance_cents: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO balance_history (balance_cents, recorded_at) VALUES (?1, ?2)",
            params![balance_cents, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get_balance(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let balance: i64 = conn
            .query_row(
                "SELECT balance_cents FROM balance_history ORDER BY recorded_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        Ok(balance)
    }

    // ── Game snapshots ────────────────────────────────────────────────────────

    pub fn insert_game_snapshot(&self, session_date: NaiveDate, game: &GameState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO game_snapshots (
                session_date, event_id, name, home_score, away_score,
                period, minutes_remaining, lead, pregame_spread, fetched_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                session_date.to_string(),
                game.event_id,
                game.name,
                game.home_score,
                game.away_score,
                game.period,
                game.minutes_remaining,
                game.lead,
                game.pregame_spread,
                game.fetched_at,
            ],
        )?;
        Ok(())
    }

    /// Time-ordered game snapshots for one session, for the learner's
    /// volatility estimate.
    pub fn list_game_snapshots(&self, session_date: NaiveDate) -> Result<Vec<GameSnapshotRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, lead, minutes_remaining, fetched_at
             FROM game_snapshots WHERE session_date=?1 ORDER BY fetched_at ASC",
        )?;
        let rows = stmt
            .query_map(params![session_date.to_string()], |row| {
                Ok(GameSnapshotRow {
                    event_id: row.get(0)?,
                    lead: row.get(1)?,
                    minutes_remaining: row.get(2)?,
                    fetched_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Quote snapshots ───────────────────────────────────────────────────────

    pub fn insert_quote(
        &self,
        session_date: NaiveDate,
        quote: &MarketQuote,
        model_fv: i64,
        edge: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO quotes (
                session_date, ticker, yes_bid, yes_ask, last_price,
                volume, model_fv, edge, fetched_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                session_date.to_string(),
                quote.ticker,
                quote.yes_bid,
                quote.yes_ask,
                quote.last_price,
                quote.volume,
                model_fv,
                edge,
                quote.fetched_at,
            ],
        )?;
        Ok(())
    }

    /// Time-ordered quotes for one session.
    pub fn list_quotes(&self, session_date: NaiveDate) -> Result<Vec<QuoteRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ticker, yes_bid, yes_ask, last_price, volume, model_fv, edge, fetched_at
             FROM quotes WHERE session_date=?1 ORDER BY fetched_at ASC",
        )?;
        let rows = stmt
            .query_map(params![session_date.to_string()], |row| {
                Ok(QuoteRow {
                    ticker: row.get(0)?,
                    yes_bid: row.get(1)?,
                    yes_ask: row.get(2)?,
                    last_price: row.get(3)?,
                    volume: row.get(4)?,
                    model_fv: row.get(5)?,
                    edge: row.get(6)?,
                    fetched_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Signal log ────────────────────────────────────────────────────────────

    /// Append one emitted signal to the session signal log.
    pub fn insert_signal(&self, session_date: NaiveDate, signal: &Signal) -> Result<i64> {
        let context = serde_json::to_string(&signal.context)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO signals (
                session_date, strategy, ticker, side, strength, edge,
                model_fv, market_price, reason, context, emitted_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                session_date.to_string(),
                signal.strategy,
                signal.ticker,
                signal.side.as_str(),
                signal.strength as i64,
                signal.edge,
                signal.model_fv,
                signal.market_price,
                signal.reason,
                context,
                signal.emitted_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_signals(&self, session_date: NaiveDate) -> Result<Vec<Signal>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, strategy, ticker, side, strength, edge, model_fv,
                    market_price, reason, context, emitted_at
             FROM signals WHERE session_date=?1 ORDER BY emitted_at ASC",
        )?;
        let rows = stmt
            .query_map(params![session_date.to_string()], map_signal_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_signals(rows))
    }

    pub fn list_recent_signals(&self, limit: i64) -> Result<Vec<Signal>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, strategy, ticker, side, strength, edge, model_fv,
                    market_price, reason, context, emitted_at
             FROM signals ORDER BY emitted_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], map_signal_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_signals(rows))
    }

    pub fn count_signals(&self, session_date: NaiveDate) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE session_date=?1",
            params![session_date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Trade history ─────────────────────────────────────────────────────────

    /// Append one completed round trip to the immutable trade history.
    pub fn append_trade(&self, session_date: NaiveDate, trade: &TradeRecord) -> Result<i64> {
        let entry_context = serde_json::to_string(&trade.entry_context)?;
        let exit_params = serde_json::to_string(&trade.exit_params)?;
        let edge_trajectory = serde_json::to_string(&trade.edge_trajectory)?;
        let pnl_trajectory = serde_json::to_string(&trade.pnl_trajectory)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades (
                session_date, ticker, event_ticker, side, strategy,
                entry_price, exit_price, contracts, total_cost,
                pnl_cents, pnl_per_contract, pnl_pct, exit_reason,
                hold_secs, peak_pnl_pct, edge_at_exit, model_updates,
                entry_context, exit_params, edge_trajectory, pnl_trajectory,
                opened_at, closed_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,
                       ?16,?17,?18,?19,?20,?21,?22,?23)",
            params![
                session_date.to_string(),
                trade.ticker,
                trade.event_ticker,
                trade.side.as_str(),
                trade.strategy,
                trade.entry_price,
                trade.exit_price,
                trade.contracts as i64,
                trade.total_cost,
                trade.pnl_cents,
                trade.pnl_per_contract,
                trade.pnl_pct,
                trade.exit_reason.as_str(),
                trade.hold_secs,
                trade.peak_pnl_pct,
                trade.edge_at_exit,
                trade.model_updates as i64,
                entry_context,
                exit_params,
                edge_trajectory,
                pnl_trajectory,
                trade.opened_at,
                trade.closed_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_trades(&self, session_date: NaiveDate) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{TRADE_SELECT} WHERE session_date=?1 ORDER BY closed_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![session_date.to_string()], map_trade_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_trades(rows))
    }

    pub fn list_recent_trades(&self, limit: i64) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{TRADE_SELECT} ORDER BY closed_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], map_trade_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_trades(rows))
    }

    // ── Exit parameters ───────────────────────────────────────────────────────

    /// Persist a new active exit-parameter set, replacing the previous one
    /// atomically (single-row upsert inside one statement).
    pub fn save_exit_params(&self, exits: &ExitParams, reason: &str) -> Result<()> {
        let payload = serde_json::to_string(exits)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO exit_params (id, params, reason, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                params=excluded.params,
                reason=excluded.reason,
                updated_at=excluded.updated_at",
            params![payload, reason, Utc::now()],
        )?;
        Ok(())
    }

    /// Load the active exit-parameter set, if any has been persisted.
    pub fn load_exit_params(&self) -> Result<Option<(ExitParams, String)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT params, reason FROM exit_params WHERE id=1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let Some((payload, reason)) = row else {
            return Ok(None);
        };
        match serde_json::from_str::<ExitParams>(&payload) {
            Ok(exits) => Ok(Some((exits, reason))),
            Err(e) => {
                warn!("Skipping malformed exit_params record: {}", e);
                Ok(None)
            }
        }
    }

    // ── Session reports / cumulative learnings ────────────────────────────────

    pub fn save_session_report(
        &self,
        session_date: NaiveDate,
        report: &serde_json::Value,
    ) -> Result<()> {
        let payload = serde_json::to_string(report)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO session_reports (session_date, report, generated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_date) DO UPDATE SET
                report=excluded.report,
                generated_at=excluded.generated_at",
            params![session_date.to_string(), payload, Utc::now()],
        )?;
        Ok(())
    }

    pub fn load_session_report(&self, session_date: NaiveDate) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row(
                "SELECT report FROM session_reports WHERE session_date=?1",
                params![session_date.to_string()],
                |row| row.get(0),
            )
            .ok();
        Ok(payload.and_then(|p| match serde_json::from_str(&p) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Skipping malformed session report for {}: {}", session_date, e);
                None
            }
        }))
    }

    pub fn save_learnings(&self, learnings: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(learnings)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO learnings (id, data, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                data=excluded.data,
                updated_at=excluded.updated_at",
            params![payload, Utc::now()],
        )?;
        Ok(())
    }

    pub fn load_learnings(&self) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row("SELECT data FROM learnings WHERE id=1", [], |row| row.get(0))
            .ok();
        Ok(payload.and_then(|p| match serde_json::from_str(&p) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Skipping malformed learnings record: {}", e);
                None
            }
        }))
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn get_stats(&self, session_date: NaiveDate) -> Result<Stats> {
        let conn = self.conn.lock().unwrap();
        let total_trades: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
            .unwrap_or(0);
        let winning_trades: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades WHERE pnl_cents > 0", [], |r| {
                r.get(0)
            })
            .unwrap_or(0);
        let total_pnl_cents: i64 = conn
            .query_row("SELECT COALESCE(SUM(pnl_cents),0) FROM trades", [], |r| {
                r.get(0)
            })
            .unwrap_or(0);
        let signals_today: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM signals WHERE session_date=?1",
                params![session_date.to_string()],
                |r| r.get(0),
            )
            .unwrap_or(0);
        let balance_cents: i64 = conn
            .query_row(
                "SELECT balance_cents FROM balance_history ORDER BY recorded_at DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0);
        Ok(Stats {
            total_trades,
            winning_trades,
            total_pnl_cents,
            signals_today,
            balance_cents,
        })
    }
}

// ── Row types ──────────────────────────────────────────────────────────────────

/// Quote row as read back for session analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRow {
    pub ticker: String,
    pub yes_bid: Option<i64>,
    pub yes_ask: Option<i64>,
    pub last_price: Option<i64>,
    pub volume: i64,
    pub model_fv: i64,
    pub edge: f64,
    pub fetched_at: DateTime<Utc>,
}

impl QuoteRow {
    pub fn reference_price(&self) -> Option<i64> {
        self.last_price.or(self.yes_bid)
    }
}

/// Game-snapshot row as read back for the volatility estimate.
#[derive(Debug, Clone)]
pub struct GameSnapshotRow {
    pub event_id: String,
    pub lead: i32,
    pub minutes_remaining: f64,
    pub fetched_at: DateTime<Utc>,
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

/// Intermediate signal row: embedded JSON still encoded.
struct SignalRow {
    id: Option<i64>,
    strategy: String,
    ticker: String,
    side: String,
    strength: i64,
    edge: f64,
    model_fv: i64,
    market_price: i64,
    reason: String,
    context: String,
    emitted_at: DateTime<Utc>,
}

fn map_signal_row(row: &rusqlite::Row) -> rusqlite::Result<SignalRow> {
    Ok(SignalRow {
        id: row.get(0)?,
        strategy: row.get(1)?,
        ticker: row.get(2)?,
        side: row.get(3)?,
        strength: row.get(4)?,
        edge: row.get(5)?,
        model_fv: row.get(6)?,
        market_price: row.get(7)?,
        reason: row.get(8)?,
        context: row.get(9)?,
        emitted_at: row.get(10)?,
    })
}

/// Decode signal rows, skipping any with malformed embedded JSON or an
/// unknown side rather than failing the whole load.
fn decode_signals(rows: Vec<SignalRow>) -> Vec<Signal> {
    rows.into_iter()
        .filter_map(|row| {
            let side = match Side::parse(&row.side) {
                Some(s) => s,
                None => {
                    warn!("Skipping signal row with unknown side '{}'", row.side);
                    return None;
                }
            };
            let context = match serde_json::from_str(&row.context) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping signal row with malformed context: {}", e);
                    return None;
                }
            };
            Some(Signal {
                id: row.id,
                strategy: row.strategy,
                ticker: row.ticker,
                side,
                strength: row.strength.clamp(0, 10) as u8,
                edge: row.edge,
                model_fv: row.model_fv,
                market_price: row.market_price,
                reason: row.reason,
                context,
                emitted_at: row.emitted_at,
            })
        })
        .collect()
}

const TRADE_SELECT: &str = "SELECT id, ticker, event_ticker, side, strategy, entry_price,
            exit_price, contracts, total_cost, pnl_cents, pnl_per_contract,
            pnl_pct, exit_reason, hold_secs, peak_pnl_pct, edge_at_exit,
            model_updates, entry_context, exit_params, edge_trajectory,
            pnl_trajectory, opened_at, closed_at
     FROM trades";

struct TradeRow {
    id: Option<i64>,
    ticker: String,
    event_ticker: String,
    side: String,
    strategy: String,
    entry_price: i64,
    exit_price: i64,
    contracts: i64,
    total_cost: i64,
    pnl_cents: i64,
    pnl_per_contract: i64,
    pnl_pct: f64,
    exit_reason: String,
    hold_secs: i64,
    peak_pnl_pct: f64,
    edge_at_exit: f64,
    model_updates: i64,
    entry_context: String,
    exit_params: String,
    edge_trajectory: String,
    pnl_trajectory: String,
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
}

fn map_trade_row(row: &rusqlite::Row) -> rusqlite::Result<TradeRow> {
    Ok(TradeRow {
        id: row.get(0)?,
        ticker: row.get(1)?,
        event_ticker: row.get(2)?,
        side: row.get(3)?,
        strategy: row.get(4)?,
        entry_price: row.get(5)?,
        exit_price: row.get(6)?,
        contracts: row.get(7)?,
        total_cost: row.get(8)?,
        pnl_cents: row.get(9)?,
        pnl_per_contract: row.get(10)?,
        pnl_pct: row.get(11)?,
        exit_reason: row.get(12)?,
        hold_secs: row.get(13)?,
        peak_pnl_pct: row.get(14)?,
        edge_at_exit: row.get(15)?,
        model_updates: row.get(16)?,
        entry_context: row.get(17)?,
        exit_params: row.get(18)?,
        edge_trajectory: row.get(19)?,
        pnl_trajectory: row.get(20)?,
        opened_at: row.get(21)?,
        closed_at: row.get(22)?,
    })
}

fn parse_exit_reason(s: &str) -> Option<ExitReason> {
    match s {
        "model_exit" => Some(ExitReason::ModelExit),
        "take_profit" => Some(ExitReason::TakeProfit),
        "trailing_stop" => Some(ExitReason::TrailingStop),
        "stop_loss" => Some(ExitReason::StopLoss),
        "time_exit" => Some(ExitReason::TimeExit),
        _ => None,
    }
}

fn decode_trades(rows: Vec<TradeRow>) -> Vec<TradeRecord> {
    rows.into_iter()
        .filter_map(|row| {
            let side = Side::parse(&row.side)?;
            let exit_reason = match parse_exit_reason(&row.exit_reason) {
                Some(r) => r,
                None => {
                    warn!("Skipping trade row with unknown exit reason '{}'", row.exit_reason);
                    return None;
                }
            };
            let decoded = (
                serde_json::from_str::<EntryContext>(&row.entry_context),
                serde_json::from_str::<ExitParams>(&row.exit_params),
                serde_json::from_str::<Vec<EdgePoint>>(&row.edge_trajectory),
                serde_json::from_str::<Vec<PnlPoint>>(&row.pnl_trajectory),
            );
            match decoded {
                (Ok(entry_context), Ok(exit_params), Ok(edge_trajectory), Ok(pnl_trajectory)) => {
                    Some(TradeRecord {
                        id: row.id,
                        ticker: row.ticker,
                        event_ticker: row.event_ticker,
                        side,
                        strategy: row.strategy,
                        entry_price: row.entry_price,
                        exit_price: row.exit_price,
                        contracts: row.contracts.max(0) as u32,
                        total_cost: row.total_cost,
                        pnl_cents: row.pnl_cents,
                        pnl_per_contract: row.pnl_per_contract,
                        pnl_pct: row.pnl_pct,
                        exit_reason,
                        hold_secs: row.hold_secs,
                        peak_pnl_pct: row.peak_pnl_pct,
                        edge_at_exit: row.edge_at_exit,
                        model_updates: row.model_updates.max(0) as u32,
                        entry_context,
                        exit_params,
                        edge_trajectory,
                        pnl_trajectory,
                        opened_at: row.opened_at,
                        closed_at: row.closed_at,
                    })
                }
                _ => {
                    warn!("Skipping trade row with malformed embedded JSON");
                    None
                }
            }
        })
        .collect()
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS balance_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    balance_cents INTEGER NOT NULL,
    recorded_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS game_snapshots (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    session_date      TEXT    NOT NULL,
    event_id          TEXT    NOT NULL,
    name              TEXT    NOT NULL,
    home_score        INTEGER NOT NULL,
    away_score        INTEGER NOT NULL,
    period            INTEGER NOT NULL,
    minutes_remaining REAL    NOT NULL,
    lead              INTEGER NOT NULL,
    pregame_spread    REAL    NOT NULL DEFAULT 0,
    fetched_at        TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS quotes (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_date TEXT    NOT NULL,
    ticker       TEXT    NOT NULL,
    yes_bid      INTEGER,
    yes_ask      INTEGER,
    last_price   INTEGER,
    volume       INTEGER NOT NULL DEFAULT 0,
    model_fv     INTEGER NOT NULL,
    edge         REAL    NOT NULL,
    fetched_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS signals (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_date TEXT    NOT NULL,
    strategy     TEXT    NOT NULL,
    ticker       TEXT    NOT NULL,
    side         TEXT    NOT NULL,
    strength     INTEGER NOT NULL,
    edge         REAL    NOT NULL,
    model_fv     INTEGER NOT NULL,
    market_price INTEGER NOT NULL,
    reason       TEXT    NOT NULL,
    context      TEXT    NOT NULL,
    emitted_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    session_date     TEXT    NOT NULL,
    ticker           TEXT    NOT NULL,
    event_ticker     TEXT    NOT NULL,
    side             TEXT    NOT NULL,
    strategy         TEXT    NOT NULL,
    entry_price      INTEGER NOT NULL,
    exit_price       INTEGER NOT NULL,
    contracts        INTEGER NOT NULL,
    total_cost       INTEGER NOT NULL,
    pnl_cents        INTEGER NOT NULL,
    pnl_per_contract INTEGER NOT NULL,
    pnl_pct          REAL    NOT NULL,
    exit_reason      TEXT    NOT NULL,
    hold_secs        INTEGER NOT NULL,
    peak_pnl_pct     REAL    NOT NULL,
    edge_at_exit     REAL    NOT NULL,
    model_updates    INTEGER NOT NULL,
    entry_context    TEXT    NOT NULL,
    exit_params      TEXT    NOT NULL,
    edge_trajectory  TEXT    NOT NULL,
    pnl_trajectory   TEXT    NOT NULL,
    opened_at        TEXT    NOT NULL,
    closed_at        TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS exit_params (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    params     TEXT NOT NULL,
    reason     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_reports (
    session_date TEXT PRIMARY KEY,
    report       TEXT NOT NULL,
    generated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS learnings (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    data       TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_quotes_session_ticker ON quotes(session_date, ticker);
CREATE INDEX IF NOT EXISTS idx_signals_session ON signals(session_date);
CREATE INDEX IF NOT EXISTS idx_trades_session ON trades(session_date);
CREATE INDEX IF NOT EXISTS idx_game_snapshots_session ON game_snapshots(session_date, event_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signal() -> Signal {
        Signal {
            id: None,
            strategy: "edge_value".into(),
            ticker: "KXNCAAMBGAME-26FEB27MICHILL-MICH".into(),
            side: Side::Yes,
            strength: 6,
            edge: 7.0,
            model_fv: 62,
            market_price: 55,
            reason: "model 62c vs market 55c".into(),
            context: GameContext {
                event_id: "401700123".into(),
                name: "Illinois @ Michigan".into(),
                score: "50-55".into(),
                lead: 5,
                minutes_remaining: 12.0,
                period: 2,
            },
            emitted_at: Utc::now(),
        }
    }

    fn sample_trade() -> TradeRecord {
        TradeRecord {
            id: None,
            ticker: "KXNCAAMBGAME-26FEB27MICHILL-MICH".into(),
            event_ticker: "KXNCAAMBGAME-26FEB27MICHILL".into(),
            side: Side::Yes,
            strategy: "momentum".into(),
            entry_price: 40,
            exit_price: 46,
            contracts: 2,
            total_cost: 80,
            pnl_cents: 12,
            pnl_per_contract: 6,
            pnl_pct: 15.0,
            exit_reason: ExitReason::TakeProfit,
            hold_secs: 190,
            peak_pnl_pct: 17.5,
            edge_at_exit: 1.0,
            model_updates: 5,
            entry_context: EntryContext {
                strategy: "momentum".into(),
                edge: 6.0,
                strength: 7,
                model_fv: 46,
                market_price: 40,
                minutes_remaining: 14.0,
                period: 2,
                lead: 4,
                score: "48-52".into(),
                game: "Illinois @ Michigan".into(),
            },
            exit_params: ExitParams::default(),
            edge_trajectory: vec![],
            pnl_trajectory: vec![PnlPoint {
                ts: Utc::now(),
                pnl_pct: 15.0,
            }],
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn signal_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();
        db.insert_signal(date, &sample_signal()).unwrap();
        let signals = db.list_signals(date).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].strategy, "edge_value");
        assert_eq!(signals[0].side, Side::Yes);
        assert_eq!(signals[0].context.lead, 5);
        assert_eq!(db.count_signals(date).unwrap(), 1);
    }

    #[test]
    fn trade_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();
        db.append_trade(date, &sample_trade()).unwrap();
        let trades = db.list_trades(date).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::TakeProfit);
        assert_eq!(trades[0].contracts, 2);
        assert_eq!(trades[0].pnl_trajectory.len(), 1);
    }

    #[test]
    fn malformed_embedded_json_is_skipped_not_fatal() {
        let db = Database::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();
        db.insert_signal(date, &sample_signal()).unwrap();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO signals (session_date, strategy, ticker, side, strength,
                    edge, model_fv, market_price, reason, context, emitted_at)
                 VALUES (?1,'bad','T','yes',5,3.0,50,47,'r','{not json', ?2)",
                params![date.to_string(), Utc::now()],
            )
            .unwrap();
        }
        let signals = db.list_signals(date).unwrap();
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn exit_params_replace_wholesale() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_exit_params().unwrap().is_none());

        let mut exits = ExitParams::default();
        db.save_exit_params(&exits, "defaults").unwrap();
        exits.stop_loss_pct = 17.0;
        db.save_exit_params(&exits, "widened after recovery pattern")
            .unwrap();

        let (loaded, reason) = db.load_exit_params().unwrap().unwrap();
        assert_eq!(loaded.stop_loss_pct, 17.0);
        assert_eq!(reason, "widened after recovery pattern");
    }

    #[test]
    fn balance_history_returns_latest() {
        let db = Database::open_in_memory().unwrap();
        db.record_balance(10_000).unwrap();
        db.record_balance(10_350).unwrap();
        assert_eq!(db.get_balance().unwrap(), 10_350);
    }

    #[test]
    fn quotes_and_snapshots_are_session_scoped() {
        let db = Database::open_in_memory().unwrap();
        let d1 = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        let quote = MarketQuote {
            ticker: "T1".into(),
            event_ticker: "E1".into(),
            series: "KXNCAAMBGAME".into(),
            yes_bid: Some(44),
            yes_ask: Some(48),
            last_price: Some(46),
            volume: 1200,
            fetched_at: Utc::now(),
        };
        db.insert_quote(d1, &quote, 52, 6.0).unwrap();
        assert_eq!(db.list_quotes(d1).unwrap().len(), 1);
        assert!(db.list_quotes(d2).unwrap().is_empty());
    }
}
