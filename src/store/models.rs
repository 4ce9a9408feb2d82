use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which outcome of a binary contract is being bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }
}

/// One snapshot of a live game as reported by the scoreboard feed.
/// Immutable; a new instance is appended to the per-event history on every
/// observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    /// Provider's game ID.
    pub event_id: String,
    /// "Away @ Home"
    pub name: String,
    pub home_team: String,
    pub away_team: String,
    pub home_abbr: String,
    pub away_abbr: String,
    pub home_score: i32,
    pub away_score: i32,
    pub period: i32,
    pub clock: String,
    pub minutes_remaining: f64,
    /// home_score − away_score
    pub lead: i32,
    /// Pre-game expected final margin; positive = home favored.
    pub pregame_spread: f64,
    /// Pre-game over/under line, when the feed carries one.
    pub pregame_total: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

/// One quote for one contract at one poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub ticker: String,
    pub event_ticker: String,
    pub series: String,
    /// Prices in cents (1–99).
    pub yes_bid: Option<i64>,
    pub yes_ask: Option<i64>,
    pub last_price: Option<i64>,
    pub volume: i64,
    pub fetched_at: DateTime<Utc>,
}

impl MarketQuote {
    /// Best available price estimate: last trade, then bid, then mid.
    pub fn reference_price(&self) -> Option<i64> {
        self.last_price.or(self.yes_bid).or_else(|| {
            match (self.yes_bid, self.yes_ask) {
                (Some(b), Some(a)) => Some((b + a) / 2),
                _ => None,
            }
        })
    }

    /// Bid/ask spread in cents, when both sides are quoted.
    pub fn spread(&self) -> Option<i64> {
        match (self.yes_bid, self.yes_ask) {
            (Some(b), Some(a)) if a >= b => Some(a - b),
            _ => None,
        }
    }
}

/// Game context frozen into a signal at emission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameContext {
    pub event_id: String,
    pub name: String,
    /// "away-home", e.g. "61-58"
    pub score: String,
    pub lead: i32,
    pub minutes_remaining: f64,
    pub period: i32,
}

impl GameContext {
    pub fn from_game(game: &GameState) -> Self {
        GameContext {
            event_id: game.event_id.clone(),
            name: game.name.clone(),
            score: format!("{}-{}", game.away_score, game.home_score),
            lead: game.lead,
            minutes_remaining: game.minutes_remaining,
            period: game.period,
        }
    }
}

/// A trade intent emitted by one strategy detector. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Option<i64>,
    pub strategy: String,
    pub ticker: String,
    pub side: Side,
    /// Confidence 0–10.
    pub strength: u8,
    /// Claimed mispricing in cents (absolute).
    pub edge: f64,
    pub model_fv: i64,
    pub market_price: i64,
    pub reason: String,
    pub context: GameContext,
    pub emitted_at: DateTime<Utc>,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ModelExit,
    TakeProfit,
    TrailingStop,
    StopLoss,
    TimeExit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ModelExit => "model_exit",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TimeExit => "time_exit",
        }
    }
}

/// The active exit-threshold set. Exactly one is live at a time; the tuner
/// replaces it wholesale, never field-by-field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitParams {
    /// Exit when return on capital ≤ −stop_loss_pct.
    pub stop_loss_pct: f64,
    /// Exit when return on capital ≥ take_profit_pct.
    pub take_profit_pct: f64,
    /// Give-back from peak that triggers the trailing stop.
    pub trailing_stop_pct: f64,
    /// Peak return that arms the trailing stop.
    pub trailing_activate_pct: f64,
    /// Maximum hold in seconds.
    pub time_exit_secs: u64,
    /// Exit when the live model edge falls to this level (cents).
    pub edge_exit: f64,
}

impl Default for ExitParams {
    fn default() -> Self {
        ExitParams {
            stop_loss_pct: 15.0,
            take_profit_pct: 15.0,
            trailing_stop_pct: 5.0,
            trailing_activate_pct: 8.0,
            time_exit_secs: 300,
            edge_exit: -1.0,
        }
    }
}

impl ExitParams {
    /// Hard bounds the tuner may never escape: nothing negative, capped
    /// maxima matching the tuning rules.
    pub fn clamped(mut self) -> Self {
        self.stop_loss_pct = self.stop_loss_pct.clamp(5.0, 20.0);
        self.take_profit_pct = self.take_profit_pct.clamp(5.0, 30.0);
        self.trailing_stop_pct = self.trailing_stop_pct.clamp(2.0, 15.0);
        self.trailing_activate_pct = self.trailing_activate_pct.clamp(4.0, 20.0);
        self.time_exit_secs = self.time_exit_secs.clamp(120, 600);
        self.edge_exit = self.edge_exit.clamp(-10.0, 0.0);
        self
    }
}

/// One point of the live edge trajectory tracked while a position is open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EdgePoint {
    pub ts: DateTime<Utc>,
    pub edge: f64,
    pub model_fv: i64,
    pub market_price: i64,
}

/// One point of the live P&L trajectory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PnlPoint {
    pub ts: DateTime<Utc>,
    pub pnl_pct: f64,
}

/// Entry-time context preserved on every closed trade for the learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryContext {
    pub strategy: String,
    pub edge: f64,
    pub strength: u8,
    pub model_fv: i64,
    pub market_price: i64,
    pub minutes_remaining: f64,
    pub period: i32,
    pub lead: i32,
    pub score: String,
    pub game: String,
}

/// Terminal record of one completed round trip, appended to the immutable
/// trade history when the position leaves the live set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub ticker: String,
    pub event_ticker: String,
    pub side: Side,
    pub strategy: String,
    /// Cents per contract.
    pub entry_price: i64,
    pub exit_price: i64,
    pub contracts: u32,
    /// entry_price × contracts; fixed at entry.
    pub total_cost: i64,
    pub pnl_cents: i64,
    pub pnl_per_contract: i64,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub hold_secs: i64,
    pub peak_pnl_pct: f64,
    pub edge_at_exit: f64,
    pub model_updates: u32,
    pub entry_context: EntryContext,
    /// Exit thresholds in force when the trade closed.
    pub exit_params: ExitParams,
    /// Last 10 readings of each trajectory.
    pub edge_trajectory: Vec<EdgePoint>,
    pub pnl_trajectory: Vec<PnlPoint>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Aggregate stats served by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_trades: i64,
    pub winning_trades: i64,
    pub total_pnl_cents: i64,
    pub signals_today: i64,
    pub balance_cents: i64,
}
