//! Signal engine: rolling observation history plus an ordered registry of
//! independent strategy detectors.
//!
//! Every poll produces one `Observation` per tracked contract. The engine
//! appends it to the per-ticker price history, then runs each detector in
//! registration order. A detector that fires is throttled by a
//! per-(strategy, ticker) cooldown so a persistent condition does not spam
//! identical signals every cycle. Emitted signals are immutable; a later
//! contradicting signal supersedes by freshness downstream, never by
//! retraction.

pub mod detectors;

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::store::models::{GameContext, GameState, MarketQuote, Side, Signal};

use detectors::Detector;

/// Price history cap per ticker (~2.5h at a 15s poll).
const MAX_PRICE_POINTS: usize = 600;
/// Game history cap per event.
const MAX_GAME_POINTS: usize = 600;

/// One entry of the per-ticker rolling price history.
#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub ts: DateTime<Utc>,
    /// Reference price in cents.
    pub price: i64,
    pub model_fv: i64,
    /// Signed model-minus-market edge in cents.
    pub edge: f64,
    pub volume: i64,
}

/// One contract observation handed to every detector.
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub ticker: &'a str,
    pub quote: &'a MarketQuote,
    pub game: &'a GameState,
    /// Whether this contract's YES pays when the home team wins. Game history
    /// is stored home-oriented; detectors flip through `orientation()`.
    pub yes_is_home: bool,
    /// Fair value of this contract's YES side, cents.
    pub model_fv: i64,
    /// Cents of fair value per point of the contract team's lead. Always
    /// non-negative.
    pub delta_per_point: f64,
    /// Expected lead give-back from mean reversion, contract-oriented points.
    pub reversion: f64,
    /// Signed edge in cents: model_fv − market price.
    pub edge: f64,
    /// Reference market price in cents.
    pub price: i64,
}

impl Observation<'_> {
    /// +1 when the contract is home-oriented, −1 when away-oriented.
    pub fn orientation(&self) -> i32 {
        if self.yes_is_home {
            1
        } else {
            -1
        }
    }

    /// Current lead from the contract team's perspective.
    pub fn oriented_lead(&self) -> i32 {
        self.game.lead * self.orientation()
    }
}

/// Rolling histories shared by all detectors.
#[derive(Default)]
pub struct History {
    prices: HashMap<String, Vec<PricePoint>>,
    games: HashMap<String, Vec<GameState>>,
}

impl History {
    /// Time-ordered price points for a ticker (oldest first).
    pub fn prices(&self, ticker: &str) -> &[PricePoint] {
        self.prices.get(ticker).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Time-ordered game snapshots for an event (oldest first, home-oriented).
    pub fn games(&self, event_id: &str) -> &[GameState] {
        self.games.get(event_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn push_price(&mut self, ticker: &str, point: PricePoint) {
        let entry = self.prices.entry(ticker.to_string()).or_default();
        entry.push(point);
        if entry.len() > MAX_PRICE_POINTS {
            let excess = entry.len() - MAX_PRICE_POINTS;
            entry.drain(..excess);
        }
    }

    pub(crate) fn push_game(&mut self, game: &GameState) {
        let entry = self.games.entry(game.event_id.clone()).or_default();
        // Append-only and time-ordered: drop out-of-order provider snapshots.
        if let Some(last) = entry.last() {
            if game.fetched_at < last.fetched_at {
                return;
            }
        }
        entry.push(game.clone());
        if entry.len() > MAX_GAME_POINTS {
            let excess = entry.len() - MAX_GAME_POINTS;
            entry.drain(..excess);
        }
    }
}

/// Draft produced by a detector before the engine stamps identity and context.
#[derive(Debug, Clone)]
pub struct SignalDraft {
    pub side: Side,
    pub strength: u8,
    /// Absolute claimed edge in cents.
    pub edge: f64,
    pub reason: String,
}

/// The detector registry plus everything needed to throttle it.
pub struct SignalEngine {
    detectors: Vec<Box<dyn Detector>>,
    history: History,
    /// (strategy, ticker) → last emission time.
    last_fired: HashMap<(String, String), DateTime<Utc>>,
}

impl SignalEngine {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        SignalEngine {
            detectors,
            history: History::default(),
            last_fired: HashMap::new(),
        }
    }

    /// The standard six-detector registry, ordered roughly slowest-moving to
    /// fastest-moving.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(detectors::EdgeValue::default()),
            Box::new(detectors::Momentum::default()),
            Box::new(detectors::HalftimeEdge::default()),
            Box::new(detectors::LateGameDelta::default()),
            Box::new(detectors::StalePrice::default()),
            Box::new(detectors::ClosingConvergence::default()),
        ])
    }

    /// Record one game snapshot. Called once per game per cycle, before the
    /// per-contract observations for that game.
    pub fn record_game(&mut self, game: &GameState) {
        self.history.push_game(game);
    }

    /// Feed one contract observation through every detector. Returns the
    /// signals that fired (already cooldown-filtered); the caller persists
    /// them.
    pub fn on_observation(&mut self, obs: &Observation) -> Vec<Signal> {
        self.history.push_price(
            obs.ticker,
            PricePoint {
                ts: obs.quote.fetched_at,
                price: obs.price,
                model_fv: obs.model_fv,
                edge: obs.edge,
                volume: obs.quote.volume,
            },
        );

        let now = obs.quote.fetched_at;
        let mut emitted = Vec::new();
        for detector in &self.detectors {
            let key = (detector.name().to_string(), obs.ticker.to_string());
            if let Some(last) = self.last_fired.get(&key) {
                if now - *last < detector.cooldown() {
                    continue;
                }
            }
            if let Some(draft) = detector.evaluate(obs, &self.history) {
                debug!(
                    "Signal {} {} {} strength={} edge={:.1}c: {}",
                    detector.name(),
                    obs.ticker,
                    draft.side.as_str(),
                    draft.strength,
                    draft.edge,
                    draft.reason
                );
                self.last_fired.insert(key, now);
                emitted.push(Signal {
                    id: None,
                    strategy: detector.name().to_string(),
                    ticker: obs.ticker.to_string(),
                    side: draft.side,
                    strength: draft.strength.min(10),
                    edge: draft.edge,
                    model_fv: obs.model_fv,
                    market_price: obs.price,
                    reason: draft.reason,
                    context: GameContext::from_game(obs.game),
                    emitted_at: now,
                });
            }
        }
        emitted
    }

    /// Drop all histories and cooldown state at a session boundary.
    pub fn reset_session(&mut self) {
        self.history = History::default();
        self.last_fired.clear();
    }

    pub fn games_tracked(&self) -> usize {
        self.history.games.len()
    }

    pub fn tickers_tracked(&self) -> usize {
        self.history.prices.len()
    }
}

/// Elapsed seconds between two timestamps, saturating at zero.
pub(crate) fn secs_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::detectors::EdgeValue;
    use super::*;

    fn game(lead: i32, minutes_remaining: f64, ts: DateTime<Utc>) -> GameState {
        GameState {
            event_id: "401700123".into(),
            name: "Illinois @ Michigan".into(),
            home_team: "Michigan".into(),
            away_team: "Illinois".into(),
            home_abbr: "MICH".into(),
            away_abbr: "ILL".into(),
            home_score: 50 + lead.max(0),
            away_score: 50 - lead.min(0),
            period: 2,
            clock: "12:00".into(),
            minutes_remaining,
            lead,
            pregame_spread: 0.0,
            pregame_total: None,
            fetched_at: ts,
        }
    }

    fn quote(price: i64, ts: DateTime<Utc>) -> MarketQuote {
        MarketQuote {
            ticker: "KXNCAAMBGAME-26FEB27MICHILL-MICH".into(),
            event_ticker: "KXNCAAMBGAME-26FEB27MICHILL".into(),
            series: "KXNCAAMBGAME".into(),
            yes_bid: Some(price - 1),
            yes_ask: Some(price + 1),
            last_price: Some(price),
            volume: 5000,
            fetched_at: ts,
        }
    }

    fn feed(engine: &mut SignalEngine, price: i64, fv: i64, ts: DateTime<Utc>) -> Vec<Signal> {
        let g = game(5, 12.0, ts);
        let q = quote(price, ts);
        engine.record_game(&g);
        let obs = Observation {
            ticker: "KXNCAAMBGAME-26FEB27MICHILL-MICH",
            quote: &q,
            game: &g,
            yes_is_home: true,
            model_fv: fv,
            delta_per_point: 3.0,
            reversion: -0.5,
            edge: (fv - price) as f64,
            price,
        };
        engine.on_observation(&obs)
    }

    #[test]
    fn cooldown_suppresses_repeat_fires() {
        let mut engine = SignalEngine::new(vec![Box::new(EdgeValue {
            persistence: 1,
            ..EdgeValue::default()
        })]);
        let t0 = Utc::now();

        let first = feed(&mut engine, 50, 58, t0);
        assert_eq!(first.len(), 1);

        // Same condition 30s later: inside the cooldown, nothing fires.
        let again = feed(&mut engine, 50, 58, t0 + Duration::seconds(30));
        assert!(again.is_empty());

        // Past the cooldown the detector may fire again.
        let later = feed(&mut engine, 50, 58, t0 + Duration::seconds(400));
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn cooldowns_are_per_ticker() {
        let mut engine = SignalEngine::new(vec![Box::new(EdgeValue {
            persistence: 1,
            ..EdgeValue::default()
        })]);
        let t0 = Utc::now();
        assert_eq!(feed(&mut engine, 50, 58, t0).len(), 1);

        // A different ticker with the same condition is not throttled.
        let g = game(5, 12.0, t0);
        let mut q = quote(50, t0);
        q.ticker = "KXNCAAMBGAME-26FEB27DUKEUNC-DUKE".into();
        let obs = Observation {
            ticker: "KXNCAAMBGAME-26FEB27DUKEUNC-DUKE",
            quote: &q,
            game: &g,
            yes_is_home: true,
            model_fv: 58,
            delta_per_point: 3.0,
            reversion: 0.0,
            edge: 8.0,
            price: 50,
        };
        assert_eq!(engine.on_observation(&obs).len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut engine = SignalEngine::new(vec![]);
        let t0 = Utc::now();
        for i in 0..(MAX_PRICE_POINTS + 50) {
            feed(&mut engine, 50, 50, t0 + Duration::seconds(i as i64));
        }
        assert_eq!(
            engine
                .history
                .prices("KXNCAAMBGAME-26FEB27MICHILL-MICH")
                .len(),
            MAX_PRICE_POINTS
        );
    }

    #[test]
    fn out_of_order_game_snapshots_are_dropped() {
        let mut engine = SignalEngine::new(vec![]);
        let t0 = Utc::now();
        engine.record_game(&game(3, 12.0, t0));
        engine.record_game(&game(2, 12.5, t0 - Duration::seconds(30)));
        let games = engine.history.games("401700123");
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].lead, 3);
    }

    #[test]
    fn reset_session_clears_state() {
        let mut engine = SignalEngine::standard();
        let t0 = Utc::now();
        feed(&mut engine, 50, 58, t0);
        assert!(engine.tickers_tracked() > 0);
        engine.reset_session();
        assert_eq!(engine.tickers_tracked(), 0);
        assert_eq!(engine.games_tracked(), 0);
    }
}
