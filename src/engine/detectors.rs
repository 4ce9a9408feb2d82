//! The strategy detector family.
//!
//! Each detector is independent and may co-fire on the same observation.
//! Thresholds are fields with working defaults so they stay tunable at
//! construction time. Cooldowns vary by how fast the underlying condition
//! moves: the halftime detector fires at most once per break, while the
//! late-game detectors re-arm within a couple of minutes.

use chrono::Duration;

use super::{secs_between, History, Observation, SignalDraft};
use crate::store::models::Side;

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    /// Minimum time between two fires for the same (strategy, ticker) pair.
    fn cooldown(&self) -> Duration;
    fn evaluate(&self, obs: &Observation, history: &History) -> Option<SignalDraft>;
}

fn strength_from_edge(edge: f64) -> u8 {
    ((edge.abs() / 2.0).round() as u8).clamp(1, 10)
}

// ── Edge / value ─────────────────────────────────────────────────────────────

/// Fires on persistent model-vs-market divergence. A floor filters noise, a
/// ceiling filters model error (a 25-cent "edge" means the model is wrong,
/// not that the market is), and the divergence must hold its sign across the
/// last few reads.
pub struct EdgeValue {
    pub min_edge: f64,
    pub max_edge: f64,
    /// Consecutive observations (including the current one) that must agree.
    pub persistence: usize,
    /// Skip books too wide to trust the reference price.
    pub max_spread: i64,
    pub cooldown_secs: i64,
}

impl Default for EdgeValue {
    fn default() -> Self {
        EdgeValue {
            min_edge: 4.0,
            max_edge: 18.0,
            persistence: 3,
            max_spread: 20,
            cooldown_secs: 180,
        }
    }
}

impl Detector for EdgeValue {
    fn name(&self) -> &'static str {
        "edge_value"
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }

    fn evaluate(&self, obs: &Observation, history: &History) -> Option<SignalDraft> {
        let edge = obs.edge;
        if edge.abs() < self.min_edge || edge.abs() > self.max_edge {
            return None;
        }
        if obs.quote.spread().is_some_and(|s| s > self.max_spread) {
            return None;
        }

        let prices = history.prices(obs.ticker);
        if prices.len() < self.persistence {
            return None;
        }
        let recent = &prices[prices.len() - self.persistence..];
        let persistent = recent
            .iter()
            .all(|p| p.edge.signum() == edge.signum() && p.edge.abs() >= self.min_edge);
        if !persistent {
            return None;
        }

        let side = if edge > 0.0 { Side::Yes } else { Side::No };
        Some(SignalDraft {
            side,
            strength: strength_from_edge(edge),
            edge: edge.abs(),
            reason: format!(
                "model {}c vs market {}c, {:+.1}c edge held {} reads, reversion {:+.1}pts",
                obs.model_fv, obs.price, edge, self.persistence, obs.reversion
            ),
        })
    }
}

// ── Momentum ─────────────────────────────────────────────────────────────────

/// Fires when one side has out-scored the other across two consecutive
/// overlapping snapshot windows and the quote has not caught up.
pub struct Momentum {
    /// Net points over the recent window that counts as a run.
    pub run_threshold: i32,
    /// Snapshots per window; windows overlap by `window − 2`.
    pub window: usize,
    /// Minimum residual edge in the run direction.
    pub lag_edge: f64,
    pub cooldown_secs: i64,
}

impl Default for Momentum {
    fn default() -> Self {
        Momentum {
            run_threshold: 6,
            window: 4,
            lag_edge: 2.0,
            cooldown_secs: 120,
        }
    }
}

fn window_run(games: &[crate::store::models::GameState]) -> i32 {
    let first = &games[0];
    let last = &games[games.len() - 1];
    (last.home_score - first.home_score) - (last.away_score - first.away_score)
}

impl Detector for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }

    fn evaluate(&self, obs: &Observation, history: &History) -> Option<SignalDraft> {
        let games = history.games(&obs.game.event_id);
        if games.len() < self.window + 2 {
            return None;
        }

        let or = obs.orientation();
        let run_now = window_run(&games[games.len() - self.window..]) * or;
        let run_prev =
            window_run(&games[games.len() - self.window - 2..games.len() - 2]) * or;

        // Same-direction persistence across the overlapping windows.
        if run_now.abs() < self.run_threshold || run_now.signum() != run_prev.signum() {
            return None;
        }

        let (side, lagging) = if run_now > 0 {
            (Side::Yes, obs.edge >= self.lag_edge)
        } else {
            (Side::No, obs.edge <= -self.lag_edge)
        };
        if !lagging {
            return None;
        }

        Some(SignalDraft {
            side,
            strength: (run_now.unsigned_abs() as u8).min(8),
            edge: obs.edge.abs(),
            reason: format!(
                "{:+} run over last {} snaps, market lagging by {:+.0}c",
                run_now, self.window, obs.edge
            ),
        })
    }
}

// ── Halftime recalibration ───────────────────────────────────────────────────

/// Fires in a narrow window around the halftime break, where quotes are
/// empirically anchored to first-half information.
pub struct HalftimeEdge {
    pub min_edge: f64,
    /// Minutes-remaining window that brackets the break (second half clock).
    pub window_lo: f64,
    pub window_hi: f64,
    pub cooldown_secs: i64,
}

impl Default for HalftimeEdge {
    fn default() -> Self {
        HalftimeEdge {
            min_edge: 5.0,
            window_lo: 19.0,
            window_hi: 20.5,
            cooldown_secs: 600,
        }
    }
}

impl Detector for HalftimeEdge {
    fn name(&self) -> &'static str {
        "halftime_edge"
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }

    fn evaluate(&self, obs: &Observation, _history: &History) -> Option<SignalDraft> {
        let mins = obs.game.minutes_remaining;
        if obs.game.period != 2 || mins < self.window_lo || mins > self.window_hi {
            return None;
        }
        if obs.edge.abs() < self.min_edge {
            return None;
        }

        let side = if obs.edge > 0.0 { Side::Yes } else { Side::No };
        Some(SignalDraft {
            side,
            strength: strength_from_edge(obs.edge),
            edge: obs.edge.abs(),
            reason: format!(
                "halftime edge: model {}c vs market {}c, {:.0}c mispricing",
                obs.model_fv,
                obs.price,
                obs.edge.abs()
            ),
        })
    }
}

// ── Late-game point-sensitivity ──────────────────────────────────────────────

/// Fires in the final minutes of a close game, where point-sensitivity is
/// large and a small model edge carries asymmetric payoff.
pub struct LateGameDelta {
    pub min_minutes: f64,
    pub max_minutes: f64,
    pub max_lead: i32,
    /// Cents of fair value per point that counts as "high delta".
    pub min_delta: f64,
    pub min_edge: f64,
    pub cooldown_secs: i64,
}

impl Default for LateGameDelta {
    fn default() -> Self {
        LateGameDelta {
            min_minutes: 2.0,
            max_minutes: 8.0,
            max_lead: 5,
            min_delta: 5.0,
            min_edge: 3.0,
            cooldown_secs: 90,
        }
    }
}

impl Detector for LateGameDelta {
    fn name(&self) -> &'static str {
        "late_game_delta"
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }

    fn evaluate(&self, obs: &Observation, _history: &History) -> Option<SignalDraft> {
        let mins = obs.game.minutes_remaining;
        if mins < self.min_minutes || mins > self.max_minutes {
            return None;
        }
        if obs.game.lead.abs() > self.max_lead
            || obs.delta_per_point < self.min_delta
            || obs.edge.abs() < self.min_edge
        {
            return None;
        }

        let side = if obs.edge > 0.0 { Side::Yes } else { Side::No };
        Some(SignalDraft {
            side,
            strength: (obs.delta_per_point.round() as u8).clamp(1, 10),
            edge: obs.edge.abs(),
            reason: format!(
                "high delta {:.1}c/pt, lead {:+}, {:.1}min left, edge {:+.0}c",
                obs.delta_per_point, obs.game.lead, mins, obs.edge
            ),
        })
    }
}

// ── Stale price ──────────────────────────────────────────────────────────────

/// Fires when the score just moved but the quote did not move commensurate
/// with the model's point-sensitivity, inferring the price is lagging.
pub struct StalePrice {
    /// Minimum expected price move (cents) for the score change to matter.
    pub min_expected_move: f64,
    /// Fraction of the expected move the market may already show.
    pub max_priced_ratio: f64,
    pub min_edge: f64,
    /// The score change must be at most this old.
    pub max_age_secs: i64,
    pub cooldown_secs: i64,
}

impl Default for StalePrice {
    fn default() -> Self {
        StalePrice {
            min_expected_move: 2.0,
            max_priced_ratio: 0.5,
            min_edge: 3.0,
            max_age_secs: 60,
            cooldown_secs: 120,
        }
    }
}

impl Detector for StalePrice {
    fn name(&self) -> &'static str {
        "stale_price"
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }

    fn evaluate(&self, obs: &Observation, history: &History) -> Option<SignalDraft> {
        let games = history.games(&obs.game.event_id);
        let prices = history.prices(obs.ticker);
        if games.len() < 2 || prices.len() < 2 {
            return None;
        }

        let prev_game = &games[games.len() - 2];
        let points = (obs.game.lead - prev_game.lead) * obs.orientation();
        if points == 0 {
            return None;
        }
        if secs_between(prev_game.fetched_at, obs.quote.fetched_at) > self.max_age_secs {
            return None;
        }

        let expected = obs.delta_per_point * points as f64;
        if expected.abs() < self.min_expected_move {
            return None;
        }

        let prev_price = prices[prices.len() - 2].price;
        let observed = (obs.price - prev_price) as f64;
        // Project the observed move onto the expected direction; a move the
        // wrong way counts as zero priced-in.
        let priced_in = (observed * expected.signum()).max(0.0);
        if priced_in >= expected.abs() * self.max_priced_ratio {
            return None;
        }

        if obs.edge.signum() != expected.signum() || obs.edge.abs() < self.min_edge {
            return None;
        }

        let side = if expected > 0.0 { Side::Yes } else { Side::No };
        Some(SignalDraft {
            side,
            strength: ((expected.abs() - priced_in).round() as u8).clamp(1, 10),
            edge: obs.edge.abs(),
            reason: format!(
                "score moved {:+}pts, expected {:+.1}c, price moved {:+.0}c",
                points, expected, observed
            ),
        })
    }
}

// ── Closing convergence ──────────────────────────────────────────────────────

/// Fires in the terminal minutes with a clear lead and a still-mispriced
/// quote, expecting fast convergence to the resolved price.
pub struct ClosingConvergence {
    pub max_minutes: f64,
    pub min_lead: i32,
    pub min_edge: f64,
    pub cooldown_secs: i64,
}

impl Default for ClosingConvergence {
    fn default() -> Self {
        ClosingConvergence {
            max_minutes: 4.0,
            min_lead: 8,
            min_edge: 3.0,
            cooldown_secs: 60,
        }
    }
}

impl Detector for ClosingConvergence {
    fn name(&self) -> &'static str {
        "closing_convergence"
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }

    fn evaluate(&self, obs: &Observation, _history: &History) -> Option<SignalDraft> {
        let mins = obs.game.minutes_remaining;
        if mins <= 0.0 || mins > self.max_minutes {
            return None;
        }

        let lead = obs.oriented_lead();
        let side = if lead >= self.min_lead && obs.edge >= self.min_edge {
            Side::Yes
        } else if lead <= -self.min_lead && obs.edge <= -self.min_edge {
            Side::No
        } else {
            return None;
        };

        Some(SignalDraft {
            side,
            strength: ((obs.edge.abs().round() as u8) + 2).min(10),
            edge: obs.edge.abs(),
            reason: format!(
                "lead {:+} with {:.1}min left, market {}c vs model {}c",
                lead, mins, obs.price, obs.model_fv
            ),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{History, Observation, PricePoint};
    use crate::store::models::{GameState, MarketQuote};
    use chrono::{DateTime, Duration, Utc};

    struct Fixture {
        game: GameState,
        quote: MarketQuote,
    }

    fn fixture(lead: i32, minutes_remaining: f64, period: i32, price: i64) -> Fixture {
        let now = Utc::now();
        Fixture {
            game: GameState {
                event_id: "401700123".into(),
                name: "Illinois @ Michigan".into(),
                home_team: "Michigan".into(),
                away_team: "Illinois".into(),
                home_abbr: "MICH".into(),
                away_abbr: "ILL".into(),
                home_score: 50 + lead.max(0),
                away_score: 50 - lead.min(0),
                period,
                clock: "10:00".into(),
                minutes_remaining,
                lead,
                pregame_spread: 0.0,
                pregame_total: None,
                fetched_at: now,
            },
            quote: MarketQuote {
                ticker: "KXNCAAMBGAME-26FEB27MICHILL-MICH".into(),
                event_ticker: "KXNCAAMBGAME-26FEB27MICHILL".into(),
                series: "KXNCAAMBGAME".into(),
                yes_bid: Some(price - 1),
                yes_ask: Some(price + 1),
                last_price: Some(price),
                volume: 5000,
                fetched_at: now,
            },
        }
    }

    fn obs<'a>(f: &'a Fixture, model_fv: i64, delta: f64) -> Observation<'a> {
        Observation {
            ticker: &f.quote.ticker,
            quote: &f.quote,
            game: &f.game,
            yes_is_home: true,
            model_fv,
            delta_per_point: delta,
            reversion: 0.0,
            edge: (model_fv - f.quote.last_price.unwrap()) as f64,
            price: f.quote.last_price.unwrap(),
        }
    }

    fn price_history(ticker: &str, edges: &[f64], base_ts: DateTime<Utc>) -> History {
        let mut history = History::default();
        for (i, e) in edges.iter().enumerate() {
            history.push_price(
                ticker,
                PricePoint {
                    ts: base_ts + Duration::seconds(15 * i as i64),
                    price: 50,
                    model_fv: (50.0 + e).round() as i64,
                    edge: *e,
                    volume: 1000,
                },
            );
        }
        history
    }

    fn game_history(leads_and_scores: &[(i32, i32)], base_ts: DateTime<Utc>) -> History {
        // Each entry is (home_score, away_score).
        let mut history = History::default();
        for (i, (home, away)) in leads_and_scores.iter().enumerate() {
            let mut f = fixture(home - away, 12.0, 2, 50);
            f.game.home_score = *home;
            f.game.away_score = *away;
            f.game.lead = home - away;
            f.game.fetched_at = base_ts + Duration::seconds(15 * i as i64);
            history.push_game(&f.game);
        }
        history
    }

    // ── EdgeValue ────────────────────────────────────────────────────────────

    #[test]
    fn edge_value_requires_persistence() {
        let det = EdgeValue::default();
        let f = fixture(4, 15.0, 2, 50);
        let o = obs(&f, 57, 2.0); // +7c edge

        // Only two same-sign reads in history: not persistent enough.
        let short = price_history(o.ticker, &[6.5, 7.0], Utc::now());
        assert!(det.evaluate(&o, &short).is_none());

        let ok = price_history(o.ticker, &[6.0, 6.5, 7.0], Utc::now());
        let draft = det.evaluate(&o, &ok).expect("should fire");
        assert_eq!(draft.side, Side::Yes);
        assert!(draft.strength >= 3);
    }

    #[test]
    fn edge_value_rejects_sign_flips_and_outliers() {
        let det = EdgeValue::default();
        let f = fixture(4, 15.0, 2, 50);
        let o = obs(&f, 57, 2.0);

        let flipped = price_history(o.ticker, &[-5.0, 6.5, 7.0], Utc::now());
        assert!(det.evaluate(&o, &flipped).is_none());

        // A 25-cent divergence is model error, not opportunity.
        let o_huge = obs(&f, 75, 2.0);
        let big = price_history(o.ticker, &[24.0, 25.0, 25.0], Utc::now());
        assert!(det.evaluate(&o_huge, &big).is_none());
    }

    #[test]
    fn edge_value_skips_wide_books() {
        let det = EdgeValue::default();
        let mut f = fixture(4, 15.0, 2, 50);
        f.quote.yes_bid = Some(38);
        f.quote.yes_ask = Some(62);
        let o = obs(&f, 57, 2.0);
        let h = price_history(o.ticker, &[6.0, 6.5, 7.0], Utc::now());
        assert!(det.evaluate(&o, &h).is_none());
    }

    #[test]
    fn edge_value_no_side_fires_on_negative_edge() {
        let det = EdgeValue::default();
        let f = fixture(-2, 15.0, 2, 55);
        let o = obs(&f, 48, 2.0); // -7c: market overpricing YES
        let h = price_history(o.ticker, &[-6.0, -6.5, -7.0], Utc::now());
        let draft = det.evaluate(&o, &h).expect("should fire");
        assert_eq!(draft.side, Side::No);
    }

    // ── Momentum ─────────────────────────────────────────────────────────────

    #[test]
    fn momentum_fires_on_persistent_run() {
        let det = Momentum::default();
        let f = fixture(8, 14.0, 2, 50);
        let o = obs(&f, 55, 2.0); // +5c edge, market lagging
        // Home outscores away 12-2 across the history.
        let h = game_history(
            &[(50, 48), (53, 48), (55, 49), (58, 49), (60, 50), (62, 50)],
            Utc::now() - Duration::seconds(90),
        );
        let draft = det.evaluate(&o, &h).expect("should fire");
        assert_eq!(draft.side, Side::Yes);
    }

    #[test]
    fn momentum_requires_same_direction_windows() {
        let det = Momentum::default();
        let f = fixture(2, 14.0, 2, 50);
        let o = obs(&f, 55, 2.0);
        // Early window: away run; late window: home run. Direction flipped.
        let h = game_history(
            &[(50, 48), (50, 52), (50, 54), (54, 54), (58, 54), (60, 54)],
            Utc::now() - Duration::seconds(90),
        );
        assert!(det.evaluate(&o, &h).is_none());
    }

    #[test]
    fn momentum_requires_market_lag() {
        let det = Momentum::default();
        let f = fixture(8, 14.0, 2, 50);
        let o = obs(&f, 50, 2.0); // edge 0: market caught up
        let h = game_history(
            &[(50, 48), (53, 48), (55, 49), (58, 49), (60, 50), (62, 50)],
            Utc::now() - Duration::seconds(90),
        );
        assert!(det.evaluate(&o, &h).is_none());
    }

    // ── HalftimeEdge ─────────────────────────────────────────────────────────

    #[test]
    fn halftime_edge_only_in_break_window() {
        let det = HalftimeEdge::default();
        let h = History::default();

        let at_break = fixture(6, 20.0, 2, 50);
        let o = obs(&at_break, 58, 2.0);
        assert!(det.evaluate(&o, &h).is_some());

        let mid_half = fixture(6, 12.0, 2, 50);
        let o2 = obs(&mid_half, 58, 2.0);
        assert!(det.evaluate(&o2, &h).is_none());

        let first_half = fixture(6, 20.0, 1, 50);
        let o3 = obs(&first_half, 58, 2.0);
        assert!(det.evaluate(&o3, &h).is_none());
    }

    // ── LateGameDelta ────────────────────────────────────────────────────────

    #[test]
    fn late_game_delta_gates_on_delta_lead_and_clock() {
        let det = LateGameDelta::default();
        let h = History::default();

        let f = fixture(3, 5.0, 2, 50);
        assert!(det.evaluate(&obs(&f, 54, 6.0), &h).is_some());
        // Low delta: early-game dynamics, skip.
        assert!(det.evaluate(&obs(&f, 54, 2.0), &h).is_none());

        let blowout = fixture(12, 5.0, 2, 80);
        assert!(det.evaluate(&obs(&blowout, 85, 6.0), &h).is_none());

        let too_late = fixture(3, 1.0, 2, 50);
        assert!(det.evaluate(&obs(&too_late, 54, 6.0), &h).is_none());
    }

    // ── StalePrice ───────────────────────────────────────────────────────────

    #[test]
    fn stale_price_fires_when_quote_lags_score() {
        let det = StalePrice::default();
        let now = Utc::now();
        let mut h = game_history(&[(50, 48), (54, 48)], now - Duration::seconds(20));
        // Price flat across the same span.
        for i in 0..2 {
            h.push_price(
                "KXNCAAMBGAME-26FEB27MICHILL-MICH",
                PricePoint {
                    ts: now - Duration::seconds(20 - 15 * i),
                    price: 55,
                    model_fv: 62,
                    edge: 7.0,
                    volume: 1000,
                },
            );
        }
        let mut f = fixture(6, 11.0, 2, 55);
        f.game.home_score = 54;
        f.game.away_score = 48;
        let o = obs(&f, 62, 2.5); // 4-point swing × 2.5c/pt = +10c expected
        let draft = det.evaluate(&o, &h).expect("should fire");
        assert_eq!(draft.side, Side::Yes);
    }

    #[test]
    fn stale_price_skips_when_already_priced_in() {
        let det = StalePrice::default();
        let now = Utc::now();
        let mut h = game_history(&[(50, 48), (54, 48)], now - Duration::seconds(20));
        // Price already jumped 8c on the score change.
        let prices = [47, 55];
        for (i, p) in prices.iter().enumerate() {
            h.push_price(
                "KXNCAAMBGAME-26FEB27MICHILL-MICH",
                PricePoint {
                    ts: now - Duration::seconds(20 - 15 * i as i64),
                    price: *p,
                    model_fv: 62,
                    edge: (62 - p) as f64,
                    volume: 1000,
                },
            );
        }
        let f = fixture(6, 11.0, 2, 55);
        let o = obs(&f, 62, 2.5);
        assert!(det.evaluate(&o, &h).is_none());
    }

    // ── ClosingConvergence ───────────────────────────────────────────────────

    #[test]
    fn closing_convergence_needs_clear_lead_and_residual_edge() {
        let det = ClosingConvergence::default();
        let h = History::default();

        let f = fixture(10, 3.0, 2, 88);
        assert!(det.evaluate(&obs(&f, 95, 3.0), &h).is_some());

        // Close game: no convergence bet.
        let close = fixture(3, 3.0, 2, 60);
        assert!(det.evaluate(&obs(&close, 66, 8.0), &h).is_none());

        // Market already at fair value.
        let fair = fixture(10, 3.0, 2, 95);
        assert!(det.evaluate(&obs(&fair, 95, 3.0), &h).is_none());
    }

    #[test]
    fn closing_convergence_no_side_for_trailing_contract_team() {
        let det = ClosingConvergence::default();
        let h = History::default();
        // Home trails by 10, YES-home quote still at 12c vs model 4c.
        let f = fixture(-10, 3.0, 2, 12);
        let o = obs(&f, 4, 3.0);
        let draft = det.evaluate(&o, &h).expect("should fire");
        assert_eq!(draft.side, Side::No);
    }
}
