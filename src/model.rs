//! In-play win probability model for college basketball.
//!
//! The remaining point differential is modeled as a Brownian process over the
//! rest of the game: with lead `L`, time fraction remaining `t` and pre-game
//! expected margin `S`,
//!
//!   P(win) = Φ((L + S·t·dampen(S)) / (σ·√t))
//!
//! σ is a single league-wide volatility constant for the final margin
//! (≈11 points for Division 1). The pre-game spread contributes its expected
//! *remaining* share `S·t`, dampened for large |S| because blowout-sized
//! spreads are empirically less reliable than the market treats them.
//!
//! Everything here is pure arithmetic: degenerate inputs (no time remaining)
//! resolve through the boundary cases, never an error.

/// Regulation game length in minutes (2 × 20-minute halves).
pub const GAME_LENGTH_MIN: f64 = 40.0;

/// Default standard deviation of the final margin, in points.
pub const DEFAULT_SIGMA: f64 = 11.0;

/// Mean-reversion regression coefficient: ~25% of excess lead reverts.
const REVERSION_BETA: f64 = 0.75;

/// Model output for one contract at one game state.
#[derive(Debug, Clone, Copy)]
pub struct ModelValue {
    /// Fair value of the YES contract in cents, clamped to [1, 99].
    pub fair_value: i64,
    /// Change in fair value (cents, unrounded) per one point of lead.
    pub delta_per_point: f64,
}

/// Tunable model parameters. One instance per process, built from config.
#[derive(Debug, Clone, Copy)]
pub struct FairValueModel {
    pub sigma: f64,
    pub game_length_min: f64,
}

impl Default for FairValueModel {
    fn default() -> Self {
        FairValueModel {
            sigma: DEFAULT_SIGMA,
            game_length_min: GAME_LENGTH_MIN,
        }
    }
}

impl FairValueModel {
    pub fn new(sigma: f64, game_length_min: f64) -> Self {
        FairValueModel {
            sigma,
            game_length_min,
        }
    }

    /// Win probability for the team currently leading by `lead` points with
    /// `minutes_remaining` on the clock and pre-game expected final margin
    /// `pregame_spread` (positive = that team favored).
    pub fn win_probability(&self, lead: f64, minutes_remaining: f64, pregame_spread: f64) -> f64 {
        if minutes_remaining <= 0.0 {
            return terminal_probability(lead);
        }

        let t_frac = (minutes_remaining / self.game_length_min).min(1.0);
        let drift = pregame_spread * t_frac * spread_dampening(pregame_spread);
        let effective_lead = lead + drift;
        let sigma_remaining = self.sigma * t_frac.sqrt();

        if sigma_remaining < 0.01 {
            return terminal_probability(effective_lead);
        }

        norm_cdf(effective_lead / sigma_remaining)
    }

    /// Fair value of the YES contract in cents, clamped to [1, 99] so a live
    /// market never prices at the degenerate 0/100 extremes.
    pub fn fair_value_cents(&self, lead: f64, minutes_remaining: f64, pregame_spread: f64) -> i64 {
        let p = self.win_probability(lead, minutes_remaining, pregame_spread);
        ((p * 100.0).round() as i64).clamp(1, 99)
    }

    /// Point-sensitivity: how many cents of fair value one additional point
    /// of lead is worth. Computed on the unrounded cent scale so the value is
    /// smooth; always non-negative because the probability is monotone in the
    /// lead.
    pub fn delta_per_point(&self, lead: f64, minutes_remaining: f64, pregame_spread: f64) -> f64 {
        let p = self.win_probability(lead, minutes_remaining, pregame_spread);
        let p_plus = self.win_probability(lead + 1.0, minutes_remaining, pregame_spread);
        (p_plus - p) * 100.0
    }

    /// Fair value and point-sensitivity together.
    pub fn evaluate(&self, lead: f64, minutes_remaining: f64, pregame_spread: f64) -> ModelValue {
        ModelValue {
            fair_value: self.fair_value_cents(lead, minutes_remaining, pregame_spread),
            delta_per_point: self.delta_per_point(lead, minutes_remaining, pregame_spread),
        }
    }

    /// Expected change in the lead from mean reversion over the rest of the
    /// game. The excess of the current lead over its time-adjusted pre-game
    /// expectation partially reverts (β from the regression literature).
    /// Feeds signal rationale text, not the probability itself.
    pub fn mean_reversion_estimate(
        &self,
        current_lead: f64,
        pregame_spread: f64,
        minutes_remaining: f64,
    ) -> f64 {
        let t_played = self.game_length_min - minutes_remaining;
        if t_played <= 0.0 {
            return 0.0;
        }
        let expected_lead = pregame_spread * (t_played / self.game_length_min);
        let excess = current_lead - expected_lead;
        -excess * (1.0 - REVERSION_BETA) * (minutes_remaining / self.game_length_min)
    }

    /// Spread-style market: P(final margin > line). Shifts the decision
    /// boundary of the same Brownian machinery by the line.
    pub fn spread_probability(
        &self,
        lead: f64,
        minutes_remaining: f64,
        pregame_spread: f64,
        line: f64,
    ) -> f64 {
        if minutes_remaining <= 0.0 {
            return terminal_probability(lead - line);
        }
        let t_frac = (minutes_remaining / self.game_length_min).min(1.0);
        let drift = pregame_spread * t_frac * spread_dampening(pregame_spread);
        let sigma_remaining = self.sigma * t_frac.sqrt();
        if sigma_remaining < 0.01 {
            return terminal_probability(lead + drift - line);
        }
        norm_cdf((lead + drift - line) / sigma_remaining)
    }

    /// Total-style market: P(combined final score > line). The final total is
    /// projected from the realized scoring pace, blended toward the pre-game
    /// total while little of the game has been played.
    pub fn total_probability(
        &self,
        current_total: f64,
        minutes_remaining: f64,
        pregame_total: Option<f64>,
        line: f64,
    ) -> f64 {
        let minutes_played = (self.game_length_min - minutes_remaining).max(0.0);
        if minutes_remaining <= 0.0 {
            return terminal_probability(current_total - line);
        }

        let t_frac = (minutes_remaining / self.game_length_min).min(1.0);
        let pace_projection = if minutes_played >= 1.0 {
            current_total * self.game_length_min / minutes_played
        } else {
            pregame_total.unwrap_or(current_total)
        };
        // Weight realized pace by elapsed fraction; early in the game the
        // pre-game total dominates.
        let projected_total = match pregame_total {
            Some(pregame) => pace_projection * (1.0 - t_frac) + pregame * t_frac,
            None => pace_projection,
        };

        // Totals vary more than margins: both teams' scoring adds variance.
        let sigma_total = self.sigma * std::f64::consts::SQRT_2 * t_frac.sqrt();
        if sigma_total < 0.01 {
            return terminal_probability(projected_total - line);
        }
        norm_cdf((projected_total - line) / sigma_total)
    }
}

/// Weight applied to the pre-game spread's remaining drift. Full weight up to
/// |S| = 4, linear decay to 0.5 at |S| = 8, floor of 0.5 beyond.
pub fn spread_dampening(pregame_spread: f64) -> f64 {
    let s = pregame_spread.abs();
    if s <= 4.0 {
        1.0
    } else if s >= 8.0 {
        0.5
    } else {
        1.0 - 0.5 * (s - 4.0) / 4.0
    }
}

fn terminal_probability(lead: f64) -> f64 {
    if lead > 0.0 {
        1.0
    } else if lead < 0.0 {
        0.0
    } else {
        0.5
    }
}

// ── Math utilities ───────────────────────────────────────────────────────────

/// Approximation of the error function (Abramowitz–Stegun 7.1.26).
/// Maximum error < 1.5 × 10⁻⁷.
fn erf(x: f64) -> f64 {
    let sign = if x >= 0.0 { 1.0_f64 } else { -1.0_f64 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736
                + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Standard normal CDF: Φ(x) = P(Z ≤ x) for Z ~ N(0,1).
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> FairValueModel {
        FairValueModel::default()
    }

    #[test]
    fn norm_cdf_symmetry() {
        assert_relative_eq!(norm_cdf(0.0), 0.5, epsilon = 1e-7);
        assert!((norm_cdf(1.645) - 0.95).abs() < 0.001);
        assert!((norm_cdf(1.0) + norm_cdf(-1.0) - 1.0).abs() < 1e-7);
    }

    #[test]
    fn tied_game_is_a_coinflip() {
        let p = model().win_probability(0.0, 20.0, 0.0);
        assert_relative_eq!(p, 0.5, epsilon = 1e-9);
        assert_eq!(model().fair_value_cents(0.0, 20.0, 0.0), 50);
    }

    #[test]
    fn leader_is_favored_at_any_clock() {
        for mins in [1.0, 5.0, 10.0, 20.0, 39.0] {
            assert!(model().fair_value_cents(3.0, mins, 0.0) > 50);
            assert!(model().fair_value_cents(-3.0, mins, 0.0) < 50);
        }
    }

    #[test]
    fn fair_value_monotone_in_lead() {
        let m = model();
        let mut prev = 0;
        for lead in -20..=20 {
            let fv = m.fair_value_cents(lead as f64, 12.0, 0.0);
            assert!(fv >= prev, "fv not monotone at lead {}", lead);
            prev = fv;
        }
    }

    #[test]
    fn terminal_values_are_exact() {
        let m = model();
        assert_eq!(m.fair_value_cents(1.0, 0.0, 0.0), 99);
        assert_eq!(m.fair_value_cents(-1.0, 0.0, 0.0), 1);
        assert_eq!(m.fair_value_cents(0.0, 0.0, 0.0), 50);
    }

    #[test]
    fn worked_example_eight_point_lead_midgame() {
        // lead=+8, 20 min left, no spread, σ=11:
        // Φ(8 / (11·√0.5)) ≈ Φ(1.028) ≈ 0.848 → 85c
        let fv = model().fair_value_cents(8.0, 20.0, 0.0);
        assert_eq!(fv, 85);
    }

    #[test]
    fn delta_per_point_nonnegative_and_peaks_late() {
        let m = model();
        let early = m.delta_per_point(2.0, 35.0, 0.0);
        let mid = m.delta_per_point(2.0, 10.0, 0.0);
        let late = m.delta_per_point(2.0, 1.0, 0.0);
        assert!(early >= 0.0 && mid >= 0.0 && late >= 0.0);
        assert!(late > mid && mid > early);
    }

    #[test]
    fn delta_shrinks_with_more_time() {
        let m = model();
        assert!(m.delta_per_point(0.0, 2.0, 0.0) > m.delta_per_point(0.0, 30.0, 0.0));
    }

    #[test]
    fn spread_dampening_shape() {
        assert_relative_eq!(spread_dampening(0.0), 1.0);
        assert_relative_eq!(spread_dampening(4.0), 1.0);
        assert_relative_eq!(spread_dampening(6.0), 0.75, epsilon = 1e-9);
        assert_relative_eq!(spread_dampening(-6.0), 0.75, epsilon = 1e-9);
        assert_relative_eq!(spread_dampening(8.0), 0.5);
        assert_relative_eq!(spread_dampening(15.0), 0.5);
    }

    #[test]
    fn pregame_spread_shifts_probability() {
        let m = model();
        let neutral = m.win_probability(0.0, 30.0, 0.0);
        let favored = m.win_probability(0.0, 30.0, 6.0);
        let underdog = m.win_probability(0.0, 30.0, -6.0);
        assert!(favored > neutral);
        assert!(underdog < neutral);
    }

    #[test]
    fn large_spread_is_dampened() {
        let m = model();
        // A 12-point spread at half weight should move the line less than
        // twice what a 4-point full-weight spread does.
        let p4 = m.win_probability(0.0, 40.0, 4.0) - 0.5;
        let p12 = m.win_probability(0.0, 40.0, 12.0) - 0.5;
        assert!(p12 < p4 * 3.0);
    }

    #[test]
    fn mean_reversion_fades_excess_lead() {
        let m = model();
        // Up 15 with no pre-game edge halfway through: expect give-back.
        let rev = m.mean_reversion_estimate(15.0, 0.0, 20.0);
        assert!(rev < 0.0);
        // Lead exactly on script: nothing to revert.
        let on_script = m.mean_reversion_estimate(3.0, 6.0, 20.0);
        assert!(on_script.abs() < 1.0);
        // Pre-game: no reversion estimate.
        assert_relative_eq!(m.mean_reversion_estimate(0.0, 5.0, 40.0), 0.0);
    }

    #[test]
    fn spread_market_shifts_boundary() {
        let m = model();
        let win = m.spread_probability(8.0, 10.0, 0.0, 0.0);
        let cover_5 = m.spread_probability(8.0, 10.0, 0.0, 5.0);
        let cover_12 = m.spread_probability(8.0, 10.0, 0.0, 12.0);
        assert!(win > cover_5);
        assert!(cover_5 > cover_12);
        assert_relative_eq!(win, m.win_probability(8.0, 10.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn total_market_follows_pace() {
        let m = model();
        // 80 combined points at halftime projects ~160; a 140 line is likely
        // over, a 180 line likely under.
        let over_low = m.total_probability(80.0, 20.0, None, 140.0);
        let over_high = m.total_probability(80.0, 20.0, None, 180.0);
        assert!(over_low > 0.7);
        assert!(over_high < 0.3);
    }

    #[test]
    fn total_market_blends_pregame_total_early() {
        let m = model();
        // 2 minutes in, 10 combined points would project an absurd 200-point
        // pace; the pre-game total should dominate.
        let p = m.total_probability(10.0, 38.0, Some(145.0), 160.0);
        assert!(p < 0.5, "pregame blend should hold projection near 145, got {}", p);
    }

    #[test]
    fn no_panic_on_degenerate_inputs() {
        let m = model();
        for lead in [-200.0, 0.0, 200.0] {
            for mins in [-5.0, 0.0, 0.001, 40.0, 400.0] {
                let p = m.win_probability(lead, mins, 0.0);
                assert!((0.0..=1.0).contains(&p));
            }
        }
    }
}
