//! Exit-rule evaluation and adaptive tuning.
//!
//! Both are pure functions over snapshots so the priority order and every
//! tuning rule can be unit-tested without a venue or a clock.

use tracing::info;

use crate::store::models::{ExitParams, ExitReason, TradeRecord};

/// Everything exit evaluation needs to know about one open, filled position
/// at one instant. All percentages are return on capital deployed,
/// side-adjusted by the caller.
#[derive(Debug, Clone, Copy)]
pub struct PositionSnapshot {
    pub pnl_pct: f64,
    /// Per-contract P&L in cents.
    pub pnl_per_contract: i64,
    /// High-water mark, updated by the caller before evaluation.
    pub peak_pnl_pct: f64,
    pub age_secs: i64,
    /// Live model edge in cents, side-adjusted.
    pub last_edge: f64,
    /// Fresh model updates received since entry.
    pub model_updates: u32,
}

/// Evaluate the exit rules in strict priority order; first match wins.
///
/// 1. model-edge reversal  2. take-profit  3. trailing stop
/// 4. stop-loss (percent OR absolute cent cap)  5. time exit
pub fn evaluate_exit(
    params: &ExitParams,
    max_loss_per_contract: i64,
    snap: &PositionSnapshot,
) -> Option<ExitReason> {
    if snap.model_updates >= 2 && snap.last_edge <= params.edge_exit {
        Some(ExitReason::ModelExit)
    } else if snap.pnl_pct >= params.take_profit_pct {
        Some(ExitReason::TakeProfit)
    } else if snap.peak_pnl_pct >= params.trailing_activate_pct
        && snap.pnl_pct <= snap.peak_pnl_pct - params.trailing_stop_pct
    {
        Some(ExitReason::TrailingStop)
    } else if snap.pnl_pct <= -params.stop_loss_pct
        || snap.pnl_per_contract <= -max_loss_per_contract
    {
        Some(ExitReason::StopLoss)
    } else if snap.age_secs > params.time_exit_secs as i64 {
        Some(ExitReason::TimeExit)
    } else {
        None
    }
}

/// Inspect recent closed trades grouped by exit reason and derive an adjusted
/// parameter set. Returns `None` when nothing warrants a change.
///
/// - Stop losses: if more than half of the stops recovered ≥ 3 points off
///   their trajectory low, the stop is cutting winners: widen by 2.
/// - Take profits: if the average post-entry peak beat the realized exit by
///   more than 5 points, raise the target by 3.
/// - Time exits: extend by 60 s when they average > +2%, shorten by 30 s
///   when they average < −3%.
/// - Trailing vs take-profit: arm the trail earlier when trailing exits
///   outperform take-profit exits on average.
pub fn tune_exits(current: &ExitParams, recent: &[TradeRecord]) -> Option<(ExitParams, String)> {
    if recent.len() < 10 {
        return None;
    }

    let by_reason = |reason: ExitReason| -> Vec<&TradeRecord> {
        recent.iter().filter(|t| t.exit_reason == reason).collect()
    };
    let avg_pnl = |trades: &[&TradeRecord]| -> f64 {
        trades.iter().map(|t| t.pnl_pct).sum::<f64>() / trades.len().max(1) as f64
    };

    let mut next = *current;
    let mut reasons: Vec<String> = Vec::new();

    let stops = by_reason(ExitReason::StopLoss);
    if stops.len() >= 3 {
        let recovered = stops
            .iter()
            .filter(|t| {
                let traj = &t.pnl_trajectory;
                if traj.len() < 2 {
                    return false;
                }
                let min_pnl = traj.iter().map(|p| p.pnl_pct).fold(f64::INFINITY, f64::min);
                let last_pnl = traj[traj.len() - 1].pnl_pct;
                last_pnl > min_pnl + 3.0
            })
            .count();
        let recovery_rate = recovered as f64 / stops.len() as f64;
        if recovery_rate > 0.5 && next.stop_loss_pct < 20.0 {
            next.stop_loss_pct = (next.stop_loss_pct + 2.0).min(20.0);
            reasons.push(format!(
                "widened stop loss to -{:.0}% ({:.0}% of stops recovered)",
                next.stop_loss_pct,
                recovery_rate * 100.0
            ));
        }
    }

    let tps = by_reason(ExitReason::TakeProfit);
    if tps.len() >= 3 {
        let avg_peak =
            tps.iter().map(|t| t.peak_pnl_pct).sum::<f64>() / tps.len() as f64;
        let avg_exit = avg_pnl(&tps);
        if avg_peak > avg_exit + 5.0 && next.take_profit_pct < 30.0 {
            next.take_profit_pct = (next.take_profit_pct + 3.0).min(30.0);
            reasons.push(format!(
                "raised take profit to +{:.0}% (avg peak {:.1}% vs exit {:.1}%)",
                next.take_profit_pct, avg_peak, avg_exit
            ));
        }
    }

    let time_exits = by_reason(ExitReason::TimeExit);
    if time_exits.len() >= 3 {
        let avg = avg_pnl(&time_exits);
        if avg > 2.0 && next.time_exit_secs < 600 {
            next.time_exit_secs = (next.time_exit_secs + 60).min(600);
            reasons.push(format!(
                "extended time exit to {}s (time exits avg {:+.1}%)",
                next.time_exit_secs, avg
            ));
        } else if avg < -3.0 && next.time_exit_secs > 120 {
            next.time_exit_secs = next.time_exit_secs.saturating_sub(30).max(120);
            reasons.push(format!(
                "shortened time exit to {}s (time exits avg {:+.1}%)",
                next.time_exit_secs, avg
            ));
        }
    }

    let trails = by_reason(ExitReason::TrailingStop);
    if trails.len() >= 2 && tps.len() >= 2 {
        let avg_trail = avg_pnl(&trails);
        let avg_tp = avg_pnl(&tps);
        if avg_trail > avg_tp && next.trailing_activate_pct > 4.0 {
            next.trailing_activate_pct = (next.trailing_activate_pct - 1.0).max(4.0);
            reasons.push(format!(
                "tightened trailing activation to +{:.0}% (trailing avg {:+.1}% > TP avg {:+.1}%)",
                next.trailing_activate_pct, avg_trail, avg_tp
            ));
        }
    }

    if reasons.is_empty() {
        return None;
    }

    let next = next.clamped();
    let reason = reasons.join("; ");
    info!("Exit tuning: {}", reason);
    Some((next, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{EntryContext, PnlPoint, Side};
    use chrono::Utc;

    fn snap() -> PositionSnapshot {
        PositionSnapshot {
            pnl_pct: 0.0,
            pnl_per_contract: 0,
            peak_pnl_pct: 0.0,
            age_secs: 60,
            last_edge: 3.0,
            model_updates: 3,
        }
    }

    fn params() -> ExitParams {
        ExitParams::default()
    }

    #[test]
    fn holds_inside_all_thresholds() {
        assert_eq!(evaluate_exit(&params(), 8, &snap()), None);
    }

    #[test]
    fn model_exit_needs_two_updates() {
        let mut s = snap();
        s.last_edge = -2.0;
        s.model_updates = 1;
        assert_eq!(evaluate_exit(&params(), 8, &s), None);
        s.model_updates = 2;
        assert_eq!(evaluate_exit(&params(), 8, &s), Some(ExitReason::ModelExit));
    }

    #[test]
    fn take_profit_at_threshold() {
        let mut s = snap();
        s.pnl_pct = 15.0;
        s.peak_pnl_pct = 15.0;
        assert_eq!(evaluate_exit(&params(), 8, &s), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn trailing_stop_requires_activation() {
        let mut s = snap();
        // Peak never reached the activation level: give-back is tolerated.
        s.peak_pnl_pct = 6.0;
        s.pnl_pct = 0.5;
        assert_eq!(evaluate_exit(&params(), 8, &s), None);
        // Armed at +9%, now given back more than 5 points.
        s.peak_pnl_pct = 9.0;
        s.pnl_pct = 3.5;
        assert_eq!(
            evaluate_exit(&params(), 8, &s),
            Some(ExitReason::TrailingStop)
        );
    }

    #[test]
    fn stop_loss_percent_or_absolute_cap() {
        let mut s = snap();
        s.pnl_pct = -15.5;
        s.pnl_per_contract = -5;
        assert_eq!(evaluate_exit(&params(), 8, &s), Some(ExitReason::StopLoss));

        let mut s2 = snap();
        s2.pnl_pct = -9.0; // above the percent stop
        s2.pnl_per_contract = -8; // but at the cent cap
        assert_eq!(evaluate_exit(&params(), 8, &s2), Some(ExitReason::StopLoss));
    }

    #[test]
    fn time_exit_last() {
        let mut s = snap();
        s.age_secs = 301;
        assert_eq!(evaluate_exit(&params(), 8, &s), Some(ExitReason::TimeExit));
    }

    #[test]
    fn priority_order_on_adversarial_snapshot() {
        // Simultaneously beyond take-profit AND stop-loss thresholds (only
        // constructible adversarially): the earlier rule must win.
        let mut s = snap();
        s.pnl_pct = 20.0;
        s.peak_pnl_pct = 20.0;
        s.pnl_per_contract = -10; // absolute stop condition also true
        assert_eq!(evaluate_exit(&params(), 8, &s), Some(ExitReason::TakeProfit));

        // Model exit outranks take-profit.
        s.last_edge = -3.0;
        s.model_updates = 2;
        assert_eq!(evaluate_exit(&params(), 8, &s), Some(ExitReason::ModelExit));
    }

    // ── Tuning ───────────────────────────────────────────────────────────────

    fn trade(reason: ExitReason, pnl_pct: f64, peak: f64, traj: &[f64]) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: None,
            ticker: "T".into(),
            event_ticker: "E".into(),
            side: Side::Yes,
            strategy: "edge_value".into(),
            entry_price: 50,
            exit_price: 50,
            contracts: 1,
            total_cost: 50,
            pnl_cents: (pnl_pct / 2.0) as i64,
            pnl_per_contract: (pnl_pct / 2.0) as i64,
            pnl_pct,
            exit_reason: reason,
            hold_secs: 120,
            peak_pnl_pct: peak,
            edge_at_exit: 0.0,
            model_updates: 3,
            entry_context: EntryContext {
                strategy: "edge_value".into(),
                edge: 6.0,
                strength: 6,
                model_fv: 56,
                market_price: 50,
                minutes_remaining: 12.0,
                period: 2,
                lead: 3,
                score: "50-53".into(),
                game: "A @ B".into(),
            },
            exit_params: ExitParams::default(),
            edge_trajectory: vec![],
            pnl_trajectory: traj
                .iter()
                .map(|p| PnlPoint {
                    ts: now,
                    pnl_pct: *p,
                })
                .collect(),
            opened_at: now,
            closed_at: now,
        }
    }

    fn filler(n: usize) -> Vec<TradeRecord> {
        (0..n)
            .map(|_| trade(ExitReason::ModelExit, 1.0, 2.0, &[0.0, 1.0]))
            .collect()
    }

    #[test]
    fn tuning_needs_a_minimum_sample() {
        let trades = filler(9);
        assert!(tune_exits(&ExitParams::default(), &trades).is_none());
    }

    #[test]
    fn recovering_stops_widen_the_stop() {
        let mut trades = filler(7);
        // 5 stops; 4 show the price recovering >3 points off the low.
        for _ in 0..4 {
            trades.push(trade(ExitReason::StopLoss, -15.0, 0.0, &[-2.0, -16.0, -9.0]));
        }
        trades.push(trade(ExitReason::StopLoss, -15.0, 0.0, &[-2.0, -16.0, -15.5]));

        let (next, reason) = tune_exits(&ExitParams::default(), &trades).expect("should tune");
        assert_eq!(next.stop_loss_pct, 17.0);
        assert!(reason.contains("stop loss"));
    }

    #[test]
    fn stop_widening_caps_at_maximum() {
        let mut current = ExitParams::default();
        current.stop_loss_pct = 20.0;
        let mut trades = filler(7);
        for _ in 0..5 {
            trades.push(trade(ExitReason::StopLoss, -20.0, 0.0, &[-2.0, -21.0, -10.0]));
        }
        // Already at the cap: the stop rule alone produces no change.
        assert!(tune_exits(&current, &trades).is_none());
    }

    #[test]
    fn peaks_beyond_take_profit_raise_the_target() {
        let mut trades = filler(7);
        for _ in 0..3 {
            trades.push(trade(ExitReason::TakeProfit, 15.0, 24.0, &[5.0, 15.0]));
        }
        let (next, _) = tune_exits(&ExitParams::default(), &trades).expect("should tune");
        assert_eq!(next.take_profit_pct, 18.0);
    }

    #[test]
    fn time_exits_adjust_both_ways() {
        let mut winners = filler(7);
        for _ in 0..3 {
            winners.push(trade(ExitReason::TimeExit, 4.0, 5.0, &[1.0, 4.0]));
        }
        let (next, _) = tune_exits(&ExitParams::default(), &winners).expect("should tune");
        assert_eq!(next.time_exit_secs, 360);

        let mut losers = filler(7);
        for _ in 0..3 {
            losers.push(trade(ExitReason::TimeExit, -5.0, 1.0, &[1.0, -5.0]));
        }
        let (next, _) = tune_exits(&ExitParams::default(), &losers).expect("should tune");
        assert_eq!(next.time_exit_secs, 270);
    }

    #[test]
    fn trailing_outperformance_tightens_activation() {
        let mut trades = filler(6);
        for _ in 0..2 {
            trades.push(trade(ExitReason::TrailingStop, 12.0, 16.0, &[5.0, 12.0]));
        }
        for _ in 0..2 {
            trades.push(trade(ExitReason::TakeProfit, 15.0, 16.0, &[5.0, 15.0]));
        }
        // Trailing avg 12 < TP avg 15: no change yet.
        let mut trades2 = trades.clone();
        assert!(tune_exits(&ExitParams::default(), &trades).is_none());

        // Make trailing outperform.
        for t in trades2.iter_mut() {
            if t.exit_reason == ExitReason::TrailingStop {
                t.pnl_pct = 18.0;
            }
        }
        let (next, _) = tune_exits(&ExitParams::default(), &trades2).expect("should tune");
        assert_eq!(next.trailing_activate_pct, 7.0);
    }

    #[test]
    fn tuned_params_stay_inside_bounds() {
        let mut current = ExitParams::default();
        current.time_exit_secs = 590;
        let mut trades = filler(7);
        for _ in 0..3 {
            trades.push(trade(ExitReason::TimeExit, 4.0, 5.0, &[1.0, 4.0]));
        }
        let (next, _) = tune_exits(&current, &trades).expect("should tune");
        assert_eq!(next.time_exit_secs, 600);
    }
}
