//! Post-session learning pass.
//!
//! Runs once per completed session against that session's signal log and
//! quote history, never against live positions:
//! 1. Grade every signal by forward price movement.
//! 2. Score each strategy (win rate, P&L, Sharpe-like ratio, letter grade).
//! 3. Simulate a paper portfolio that takes every strong signal.
//! 4. Estimate realized volatility and systematic model bias.
//! 5. Emit parameter recommendations (advisory text only; the position
//!    controller's own tuner is the sole auto-apply path).
//!
//! The session report is persisted keyed by date and folded into the
//! cumulative learnings record.

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::store::models::{Side, Signal};
use crate::store::{Database, GameSnapshotRow, QuoteRow};

/// Forward offsets (seconds) at which a signal's P&L is sampled.
const PNL_OFFSETS_SECS: [(&str, i64); 4] = [("1m", 60), ("2m", 120), ("5m", 300), ("10m", 600)];

/// Maker fee per contract in cents: `ceil(0.0175 · p · (1−p) · 100)`, floor 1.
fn maker_fee_cents(price_cents: i64) -> i64 {
    let p = price_cents as f64 / 100.0;
    ((0.0175 * p * (1.0 - p) * 100.0).round() as i64).max(1)
}

fn letter_grade(sharpe: f64) -> &'static str {
    if sharpe > 1.0 {
        "A"
    } else if sharpe > 0.5 {
        "B"
    } else if sharpe > 0.0 {
        "C"
    } else if sharpe > -0.5 {
        "D"
    } else {
        "F"
    }
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

// ── Report types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalGrade {
    pub strategy: String,
    pub ticker: String,
    pub side: Side,
    pub edge: f64,
    pub strength: u8,
    pub entry_price: Option<i64>,
    pub pnl_1m: Option<i64>,
    pub pnl_2m: Option<i64>,
    pub pnl_5m: Option<i64>,
    pub pnl_10m: Option<i64>,
    /// strong_win | win | flat | loss | strong_loss | incomplete
    pub grade: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyScore {
    pub total_signals: usize,
    pub graded: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl_5m: i64,
    pub avg_pnl_5m: f64,
    pub avg_edge_claimed: f64,
    pub sharpe: f64,
    pub grade: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTrade {
    pub ticker: String,
    pub strategy: String,
    pub side: Side,
    pub entry: i64,
    pub exit: i64,
    pub gross_pnl: i64,
    pub fees: i64,
    pub net_pnl: i64,
    pub edge_claimed: f64,
    pub strength: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperStrategySummary {
    pub trades: usize,
    pub total_pnl: i64,
    pub avg_pnl: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_gross_pnl: i64,
    pub total_fees: i64,
    pub total_net_pnl: i64,
    pub avg_pnl_per_trade: f64,
    pub best_trade: i64,
    pub worst_trade: i64,
    pub by_strategy: HashMap<String, PaperStrategySummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketStat {
    pub count: usize,
    pub sum_final_price: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCalibration {
    /// Fair-value decile bucket ("50-60") → settlement-direction proxy stats.
    pub buckets: HashMap<String, BucketStat>,
    /// Empirical σ candidate from observed lead changes, points.
    pub sigma_estimate: Option<f64>,
    /// Average final price minus bucket midpoint, cents. Positive: the model
    /// runs low.
    pub bias: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSummary {
    pub signals: usize,
    pub quote_snapshots: usize,
    pub game_snapshots: usize,
    pub unique_tickers: usize,
    pub games_tracked: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub date: String,
    pub data_summary: DataSummary,
    pub signal_grades: Vec<SignalGrade>,
    pub strategy_scores: HashMap<String, StrategyScore>,
    pub model_calibration: ModelCalibration,
    pub paper_trades: PaperSummary,
    pub parameter_recommendations: Vec<Recommendation>,
}

// ── Cumulative learnings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifetimeStrategyStats {
    pub total_signals: usize,
    pub total_graded: usize,
    pub total_wins: usize,
    pub total_losses: usize,
    pub cumulative_pnl: i64,
    pub cumulative_win_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperPortfolio {
    pub total_pnl_cents: i64,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub best_trade: i64,
    pub worst_trade: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigmaObservation {
    pub date: String,
    pub sigma: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationHistoryEntry {
    pub date: String,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CumulativeLearnings {
    pub sessions_analyzed: usize,
    pub total_signals: usize,
    pub strategy_performance: HashMap<String, LifetimeStrategyStats>,
    pub paper_portfolio: PaperPortfolio,
    pub sigma_observations: Vec<SigmaObservation>,
    pub parameter_history: Vec<RecommendationHistoryEntry>,
    pub last_updated: Option<chrono::DateTime<Utc>>,
}

// ── Analyzer ─────────────────────────────────────────────────────────────────

/// Tunables the analyzer needs from configuration.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerParams {
    pub paper_strength_floor: u8,
    pub paper_hold_secs: i64,
    pub game_length_min: f64,
    pub current_sigma: f64,
    pub current_min_edge: f64,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        AnalyzerParams {
            paper_strength_floor: 5,
            paper_hold_secs: 180,
            game_length_min: crate::model::GAME_LENGTH_MIN,
            current_sigma: crate::model::DEFAULT_SIGMA,
            current_min_edge: 6.0,
        }
    }
}

/// Analyze one session's recorded data.
pub struct SessionAnalyzer {
    date: NaiveDate,
    params: AnalyzerParams,
    signals: Vec<Signal>,
    /// ticker → time-ordered quote rows.
    quote_index: HashMap<String, Vec<QuoteRow>>,
    /// event → time-ordered game snapshots.
    game_index: HashMap<String, Vec<GameSnapshotRow>>,
}

impl SessionAnalyzer {
    pub fn load(store: &Database, date: NaiveDate, params: AnalyzerParams) -> Result<Self> {
        let signals = store.list_signals(date)?;
        let quotes = store.list_quotes(date)?;
        let games = store.list_game_snapshots(date)?;

        let mut quote_index: HashMap<String, Vec<QuoteRow>> = HashMap::new();
        for q in quotes {
            quote_index.entry(q.ticker.clone()).or_default().push(q);
        }
        let mut game_index: HashMap<String, Vec<GameSnapshotRow>> = HashMap::new();
        for g in games {
            game_index.entry(g.event_id.clone()).or_default().push(g);
        }

        Ok(SessionAnalyzer {
            date,
            params,
            signals,
            quote_index,
            game_index,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.quote_index.is_empty()
    }

    pub fn analyze(&self) -> SessionReport {
        let signal_grades = self.grade_signals();
        let strategy_scores = self.score_strategies(&signal_grades);
        let model_calibration = self.calibrate_model();
        let paper_trades = self.paper_trade();
        let parameter_recommendations =
            self.recommend(&strategy_scores, &model_calibration, &paper_trades);

        SessionReport {
            date: self.date.to_string(),
            data_summary: DataSummary {
                signals: self.signals.len(),
                quote_snapshots: self.quote_index.values().map(Vec::len).sum(),
                game_snapshots: self.game_index.values().map(Vec::len).sum(),
                unique_tickers: self.quote_index.len(),
                games_tracked: self.game_index.len(),
            },
            signal_grades,
            strategy_scores,
            model_calibration,
            paper_trades,
            parameter_recommendations,
        }
    }

    /// First quote at or after `ts` for a ticker.
    fn quote_at_or_after(
        &self,
        ticker: &str,
        ts: chrono::DateTime<Utc>,
    ) -> Option<&QuoteRow> {
        self.quote_index
            .get(ticker)?
            .iter()
            .find(|q| q.fetched_at >= ts)
    }

    /// Grade each signal by side-adjusted forward price movement; the
    /// 5-minute horizon is primary.
    pub fn grade_signals(&self) -> Vec<SignalGrade> {
        self.signals
            .iter()
            .map(|sig| {
                let entry_price = self
                    .quote_at_or_after(&sig.ticker, sig.emitted_at)
                    .and_then(QuoteRow::reference_price)
                    .or_else(|| {
                        self.quote_index
                            .get(&sig.ticker)
                            .and_then(|qs| qs.last())
                            .and_then(QuoteRow::reference_price)
                    });

                let mut pnls: HashMap<&str, i64> = HashMap::new();
                if let Some(entry) = entry_price {
                    for (label, offset) in PNL_OFFSETS_SECS {
                        let target = sig.emitted_at + Duration::seconds(offset);
                        if let Some(future) = self
                            .quote_at_or_after(&sig.ticker, target)
                            .and_then(QuoteRow::reference_price)
                        {
                            let pnl = match sig.side {
                                Side::Yes => future - entry,
                                Side::No => entry - future,
                            };
                            pnls.insert(label, pnl);
                        }
                    }
                }

                let grade = match pnls.get("5m") {
                    Some(pnl_5m) => {
                        if *pnl_5m > 2 {
                            "strong_win"
                        } else if *pnl_5m > 0 {
                            "win"
                        } else if *pnl_5m == 0 {
                            "flat"
                        } else if *pnl_5m > -2 {
                            "loss"
                        } else {
                            "strong_loss"
                        }
                    }
                    None => "incomplete",
                };

                SignalGrade {
                    strategy: sig.strategy.clone(),
                    ticker: sig.ticker.clone(),
                    side: sig.side,
                    edge: sig.edge,
                    strength: sig.strength,
                    entry_price,
                    pnl_1m: pnls.get("1m").copied(),
                    pnl_2m: pnls.get("2m").copied(),
                    pnl_5m: pnls.get("5m").copied(),
                    pnl_10m: pnls.get("10m").copied(),
                    grade: grade.to_string(),
                }
            })
            .collect()
    }

    /// Aggregate grades per strategy. Signals graded "incomplete" are
    /// excluded from scoring, not treated as failures.
    pub fn score_strategies(&self, grades: &[SignalGrade]) -> HashMap<String, StrategyScore> {
        let mut by_strategy: HashMap<&str, Vec<&SignalGrade>> = HashMap::new();
        for g in grades {
            by_strategy.entry(&g.strategy).or_default().push(g);
        }

        let mut scores = HashMap::new();
        for (strategy, gs) in by_strategy {
            let graded: Vec<&&SignalGrade> =
                gs.iter().filter(|g| g.pnl_5m.is_some()).collect();
            let wins = graded
                .iter()
                .filter(|g| g.pnl_5m.unwrap_or(0) > 0)
                .count();
            let losses = graded
                .iter()
                .filter(|g| g.pnl_5m.unwrap_or(0) < 0)
                .count();
            let total_pnl: i64 = graded.iter().filter_map(|g| g.pnl_5m).sum();
            let avg_edge =
                gs.iter().map(|g| g.edge).sum::<f64>() / gs.len().max(1) as f64;
            let avg_pnl = total_pnl as f64 / graded.len().max(1) as f64;

            let pnls: Vec<f64> = graded.iter().filter_map(|g| g.pnl_5m).map(|p| p as f64).collect();
            let sharpe = if pnls.len() >= 2 {
                let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
                let std = sample_std(&pnls);
                if std > 0.0 {
                    mean / std
                } else {
                    mean
                }
            } else {
                0.0
            };

            scores.insert(
                strategy.to_string(),
                StrategyScore {
                    total_signals: gs.len(),
                    graded: graded.len(),
                    wins,
                    losses,
                    win_rate: wins as f64 / (wins + losses).max(1) as f64 * 100.0,
                    total_pnl_5m: total_pnl,
                    avg_pnl_5m: avg_pnl,
                    avg_edge_claimed: avg_edge,
                    sharpe,
                    grade: letter_grade(sharpe).to_string(),
                },
            );
        }
        scores
    }

    /// Fair-value calibration proxies: final-price-vs-bucket bias and an
    /// empirical σ from observed lead changes.
    pub fn calibrate_model(&self) -> ModelCalibration {
        let mut calibration = ModelCalibration::default();

        for history in self.quote_index.values() {
            if history.len() < 10 {
                continue;
            }
            let Some(last_price) = history.last().and_then(QuoteRow::reference_price) else {
                continue;
            };
            let avg_model =
                history.iter().map(|q| q.model_fv as f64).sum::<f64>() / history.len() as f64;
            let lo = (avg_model / 10.0).floor() as i64 * 10;
            let bucket = format!("{}-{}", lo, lo + 10);
            let stat = calibration.buckets.entry(bucket).or_default();
            stat.count += 1;
            stat.sum_final_price += last_price;
        }

        let mut total_error = 0.0;
        let mut total_count = 0usize;
        for (bucket, stat) in &calibration.buckets {
            if stat.count == 0 {
                continue;
            }
            let avg_final = stat.sum_final_price as f64 / stat.count as f64;
            let midpoint: f64 = bucket
                .split('-')
                .next()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
                + 5.0;
            total_error += (avg_final - midpoint) * stat.count as f64;
            total_count += stat.count;
        }
        if total_count > 0 {
            calibration.bias = Some(total_error / total_count as f64);
        }

        // Realized volatility: per-snapshot lead changes normalized to the
        // full game horizon.
        let mut samples = Vec::new();
        for snaps in self.game_index.values() {
            if snaps.len() < 10 {
                continue;
            }
            for pair in snaps.windows(2) {
                let dt_min =
                    (pair[1].fetched_at - pair[0].fetched_at).num_seconds() as f64 / 60.0;
                if dt_min < 0.1 {
                    continue;
                }
                let lead_change = (pair[1].lead - pair[0].lead).abs() as f64;
                samples.push(lead_change / (dt_min / self.params.game_length_min).sqrt());
            }
        }
        if samples.len() > 10 {
            calibration.sigma_estimate =
                Some(samples.iter().sum::<f64>() / samples.len() as f64);
        }

        calibration
    }

    /// Simulate taking every signal above the strength floor with a fixed
    /// hold and maker fees on both legs.
    pub fn paper_trade(&self) -> PaperSummary {
        let mut trades: Vec<PaperTrade> = Vec::new();

        for sig in &self.signals {
            if sig.strength < self.params.paper_strength_floor {
                continue;
            }
            let Some(entry) = self
                .quote_at_or_after(&sig.ticker, sig.emitted_at)
                .and_then(QuoteRow::reference_price)
            else {
                continue;
            };
            let exit_ts = sig.emitted_at + Duration::seconds(self.params.paper_hold_secs);
            let exit = self
                .quote_at_or_after(&sig.ticker, exit_ts)
                .and_then(QuoteRow::reference_price)
                .or_else(|| {
                    self.quote_index
                        .get(&sig.ticker)
                        .and_then(|qs| qs.last())
                        .and_then(QuoteRow::reference_price)
                });
            let Some(exit) = exit else { continue };

            let gross = match sig.side {
                Side::Yes => exit - entry,
                Side::No => entry - exit,
            };
            let fee = maker_fee_cents(entry);
            let fees = fee * 2;
            trades.push(PaperTrade {
                ticker: sig.ticker.clone(),
                strategy: sig.strategy.clone(),
                side: sig.side,
                entry,
                exit,
                gross_pnl: gross,
                fees,
                net_pnl: gross - fees,
                edge_claimed: sig.edge,
                strength: sig.strength,
            });
        }

        let wins = trades.iter().filter(|t| t.net_pnl > 0).count();
        let losses = trades.iter().filter(|t| t.net_pnl < 0).count();
        let total_net: i64 = trades.iter().map(|t| t.net_pnl).sum();

        let mut by_strategy: HashMap<String, Vec<&PaperTrade>> = HashMap::new();
        for t in &trades {
            by_strategy.entry(t.strategy.clone()).or_default().push(t);
        }
        let by_strategy = by_strategy
            .into_iter()
            .map(|(strategy, ts)| {
                let total: i64 = ts.iter().map(|t| t.net_pnl).sum();
                let strat_wins = ts.iter().filter(|t| t.net_pnl > 0).count();
                (
                    strategy,
                    PaperStrategySummary {
                        trades: ts.len(),
                        total_pnl: total,
                        avg_pnl: total as f64 / ts.len().max(1) as f64,
                        win_rate: strat_wins as f64 / ts.len().max(1) as f64 * 100.0,
                    },
                )
            })
            .collect();

        PaperSummary {
            trades: trades.len(),
            wins,
            losses,
            win_rate: wins as f64 / (wins + losses).max(1) as f64 * 100.0,
            total_gross_pnl: trades.iter().map(|t| t.gross_pnl).sum(),
            total_fees: trades.iter().map(|t| t.fees).sum(),
            total_net_pnl: total_net,
            avg_pnl_per_trade: total_net as f64 / trades.len().max(1) as f64,
            best_trade: trades.iter().map(|t| t.net_pnl).max().unwrap_or(0),
            worst_trade: trades.iter().map(|t| t.net_pnl).min().unwrap_or(0),
            by_strategy,
        }
    }

    /// Advisory recommendations only; nothing here is auto-applied.
    pub fn recommend(
        &self,
        scores: &HashMap<String, StrategyScore>,
        calibration: &ModelCalibration,
        paper: &PaperSummary,
    ) -> Vec<Recommendation> {
        let mut recs = Vec::new();

        if let Some(observed) = calibration.sigma_estimate {
            if (observed - self.params.current_sigma).abs() > 1.0 {
                recs.push(Recommendation {
                    key: "sigma".into(),
                    reason: format!(
                        "observed volatility suggests sigma={:.1} vs current {:.1}",
                        observed, self.params.current_sigma
                    ),
                });
            }
        }

        if paper.trades >= 5 {
            if paper.win_rate > 65.0 {
                recs.push(Recommendation {
                    key: "edge_threshold".into(),
                    reason: format!(
                        "high paper win rate ({:.0}%) suggests lowering the edge floor below {:.0}c",
                        paper.win_rate, self.params.current_min_edge
                    ),
                });
            } else if paper.win_rate < 40.0 {
                recs.push(Recommendation {
                    key: "edge_threshold".into(),
                    reason: format!(
                        "low paper win rate ({:.0}%) suggests raising the edge floor above {:.0}c",
                        paper.win_rate, self.params.current_min_edge
                    ),
                });
            }
        }

        for (strategy, score) in scores {
            if score.graded < 3 {
                continue;
            }
            match score.grade.as_str() {
                "D" | "F" => recs.push(Recommendation {
                    key: format!("disable_{}", strategy),
                    reason: format!(
                        "{} grade={}, sharpe={:.2}, win_rate={:.0}% — consider disabling",
                        strategy, score.grade, score.sharpe, score.win_rate
                    ),
                }),
                "A" => recs.push(Recommendation {
                    key: format!("increase_{}", strategy),
                    reason: format!(
                        "{} grade=A, sharpe={:.2}, win_rate={:.0}% — increase position size",
                        strategy, score.sharpe, score.win_rate
                    ),
                }),
                _ => {}
            }
        }

        if let Some(bias) = calibration.bias {
            if bias.abs() > 3.0 {
                recs.push(Recommendation {
                    key: "model_bias".into(),
                    reason: format!(
                        "model runs {:+.1}c vs final prices — revisit drift or sigma",
                        bias
                    ),
                });
            }
        }

        recs
    }
}

/// Run the full pass for one session: build the report, persist it, fold it
/// into the cumulative learnings.
pub fn run_session_analysis(
    store: &Database,
    date: NaiveDate,
    params: AnalyzerParams,
) -> Result<Option<SessionReport>> {
    let analyzer = SessionAnalyzer::load(store, date, params)?;
    if analyzer.is_empty() {
        info!("No session data for {}, skipping analysis", date);
        return Ok(None);
    }

    let report = analyzer.analyze();
    store.save_session_report(date, &serde_json::to_value(&report)?)?;

    let mut cumulative: CumulativeLearnings = store
        .load_learnings()?
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    cumulative.sessions_analyzed += 1;
    cumulative.total_signals += report.data_summary.signals;

    for (strategy, score) in &report.strategy_scores {
        let lifetime = cumulative
            .strategy_performance
            .entry(strategy.clone())
            .or_default();
        lifetime.total_signals += score.total_signals;
        lifetime.total_graded += score.graded;
        lifetime.total_wins += score.wins;
        lifetime.total_losses += score.losses;
        lifetime.cumulative_pnl += score.total_pnl_5m;
        lifetime.cumulative_win_rate = lifetime.total_wins as f64
            / (lifetime.total_wins + lifetime.total_losses).max(1) as f64
            * 100.0;
    }

    let paper = &report.paper_trades;
    cumulative.paper_portfolio.total_pnl_cents += paper.total_net_pnl;
    cumulative.paper_portfolio.trades += paper.trades;
    cumulative.paper_portfolio.wins += paper.wins;
    cumulative.paper_portfolio.losses += paper.losses;
    cumulative.paper_portfolio.best_trade =
        cumulative.paper_portfolio.best_trade.max(paper.best_trade);
    cumulative.paper_portfolio.worst_trade =
        cumulative.paper_portfolio.worst_trade.min(paper.worst_trade);

    if let Some(sigma) = report.model_calibration.sigma_estimate {
        cumulative.sigma_observations.push(SigmaObservation {
            date: report.date.clone(),
            sigma,
        });
    }
    if !report.parameter_recommendations.is_empty() {
        cumulative.parameter_history.push(RecommendationHistoryEntry {
            date: report.date.clone(),
            recommendations: report.parameter_recommendations.clone(),
        });
    }
    cumulative.last_updated = Some(Utc::now());
    store.save_learnings(&serde_json::to_value(&cumulative)?)?;

    let ds = &report.data_summary;
    info!(
        "Session {} analyzed: {} signals, {} quotes, {} games",
        report.date, ds.signals, ds.quote_snapshots, ds.games_tracked
    );
    for (strategy, score) in &report.strategy_scores {
        info!(
            "  {}: grade={} signals={} win_rate={:.0}% sharpe={:.2} pnl={}c",
            strategy, score.grade, score.total_signals, score.win_rate, score.sharpe,
            score.total_pnl_5m
        );
    }
    info!(
        "  paper: {} trades, win_rate={:.0}%, net {:+}c",
        paper.trades, paper.win_rate, paper.total_net_pnl
    );
    for rec in &report.parameter_recommendations {
        info!("  recommendation [{}]: {}", rec.key, rec.reason);
    }

    Ok(Some(report))
}
