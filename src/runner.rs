//! Session orchestration: the single cooperative control loop.
//!
//! Active during the configured local evening window. One cycle processes all
//! live games and their matched contracts sequentially (feed → model →
//! signal engine → position controller), then sweeps open positions. No
//! locking anywhere: every piece of mutable state is owned by this task.
//! Per-cycle failures are logged and the loop continues; the external stop
//! signal is checked once per iteration.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::{Observation, SignalEngine};
use crate::exec::PositionController;
use crate::feed::GameFeed;
use crate::learner::{self, AnalyzerParams};
use crate::model::FairValueModel;
use crate::store::Database;
use crate::venue::{MarketCatalog, Venue};

/// True when the local hour falls inside a wake→sleep window, which may
/// cross midnight (18 → 1).
fn hour_in_window(hour: u32, wake: u32, sleep: u32) -> bool {
    if wake == sleep {
        true
    } else if wake > sleep {
        hour >= wake || hour < sleep
    } else {
        hour >= wake && hour < sleep
    }
}

/// Local time at the venue, as a UTC-shifted timestamp.
fn local_now(tz_offset_hours: i32) -> DateTime<Utc> {
    Utc::now() + Duration::hours(tz_offset_hours as i64)
}

/// The calendar day a session belongs to. For a window that crosses midnight
/// the after-midnight tail still belongs to the wake day, so the clock is
/// shifted back past the sleep hour before taking the date.
pub fn session_date_at(local: DateTime<Utc>, wake: u32, sleep: u32) -> NaiveDate {
    if wake > sleep {
        (local - Duration::hours(sleep as i64 + 1)).date_naive()
    } else {
        local.date_naive()
    }
}

pub fn current_session_date(tz_offset_hours: i32, wake: u32, sleep: u32) -> NaiveDate {
    session_date_at(local_now(tz_offset_hours), wake, sleep)
}

pub struct Runner {
    config: Config,
    store: Database,
    model: FairValueModel,
    feed: Arc<dyn GameFeed>,
    venue: Arc<dyn Venue>,
    catalog: MarketCatalog,
    engine: SignalEngine,
    controller: PositionController,
    cycle_count: u64,
    session_active: bool,
    next_scan_at: Option<DateTime<Utc>>,
    last_auth_check: Option<DateTime<Utc>>,
    auth_ok: bool,
}

impl Runner {
    pub fn new(
        config: Config,
        store: Database,
        feed: Arc<dyn GameFeed>,
        venue: Arc<dyn Venue>,
    ) -> Self {
        let model = FairValueModel::new(config.model_sigma, config.game_length_min);
        let catalog = MarketCatalog::new(config.scan_series.clone());
        let engine = SignalEngine::standard();
        let controller = PositionController::new(config.clone(), store.clone(), venue.clone());
        Runner {
            config,
            store,
            model,
            feed,
            venue,
            catalog,
            engine,
            controller,
            cycle_count: 0,
            session_active: false,
            next_scan_at: None,
            last_auth_check: None,
            auth_ok: false,
        }
    }

    /// Main loop. Runs until the shutdown signal flips; the signal is
    /// checked between cycles, never mid-cycle.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Runner started: poll={}s, window {}:00-{}:00 local (UTC{:+})",
            self.config.poll_interval_secs,
            self.config.session_wake_hour,
            self.config.session_sleep_hour,
            self.config.session_tz_offset_hours
        );

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = interval.tick() => {
                    let hour = local_now(self.config.session_tz_offset_hours).hour();
                    let active = hour_in_window(
                        hour,
                        self.config.session_wake_hour,
                        self.config.session_sleep_hour,
                    );
                    if active {
                        if !self.session_active {
                            self.start_session().await;
                        }
                        if let Err(e) = self.cycle().await {
                            error!("Cycle error: {:#}", e);
                        }
                    } else if self.session_active {
                        self.end_session();
                    }
                }
            }
        }

        if self.session_active {
            self.end_session();
        }
    }

    fn session_date(&self) -> NaiveDate {
        current_session_date(
            self.config.session_tz_offset_hours,
            self.config.session_wake_hour,
            self.config.session_sleep_hour,
        )
    }

    async fn start_session(&mut self) {
        self.session_active = true;
        self.cycle_count = 0;
        self.engine.reset_session();
        self.controller.reload_exit_params();

        info!("==== SESSION START {} ====", self.session_date());
        self.check_auth().await;
        self.controller.bootstrap().await;

        // Pre-game scan of the full slate.
        match self.catalog.refresh(self.venue.as_ref()).await {
            Ok(summary) => info!(
                "Pre-game scan: {} events, {} markets",
                summary.events, summary.markets
            ),
            Err(e) => warn!("Pre-game scan failed: {}", e),
        }
        if self.catalog.is_empty() {
            warn!("Market catalog empty after pre-game scan");
        }
        info!("Active exit parameters: {:?}", self.controller.exits());
        self.schedule_next_scan();
    }

    /// Close out the session and run the calibration pass over everything
    /// the session logged.
    fn end_session(&mut self) {
        self.session_active = false;
        let date = self.session_date();
        let signals = self.store.count_signals(date).unwrap_or(0);
        info!(
            "==== SESSION END {} ==== {} cycles, {} games tracked, {} signals, {} trades, P&L {:+}c",
            date,
            self.cycle_count,
            self.engine.games_tracked(),
            signals,
            self.controller.trade_count(),
            self.controller.session_pnl_cents()
        );

        let params = AnalyzerParams {
            paper_strength_floor: self.config.paper_strength_floor,
            paper_hold_secs: self.config.paper_hold_secs,
            game_length_min: self.config.game_length_min,
            current_sigma: self.config.model_sigma,
            current_min_edge: self.config.min_entry_edge,
        };
        match learner::run_session_analysis(&self.store, date, params) {
            Ok(Some(_)) => info!("Session report saved for {}", date),
            Ok(None) => {}
            Err(e) => error!("Session analysis failed: {:#}", e),
        }
    }

    fn schedule_next_scan(&mut self) {
        // Jitter so many instances don't hit the venue in lockstep.
        let jitter = rand::thread_rng().gen_range(0..30);
        self.next_scan_at =
            Some(Utc::now() + Duration::seconds(self.config.scan_interval_secs as i64 + jitter));
    }

    async fn check_auth(&mut self) {
        let first_check = self.last_auth_check.is_none();
        self.last_auth_check = Some(Utc::now());
        match self.venue.get_balance().await {
            Ok(balance) => {
                if !self.auth_ok {
                    info!("Venue auth OK, balance ${:.2}", balance as f64 / 100.0);
                }
                self.auth_ok = true;
                self.controller.set_observe_only(false);
            }
            Err(e) => {
                if self.auth_ok || first_check {
                    warn!("Venue auth failed ({}), observation-only until it recovers", e);
                }
                self.auth_ok = false;
                self.controller.set_observe_only(true);
            }
        }
    }

    /// One observation cycle: scan if due, poll the feed, run every matched
    /// contract through the model and the signal engine, hand signals to the
    /// controller, then sweep open positions.
    async fn cycle(&mut self) -> anyhow::Result<()> {
        self.cycle_count += 1;
        let now = Utc::now();
        let date = self.session_date();

        if self.next_scan_at.is_none_or(|at| now >= at) {
            if let Err(e) = self.catalog.refresh(self.venue.as_ref()).await {
                warn!("Catalog scan failed: {}", e);
            }
            self.schedule_next_scan();
        }

        // While degraded, probe auth periodically instead of every cycle.
        if !self.auth_ok
            && self
                .last_auth_check
                .is_none_or(|at| now - at >= Duration::seconds(300))
        {
            self.check_auth().await;
        }

        let games = match self.feed.fetch_live_games().await {
            Ok(games) => games,
            Err(e) => {
                // No new observations this cycle; positions are still swept
                // below against the latest catalog prices.
                warn!("Live feed unavailable: {}", e);
                Vec::new()
            }
        };

        if games.is_empty() && self.cycle_count % 20 == 1 {
            info!("No live games");
        }

        let mut current_prices: HashMap<String, i64> = HashMap::new();

        for game in &games {
            self.engine.record_game(game);
            if let Err(e) = self.store.insert_game_snapshot(date, game) {
                warn!("Failed to log game snapshot: {}", e);
            }

            let contracts = self.catalog.match_game(game);
            for contract in &contracts {
                let Some(quote) = self.catalog.quote(&contract.ticker) else {
                    continue;
                };
                let Some(price) = quote.reference_price() else {
                    continue;
                };

                // Orient the game to this contract's team.
                let orientation = if contract.yes_is_home { 1.0 } else { -1.0 };
                let lead = game.lead as f64 * orientation;
                let spread = game.pregame_spread * orientation;
                let value = self.model.evaluate(lead, game.minutes_remaining, spread);
                let reversion =
                    self.model
                        .mean_reversion_estimate(lead, spread, game.minutes_remaining);
                let edge = (value.fair_value - price) as f64;

                if let Err(e) = self.store.insert_quote(date, &quote, value.fair_value, edge) {
                    warn!("Failed to log quote: {}", e);
                }
                current_prices.insert(contract.ticker.clone(), price);
                self.controller
                    .update_model_value(&contract.ticker, value.fair_value, price);

                let obs = Observation {
                    ticker: &contract.ticker,
                    quote: &quote,
                    game,
                    yes_is_home: contract.yes_is_home,
                    model_fv: value.fair_value,
                    delta_per_point: value.delta_per_point,
                    reversion,
                    edge,
                    price,
                };
                for signal in self.engine.on_observation(&obs) {
                    info!(
                        "SIGNAL {} {} {} strength={} edge={:.0}c | {}",
                        signal.strategy,
                        signal.ticker,
                        signal.side.as_str(),
                        signal.strength,
                        signal.edge,
                        signal.reason
                    );
                    if let Err(e) = self.store.insert_signal(date, &signal) {
                        warn!("Failed to log signal: {}", e);
                    }
                    if let Err(e) = self.controller.on_signal(&signal).await {
                        error!("Controller error on signal: {:#}", e);
                    }
                }
            }

            if self.cycle_count % 4 == 1 {
                let fv = self
                    .model
                    .fair_value_cents(game.lead as f64, game.minutes_remaining, game.pregame_spread);
                // Derivative-market views against the pre-game lines, for the
                // session log and the data capture downstream.
                let p_cover = self.model.spread_probability(
                    game.lead as f64,
                    game.minutes_remaining,
                    game.pregame_spread,
                    game.pregame_spread,
                );
                let total = (game.home_score + game.away_score) as f64;
                let p_over = game.pregame_total.map(|line| {
                    self.model
                        .total_probability(total, game.minutes_remaining, Some(line), line)
                });
                info!(
                    "GAME {} | {}-{} | {} P{} | FV(home) {}c | P(cover) {:.0}% | P(over) {} | {} contracts",
                    game.name,
                    game.away_score,
                    game.home_score,
                    game.clock,
                    game.period,
                    fv,
                    p_cover * 100.0,
                    p_over
                        .map(|p| format!("{:.0}%", p * 100.0))
                        .unwrap_or_else(|| "-".into()),
                    contracts.len()
                );
            }
        }

        // Open positions whose game didn't report this cycle still need a
        // fresh quote before exit evaluation; the 5-minute scan cache is too
        // stale to manage a live position against.
        for ticker in self.controller.open_tickers() {
            if current_prices.contains_key(&ticker) {
                continue;
            }
            match self.venue.get_market(&ticker).await {
                Ok(market) => {
                    if let Some(price) = market.last_price.or(market.yes_bid) {
                        current_prices.insert(ticker.clone(), price);
                    }
                    self.catalog.upsert(market);
                }
                Err(e) => warn!("Quote refresh failed for {}: {}", ticker, e),
            }
        }

        self.controller.check_positions(&current_prices, date).await?;

        if self.cycle_count % 60 == 0 {
            info!(
                "STATUS cycles={} games={} markets={} tracked={} open={} trades={} pnl={:+}c roi={:.1}% auth={}",
                self.cycle_count,
                games.len(),
                self.catalog.len(),
                self.engine.tickers_tracked(),
                self.controller.open_position_count(),
                self.controller.trade_count(),
                self.controller.session_pnl_cents(),
                self.controller.session_roi_pct(),
                if self.auth_ok { "OK" } else { "NO" },
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_crossing_midnight() {
        // 18:00 → 01:00
        assert!(hour_in_window(18, 18, 1));
        assert!(hour_in_window(23, 18, 1));
        assert!(hour_in_window(0, 18, 1));
        assert!(!hour_in_window(1, 18, 1));
        assert!(!hour_in_window(12, 18, 1));
    }

    #[test]
    fn window_same_day() {
        assert!(hour_in_window(10, 9, 17));
        assert!(!hour_in_window(17, 9, 17));
        assert!(!hour_in_window(8, 9, 17));
    }

    #[test]
    fn degenerate_window_is_always_active() {
        assert!(hour_in_window(3, 0, 0));
    }

    #[test]
    fn after_midnight_belongs_to_the_wake_day() {
        let wake = 18;
        let sleep = 1;
        let evening = Utc.with_ymd_and_hms(2026, 2, 27, 21, 0, 0).unwrap();
        let after_midnight = Utc.with_ymd_and_hms(2026, 2, 28, 0, 45, 0).unwrap();
        let just_after_close = Utc.with_ymd_and_hms(2026, 2, 28, 1, 10, 0).unwrap();

        let feb27 = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();
        assert_eq!(session_date_at(evening, wake, sleep), feb27);
        assert_eq!(session_date_at(after_midnight, wake, sleep), feb27);
        assert_eq!(session_date_at(just_after_close, wake, sleep), feb27);
    }

    #[test]
    fn same_day_window_uses_the_local_date() {
        let noon = Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap();
        assert_eq!(
            session_date_at(noon, 9, 17),
            NaiveDate::from_ymd_opt(2026, 2, 27).unwrap()
        );
    }
}
