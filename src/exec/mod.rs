//! Position controller: admits signals through a gate chain, sizes and
//! places orders, polls fills, evaluates the exit rule set every sweep, and
//! tunes its own exit thresholds from recent trade outcomes.
//!
//! State machine per contract:
//! no-position → order-placed(unfilled) → filled(open) → closed.
//! The open-position map, cooldown timestamps and the active exit-parameter
//! set are owned exclusively by this controller and touched only from the
//! single control task.

pub mod exits;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::store::models::{
    EdgePoint, EntryContext, ExitParams, ExitReason, PnlPoint, Side, Signal, TradeRecord,
};
use crate::store::Database;
use crate::venue::{extract_event_ticker, OrderAction, OrderRequest, Venue};

use exits::PositionSnapshot;

/// Trajectory cap while a position is live; trade records keep the last 10.
const MAX_TRAJECTORY_POINTS: usize = 120;
const TRADE_RECORD_TRAJECTORY_POINTS: usize = 10;

/// One live position, entry to exit.
#[derive(Debug, Clone)]
pub struct Position {
    pub ticker: String,
    pub event_ticker: String,
    pub side: Side,
    /// Cents per contract at entry.
    pub entry_price: i64,
    pub contracts: u32,
    /// entry_price × contracts; never changes after entry.
    pub total_cost: i64,
    pub order_id: String,
    pub opened_at: DateTime<Utc>,
    pub filled: bool,
    pub last_fill_check: DateTime<Utc>,
    pub last_model_fv: i64,
    /// Side-adjusted live edge in cents.
    pub last_edge: f64,
    pub model_updates: u32,
    /// High-water mark of the percentage return.
    pub peak_pnl_pct: f64,
    pub entry_context: EntryContext,
    pub edge_trajectory: Vec<EdgePoint>,
    pub pnl_trajectory: Vec<PnlPoint>,
}

impl Position {
    fn from_signal(
        signal: &Signal,
        entry_price: i64,
        contracts: u32,
        order_id: String,
        filled: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Position {
            ticker: signal.ticker.clone(),
            event_ticker: extract_event_ticker(&signal.ticker).to_string(),
            side: signal.side,
            entry_price,
            contracts,
            total_cost: entry_price * contracts as i64,
            order_id,
            opened_at: now,
            filled,
            last_fill_check: DateTime::<Utc>::MIN_UTC,
            last_model_fv: signal.model_fv,
            last_edge: signal.edge,
            model_updates: 0,
            peak_pnl_pct: 0.0,
            entry_context: EntryContext {
                strategy: signal.strategy.clone(),
                edge: signal.edge,
                strength: signal.strength,
                model_fv: signal.model_fv,
                market_price: signal.market_price,
                minutes_remaining: signal.context.minutes_remaining,
                period: signal.context.period,
                lead: signal.context.lead,
                score: signal.context.score.clone(),
                game: signal.context.name.clone(),
            },
            edge_trajectory: Vec::new(),
            pnl_trajectory: Vec::new(),
        }
    }

    /// Value of one contract of our side given the YES quote.
    fn side_price(&self, yes_price: i64) -> i64 {
        match self.side {
            Side::Yes => yes_price,
            Side::No => 100 - yes_price,
        }
    }
}

enum Removal {
    CancelUnfilled,
    Exit {
        reason: ExitReason,
        exit_price: i64,
        pnl_total: i64,
        pnl_pct: f64,
    },
}

pub struct PositionController {
    config: Config,
    store: Database,
    venue: Arc<dyn Venue>,
    positions: HashMap<String, Position>,
    /// Ticker → last close/cancel time.
    recent_tickers: HashMap<String, DateTime<Utc>>,
    /// Event ticker → cooldown anchor (pushed into the future after a stop).
    recent_events: HashMap<String, DateTime<Utc>>,
    /// Tickers the venue already holds (from bootstrap), never doubled up on.
    known_venue_tickers: HashSet<String>,
    bankroll_cents: i64,
    bankroll_refreshed_at: Option<DateTime<Utc>>,
    target_position_cents: i64,
    exits: ExitParams,
    closed_trades: Vec<TradeRecord>,
    session_pnl_cents: i64,
    session_invested_cents: i64,
    trade_count: u64,
    /// True while venue auth is failing: no order admission, observation only.
    observe_only: bool,
}

impl PositionController {
    pub fn new(config: Config, store: Database, venue: Arc<dyn Venue>) -> Self {
        let exits = match store.load_exit_params() {
            Ok(Some((params, reason))) => {
                info!("Loaded tuned exit parameters ({}): {:?}", reason, params);
                params.clamped()
            }
            Ok(None) => ExitParams::default(),
            Err(e) => {
                warn!("Failed to load exit parameters, using defaults: {}", e);
                ExitParams::default()
            }
        };
        let target_position_cents = config.min_target_position_cents;
        PositionController {
            config,
            store,
            venue,
            positions: HashMap::new(),
            recent_tickers: HashMap::new(),
            recent_events: HashMap::new(),
            known_venue_tickers: HashSet::new(),
            bankroll_cents: 0,
            bankroll_refreshed_at: None,
            target_position_cents,
            exits,
            closed_trades: Vec::new(),
            session_pnl_cents: 0,
            session_invested_cents: 0,
            trade_count: 0,
            observe_only: false,
        }
    }

    /// Load venue-side state at startup so we never double up on contracts
    /// held from a previous run. Failures degrade, never abort.
    pub async fn bootstrap(&mut self) {
        match self.venue.get_positions().await {
            Ok(positions) => {
                let now = Utc::now();
                for p in positions.into_iter().filter(|p| p.position != 0) {
                    let event = extract_event_ticker(&p.ticker).to_string();
                    self.recent_events.insert(event, now);
                    self.recent_tickers.insert(p.ticker.clone(), now);
                    self.known_venue_tickers.insert(p.ticker);
                }
                if !self.known_venue_tickers.is_empty() {
                    info!(
                        "Found {} existing venue positions",
                        self.known_venue_tickers.len()
                    );
                }
            }
            Err(e) => {
                warn!("Could not load existing venue positions: {}", e);
                if e.is_auth() {
                    self.set_observe_only(true);
                }
            }
        }
        self.refresh_bankroll(true).await;
    }

    pub fn set_observe_only(&mut self, observe_only: bool) {
        if observe_only != self.observe_only {
            if observe_only {
                warn!("Controller degraded to observation-only mode (venue auth failing)");
            } else {
                info!("Controller re-armed: venue auth restored");
            }
        }
        self.observe_only = observe_only;
    }

    pub fn observe_only(&self) -> bool {
        self.observe_only
    }

    /// Reload the persisted exit-parameter set (used at session start).
    pub fn reload_exit_params(&mut self) {
        if let Ok(Some((params, reason))) = self.store.load_exit_params() {
            info!("Reloaded exit parameters ({})", reason);
            self.exits = params.clamped();
        }
    }

    pub fn exits(&self) -> &ExitParams {
        &self.exits
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn open_tickers(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn session_pnl_cents(&self) -> i64 {
        self.session_pnl_cents
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    /// Session ROI in percent of capital deployed.
    pub fn session_roi_pct(&self) -> f64 {
        if self.session_invested_cents <= 0 {
            return 0.0;
        }
        self.session_pnl_cents as f64 / self.session_invested_cents as f64 * 100.0
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    /// Run the admission gate chain in order. Returns the first reject reason,
    /// or `None` when the signal may proceed to sizing.
    fn admission_reject(&self, signal: &Signal, now: DateTime<Utc>) -> Option<String> {
        let cfg = &self.config;
        if signal.strength < cfg.min_signal_strength {
            return Some(format!("strength {} below floor", signal.strength));
        }
        if signal.edge < cfg.min_entry_edge {
            return Some(format!("edge {:.1}c below floor", signal.edge));
        }
        if signal.edge > cfg.max_entry_edge {
            return Some(format!("edge {:.1}c above ceiling", signal.edge));
        }
        if signal.context.minutes_remaining < cfg.min_minutes_remaining {
            return Some(format!(
                "{:.1}min remaining below floor",
                signal.context.minutes_remaining
            ));
        }
        if !cfg
            .allowed_series
            .iter()
            .any(|series| signal.ticker.starts_with(series.as_str()))
        {
            return Some("series not allow-listed".into());
        }
        if self.positions.len() >= cfg.max_open_positions {
            return Some("open-position cap reached".into());
        }
        if self.positions.contains_key(&signal.ticker)
            || self.known_venue_tickers.contains(&signal.ticker)
        {
            return Some("duplicate contract".into());
        }
        let event_ticker = extract_event_ticker(&signal.ticker);
        if self
            .positions
            .values()
            .any(|p| p.event_ticker == event_ticker)
        {
            return Some("one position per game".into());
        }
        if let Some(last) = self.recent_tickers.get(&signal.ticker) {
            if now - *last < Duration::seconds(cfg.ticker_cooldown_secs as i64) {
                return Some("ticker cooldown".into());
            }
        }
        if let Some(last) = self.recent_events.get(event_ticker) {
            if now - *last < Duration::seconds(cfg.event_cooldown_secs as i64) {
                return Some("game cooldown".into());
            }
        }
        if signal.market_price < cfg.min_entry_price
            || signal.market_price > 100 - cfg.min_entry_price
        {
            return Some(format!("price {}c outside range", signal.market_price));
        }
        if signal.edge - cfg.fee_buffer_cents < cfg.min_net_edge {
            return Some(format!("edge {:.1}c too small after fees", signal.edge));
        }
        None
    }

    /// Contracts to buy for a consistent capital-at-risk target: cheap
    /// contracts get proportionally more units, capped.
    fn calc_contracts(&self, price_cents: i64) -> u32 {
        if price_cents <= 0 || self.target_position_cents <= 0 {
            return 1;
        }
        let n = ((self.target_position_cents as f64 / price_cents as f64).round() as u32).max(1);
        n.min(self.config.max_contracts_per_trade)
    }

    /// Refresh the balance and the per-position capital target, at most once
    /// per configured interval unless forced.
    async fn refresh_bankroll(&mut self, force: bool) {
        let now = Utc::now();
        if !force {
            if let Some(last) = self.bankroll_refreshed_at {
                if now - last < Duration::seconds(self.config.bankroll_refresh_secs as i64) {
                    return;
                }
            }
        }
        match self.venue.get_balance().await {
            Ok(balance) => {
                self.bankroll_cents = balance;
                self.bankroll_refreshed_at = Some(now);
                let target =
                    (balance as f64 * self.config.target_bankroll_pct / 100.0).round() as i64;
                self.target_position_cents = target
                    .max(self.config.min_target_position_cents)
                    .min(self.config.max_target_position_cents);
                if let Err(e) = self.store.record_balance(balance) {
                    warn!("Failed to record balance snapshot: {}", e);
                }
            }
            Err(e) => {
                warn!("Balance refresh failed: {}", e);
                if e.is_auth() {
                    self.set_observe_only(true);
                }
            }
        }
    }

    /// Evaluate one signal for execution. A rejected signal is dropped, never
    /// retried: market conditions will have moved by the next chance.
    pub async fn on_signal(&mut self, signal: &Signal) -> anyhow::Result<()> {
        if self.observe_only {
            debug!("Observation-only: ignoring signal {} {}", signal.strategy, signal.ticker);
            return Ok(());
        }
        let now = Utc::now();
        if let Some(reason) = self.admission_reject(signal, now) {
            debug!(
                "Signal rejected ({}): {} {} {}",
                reason,
                signal.strategy,
                signal.ticker,
                signal.side.as_str()
            );
            return Ok(());
        }

        // Order price: one cent through the touch, capped at the maximum
        // acceptable cost per contract.
        let unit_price = match signal.side {
            Side::Yes => (signal.market_price + 1).min(self.config.max_cost_cents),
            Side::No => (100 - signal.market_price + 1).min(self.config.max_cost_cents),
        };
        if unit_price < self.config.min_entry_price || unit_price > self.config.max_cost_cents {
            debug!(
                "Signal rejected (unit price {}c outside range): {}",
                unit_price, signal.ticker
            );
            return Ok(());
        }

        self.refresh_bankroll(false).await;
        if self.observe_only {
            return Ok(());
        }
        let contracts = self.calc_contracts(unit_price);

        // Total-exposure cap across all open positions.
        let current_exposure: i64 = self.positions.values().map(|p| p.total_cost).sum();
        let new_exposure = unit_price * contracts as i64;
        let max_exposure = if self.bankroll_cents > 0 {
            (self.bankroll_cents as f64 * self.config.max_exposure_fraction) as i64
        } else {
            self.config.fallback_max_exposure_cents
        };
        if current_exposure + new_exposure > max_exposure {
            debug!(
                "Signal rejected (exposure {}c + {}c over cap {}c): {}",
                current_exposure, new_exposure, max_exposure, signal.ticker
            );
            return Ok(());
        }

        let order = OrderRequest {
            ticker: signal.ticker.clone(),
            side: signal.side,
            action: OrderAction::Buy,
            count: contracts,
            price_cents: unit_price,
        };

        let (order_id, filled) = if self.config.dry_run {
            info!(
                "[DRY RUN] Would BUY {}x {} {} @ {}c ({})",
                contracts,
                signal.side.as_str().to_uppercase(),
                signal.ticker,
                unit_price,
                signal.strategy
            );
            ("dry-run".to_string(), true)
        } else {
            match self.venue.create_order(&order).await {
                Ok(conf) => (conf.order_id, false),
                Err(e) => {
                    error!("Order failed for {}: {}", signal.ticker, e);
                    if e.is_auth() {
                        self.set_observe_only(true);
                    }
                    return Ok(());
                }
            }
        };

        info!(
            "BUY {}x {} {} @ {}c (${:.2}) | {} edge={:.0}c strength={}",
            contracts,
            signal.side.as_str().to_uppercase(),
            signal.ticker,
            unit_price,
            (unit_price * contracts as i64) as f64 / 100.0,
            signal.strategy,
            signal.edge,
            signal.strength
        );

        let pos = Position::from_signal(signal, unit_price, contracts, order_id, filled, now);
        self.positions.insert(signal.ticker.clone(), pos);
        Ok(())
    }

    // ── Live updates ──────────────────────────────────────────────────────────

    /// Feed a fresh model value to an open position. Tracks the edge and P&L
    /// trajectories the learner and tuner consume later.
    pub fn update_model_value(&mut self, ticker: &str, model_fv: i64, yes_price: i64) {
        let Some(pos) = self.positions.get_mut(ticker) else {
            return;
        };
        if !pos.filled {
            return;
        }
        let now = Utc::now();
        pos.last_model_fv = model_fv;
        pos.model_updates += 1;
        pos.last_edge = match pos.side {
            Side::Yes => (model_fv - yes_price) as f64,
            Side::No => (yes_price - model_fv) as f64,
        };
        pos.edge_trajectory.push(EdgePoint {
            ts: now,
            edge: pos.last_edge,
            model_fv,
            market_price: yes_price,
        });

        let current = pos.side_price(yes_price);
        let pnl_pct = if pos.entry_price > 0 {
            (current - pos.entry_price) as f64 / pos.entry_price as f64 * 100.0
        } else {
            0.0
        };
        pos.pnl_trajectory.push(PnlPoint { ts: now, pnl_pct });

        if pos.edge_trajectory.len() > MAX_TRAJECTORY_POINTS {
            let excess = pos.edge_trajectory.len() - MAX_TRAJECTORY_POINTS;
            pos.edge_trajectory.drain(..excess);
        }
        if pos.pnl_trajectory.len() > MAX_TRAJECTORY_POINTS {
            let excess = pos.pnl_trajectory.len() - MAX_TRAJECTORY_POINTS;
            pos.pnl_trajectory.drain(..excess);
        }
    }

    // ── Sweep ─────────────────────────────────────────────────────────────────

    /// One management sweep over all open positions: fill detection (batched,
    /// throttled), unfilled-timeout cancellation, then exit evaluation in
    /// strict priority order.
    pub async fn check_positions(
        &mut self,
        current_yes_prices: &HashMap<String, i64>,
        session_date: NaiveDate,
    ) -> anyhow::Result<()> {
        if self.positions.is_empty() {
            return Ok(());
        }
        let now = Utc::now();

        self.detect_fills(now).await;

        let mut removals: Vec<(String, Removal)> = Vec::new();
        for (ticker, pos) in self.positions.iter_mut() {
            let age_secs = (now - pos.opened_at).num_seconds().max(0);

            if !pos.filled {
                if age_secs > self.config.order_timeout_secs as i64 {
                    removals.push((ticker.clone(), Removal::CancelUnfilled));
                }
                continue;
            }

            let current = match current_yes_prices.get(ticker) {
                Some(yes) => pos.side_price(*yes),
                // No usable quote this sweep: treat as unchanged.
                None => pos.entry_price,
            };
            let pnl_per = current - pos.entry_price;
            let pnl_total = pnl_per * pos.contracts as i64;
            let pnl_pct = if pos.entry_price > 0 {
                pnl_per as f64 / pos.entry_price as f64 * 100.0
            } else {
                0.0
            };

            // High-water mark before exit evaluation.
            if pnl_pct > pos.peak_pnl_pct {
                pos.peak_pnl_pct = pnl_pct;
            }

            let snapshot = PositionSnapshot {
                pnl_pct,
                pnl_per_contract: pnl_per,
                peak_pnl_pct: pos.peak_pnl_pct,
                age_secs,
                last_edge: pos.last_edge,
                model_updates: pos.model_updates,
            };
            if let Some(reason) =
                exits::evaluate_exit(&self.exits, self.config.max_loss_per_contract, &snapshot)
            {
                removals.push((
                    ticker.clone(),
                    Removal::Exit {
                        reason,
                        exit_price: current,
                        pnl_total,
                        pnl_pct,
                    },
                ));
            }
        }

        for (ticker, removal) in removals {
            let Some(pos) = self.positions.remove(&ticker) else {
                continue;
            };
            let event_ticker = pos.event_ticker.clone();
            let mut stop_loss = false;
            match removal {
                Removal::CancelUnfilled => {
                    info!(
                        "CANCEL unfilled {} after {}s",
                        ticker,
                        (now - pos.opened_at).num_seconds()
                    );
                    if !self.config.dry_run {
                        if let Err(e) = self.venue.cancel_order(&pos.order_id).await {
                            // The venue may already have cancelled or filled it;
                            // bookkeeping is dropped either way.
                            warn!("Cancel failed for {}: {}", ticker, e);
                        }
                    }
                    // Discarded without a trade-history record.
                }
                Removal::Exit {
                    reason,
                    exit_price,
                    pnl_total,
                    pnl_pct,
                } => {
                    stop_loss = reason == ExitReason::StopLoss;
                    self.close_position(pos, exit_price, reason, pnl_total, pnl_pct, session_date)
                        .await;
                }
            }

            self.recent_tickers.insert(ticker, now);
            // After a stop loss, cool the whole game off for longer.
            let anchor = if stop_loss {
                now + Duration::seconds(self.config.stop_loss_extra_cooldown_secs as i64)
            } else {
                now
            };
            self.recent_events.insert(event_ticker, anchor);
        }

        Ok(())
    }

    /// Throttled, batched fill detection across all unfilled positions.
    async fn detect_fills(&mut self, now: DateTime<Utc>) {
        let interval = Duration::seconds(self.config.fill_check_interval_secs as i64);
        let due = self
            .positions
            .values()
            .any(|p| !p.filled && now - p.last_fill_check >= interval);
        if !due {
            return;
        }

        match self.venue.get_fills(20).await {
            Ok(fills) => {
                let fill_tickers: HashSet<&str> =
                    fills.iter().map(|f| f.ticker.as_str()).collect();
                for pos in self.positions.values_mut().filter(|p| !p.filled) {
                    pos.last_fill_check = now;
                    if fill_tickers.contains(pos.ticker.as_str()) {
                        pos.filled = true;
                        // No partial-fill modeling: filled at the order price.
                        info!(
                            "FILLED {} {}x {} @ {}c",
                            pos.ticker,
                            pos.contracts,
                            pos.side.as_str(),
                            pos.entry_price
                        );
                    }
                }
            }
            Err(e) => {
                warn!("Fills query failed: {}", e);
                if e.is_auth() {
                    self.set_observe_only(true);
                }
            }
        }
    }

    /// Submit the closing order, record P&L, and append the full-context
    /// trade record. A close failure is logged but the position still leaves
    /// the live set; venue-side state is then authoritative.
    async fn close_position(
        &mut self,
        pos: Position,
        exit_price: i64,
        reason: ExitReason,
        pnl_total: i64,
        pnl_pct: f64,
        session_date: NaiveDate,
    ) {
        if !self.config.dry_run {
            let close = OrderRequest {
                ticker: pos.ticker.clone(),
                side: pos.side,
                action: OrderAction::Sell,
                count: pos.contracts,
                // Sell limit at the floor: take whatever the book gives.
                price_cents: 1,
            };
            if let Err(e) = self.venue.create_order(&close).await {
                error!("EXIT order failed for {}: {}", pos.ticker, e);
                if e.is_auth() {
                    self.set_observe_only(true);
                }
            }
        }

        let now = Utc::now();
        let hold_secs = (now - pos.opened_at).num_seconds().max(0);
        self.session_pnl_cents += pnl_total;
        self.session_invested_cents += pos.total_cost;
        self.trade_count += 1;

        info!(
            "SELL {}x {} | {} | {}s | P&L: {:+}c ({:+.1}%) | Session: {:+}c",
            pos.contracts,
            pos.ticker,
            reason.as_str(),
            hold_secs,
            pnl_total,
            pnl_pct,
            self.session_pnl_cents
        );

        let tail = |len: usize| len.saturating_sub(TRADE_RECORD_TRAJECTORY_POINTS);
        let record = TradeRecord {
            id: None,
            ticker: pos.ticker.clone(),
            event_ticker: pos.event_ticker.clone(),
            side: pos.side,
            strategy: pos.entry_context.strategy.clone(),
            entry_price: pos.entry_price,
            exit_price,
            contracts: pos.contracts,
            total_cost: pos.total_cost,
            pnl_cents: pnl_total,
            pnl_per_contract: exit_price - pos.entry_price,
            pnl_pct,
            exit_reason: reason,
            hold_secs,
            peak_pnl_pct: pos.peak_pnl_pct,
            edge_at_exit: pos.last_edge,
            model_updates: pos.model_updates,
            entry_context: pos.entry_context.clone(),
            exit_params: self.exits,
            edge_trajectory: pos.edge_trajectory[tail(pos.edge_trajectory.len())..].to_vec(),
            pnl_trajectory: pos.pnl_trajectory[tail(pos.pnl_trajectory.len())..].to_vec(),
            opened_at: pos.opened_at,
            closed_at: now,
        };
        if let Err(e) = self.store.append_trade(session_date, &record) {
            error!("Failed to append trade record for {}: {}", pos.ticker, e);
        }
        self.closed_trades.push(record);

        self.maybe_tune_exits();
    }

    /// Every N closed trades, let the tuner inspect the recent window and
    /// possibly replace the active exit-parameter set.
    fn maybe_tune_exits(&mut self) {
        let n = self.closed_trades.len();
        if n < self.config.tune_min_trades || n % self.config.tune_every_trades != 0 {
            return;
        }
        let window_start = n.saturating_sub(self.config.tune_window_trades);
        if let Some((next, reason)) =
            exits::tune_exits(&self.exits, &self.closed_trades[window_start..])
        {
            self.exits = next;
            if let Err(e) = self.store.save_exit_params(&next, &reason) {
                error!("Failed to persist tuned exit parameters: {}", e);
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
