use clap::Parser;

/// Kalshi college-basketball in-play trading bot.
///
/// Every numeric threshold is deliberately a flag with an env fallback:
/// these are tuning defaults, not constants.
#[derive(Parser, Debug, Clone)]
#[command(name = "courtside-bot", version, about)]
pub struct Config {
    /// Run in dry-run mode (no real orders placed)
    #[arg(long, env = "DRY_RUN", default_value = "false")]
    pub dry_run: bool,

    /// Run the calibration pass for a past session (YYYY-MM-DD) and exit
    #[arg(long, env = "ANALYZE_DATE")]
    pub analyze: Option<String>,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "courtside.db")]
    pub database_path: String,

    /// Status API listen address
    #[arg(long, env = "STATUS_ADDR", default_value = "0.0.0.0:8090")]
    pub status_addr: String,

    /// Kalshi API base URL
    #[arg(
        long,
        env = "KALSHI_BASE_URL",
        default_value = "https://api.elections.kalshi.com"
    )]
    pub kalshi_base_url: String,

    /// Kalshi API key ID (required for live trading)
    #[arg(long, env = "KALSHI_API_KEY_ID")]
    pub kalshi_api_key_id: Option<String>,

    /// Kalshi API secret used to sign requests
    #[arg(long, env = "KALSHI_API_SECRET")]
    pub kalshi_api_secret: Option<String>,

    /// ESPN scoreboard URL (hidden API, all of Division 1)
    #[arg(
        long,
        env = "ESPN_SCOREBOARD_URL",
        default_value = "https://site.api.espn.com/apis/site/v2/sports/basketball/mens-college-basketball/scoreboard?groups=50&limit=200"
    )]
    pub espn_scoreboard_url: String,

    /// Live poll interval in seconds
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "15")]
    pub poll_interval_secs: u64,

    /// Full market-catalog scan interval in seconds
    #[arg(long, env = "SCAN_INTERVAL_SECS", default_value = "300")]
    pub scan_interval_secs: u64,

    /// Session wake hour, local venue time (0-23)
    #[arg(long, env = "SESSION_WAKE_HOUR", default_value = "18")]
    pub session_wake_hour: u32,

    /// Session sleep hour, local venue time (0-23)
    #[arg(long, env = "SESSION_SLEEP_HOUR", default_value = "1")]
    pub session_sleep_hour: u32,

    /// UTC offset of the venue's local time, hours (EST = -5)
    #[arg(
        long,
        env = "SESSION_TZ_OFFSET_HOURS",
        default_value = "-5",
        allow_hyphen_values = true
    )]
    pub session_tz_offset_hours: i32,

    // ── Model ────────────────────────────────────────────────────────────────
    /// Standard deviation of the final margin, points
    #[arg(long, env = "MODEL_SIGMA", default_value = "11.0")]
    pub model_sigma: f64,

    /// Regulation game length, minutes
    #[arg(long, env = "GAME_LENGTH_MIN", default_value = "40.0")]
    pub game_length_min: f64,

    // ── Admission ────────────────────────────────────────────────────────────
    /// Series tickers eligible for entries (comma separated)
    #[arg(
        long,
        env = "ALLOWED_SERIES",
        value_delimiter = ',',
        default_value = "KXNCAAMBGAME"
    )]
    pub allowed_series: Vec<String>,

    /// Series tickers scanned for market data (comma separated)
    #[arg(
        long,
        env = "SCAN_SERIES",
        value_delimiter = ',',
        default_value = "KXNCAAMBGAME,KXNCAAMBSPREAD,KXNCAAMBTOTAL,KXNCAAMB1HWINNER"
    )]
    pub scan_series: Vec<String>,

    /// Minimum signal strength (0-10) to consider an entry
    #[arg(long, env = "MIN_SIGNAL_STRENGTH", default_value = "5")]
    pub min_signal_strength: u8,

    /// Minimum claimed edge in cents to enter
    #[arg(long, env = "MIN_ENTRY_EDGE", default_value = "6.0")]
    pub min_entry_edge: f64,

    /// Maximum claimed edge in cents; beyond this the model is wrong, not right
    #[arg(long, env = "MAX_ENTRY_EDGE", default_value = "18.0")]
    pub max_entry_edge: f64,

    /// No new entries with fewer minutes remaining than this
    #[arg(long, env = "MIN_MINUTES_REMAINING", default_value = "8.0")]
    pub min_minutes_remaining: f64,

    /// Maximum simultaneous open positions
    #[arg(long, env = "MAX_OPEN_POSITIONS", default_value = "5")]
    pub max_open_positions: usize,

    /// Cooldown between entries on the same contract, seconds
    #[arg(long, env = "TICKER_COOLDOWN_SECS", default_value = "120")]
    pub ticker_cooldown_secs: u64,

    /// Cooldown between entries on the same game, seconds
    #[arg(long, env = "EVENT_COOLDOWN_SECS", default_value = "300")]
    pub event_cooldown_secs: u64,

    /// Extra game cooldown after a stop-loss exit, seconds
    #[arg(long, env = "STOP_LOSS_EXTRA_COOLDOWN_SECS", default_value = "300")]
    pub stop_loss_extra_cooldown_secs: u64,

    /// Don't enter when the quote is below this (a one-tick move is too large
    /// a percentage swing near the extremes), cents
    #[arg(long, env = "MIN_ENTRY_PRICE", default_value = "25")]
    pub min_entry_price: i64,

    /// Maximum cost per contract, cents
    #[arg(long, env = "MAX_COST_CENTS", default_value = "75")]
    pub max_cost_cents: i64,

    /// Assumed fee per round trip, cents of edge consumed
    #[arg(long, env = "FEE_BUFFER_CENTS", default_value = "2.0")]
    pub fee_buffer_cents: f64,

    /// Minimum edge left after the fee buffer, cents
    #[arg(long, env = "MIN_NET_EDGE", default_value = "1.0")]
    pub min_net_edge: f64,

    // ── Sizing ───────────────────────────────────────────────────────────────
    /// Target capital per position as a percentage of balance
    #[arg(long, env = "TARGET_BANKROLL_PCT", default_value = "10.0")]
    pub target_bankroll_pct: f64,

    /// Floor for the per-position capital target, cents
    #[arg(long, env = "MIN_TARGET_POSITION_CENTS", default_value = "30")]
    pub min_target_position_cents: i64,

    /// Cap for the per-position capital target, cents
    #[arg(long, env = "MAX_TARGET_POSITION_CENTS", default_value = "150")]
    pub max_target_position_cents: i64,

    /// Maximum contracts per trade
    #[arg(long, env = "MAX_CONTRACTS_PER_TRADE", default_value = "5")]
    pub max_contracts_per_trade: u32,

    /// Total open exposure cap as a fraction of balance
    #[arg(long, env = "MAX_EXPOSURE_FRACTION", default_value = "0.60")]
    pub max_exposure_fraction: f64,

    /// Exposure cap in cents when the balance is unknown
    #[arg(long, env = "FALLBACK_MAX_EXPOSURE_CENTS", default_value = "500")]
    pub fallback_max_exposure_cents: i64,

    /// Balance refresh throttle, seconds
    #[arg(long, env = "BANKROLL_REFRESH_SECS", default_value = "60")]
    pub bankroll_refresh_secs: u64,

    // ── Lifecycle ────────────────────────────────────────────────────────────
    /// Cancel unfilled orders after this many seconds
    #[arg(long, env = "ORDER_TIMEOUT_SECS", default_value = "45")]
    pub order_timeout_secs: u64,

    /// Throttle for the batched fills query, seconds
    #[arg(long, env = "FILL_CHECK_INTERVAL_SECS", default_value = "15")]
    pub fill_check_interval_secs: u64,

    /// Absolute stop: maximum loss per contract, cents
    #[arg(long, env = "MAX_LOSS_PER_CONTRACT", default_value = "8")]
    pub max_loss_per_contract: i64,

    // ── Adaptive tuning ──────────────────────────────────────────────────────
    /// Closed trades required before the tuner may run
    #[arg(long, env = "TUNE_MIN_TRADES", default_value = "10")]
    pub tune_min_trades: usize,

    /// Run the tuner every N closed trades
    #[arg(long, env = "TUNE_EVERY_TRADES", default_value = "5")]
    pub tune_every_trades: usize,

    /// Closed trades the tuner looks back over
    #[arg(long, env = "TUNE_WINDOW_TRADES", default_value = "30")]
    pub tune_window_trades: usize,

    // ── Learner ──────────────────────────────────────────────────────────────
    /// Minimum signal strength for the paper portfolio
    #[arg(long, env = "PAPER_STRENGTH_FLOOR", default_value = "5")]
    pub paper_strength_floor: u8,

    /// Paper-trade hold time, seconds
    #[arg(long, env = "PAPER_HOLD_SECS", default_value = "180")]
    pub paper_hold_secs: i64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.dry_run {
            if self.kalshi_api_key_id.is_none() {
                anyhow::bail!(
                    "KALSHI_API_KEY_ID is required in live trading mode. Use --dry-run for simulation."
                );
            }
            if self.kalshi_api_secret.is_none() {
                anyhow::bail!(
                    "KALSHI_API_SECRET is required in live trading mode. Use --dry-run for simulation."
                );
            }
        }
        if self.model_sigma <= 0.0 {
            anyhow::bail!("model_sigma must be positive");
        }
        if self.game_length_min <= 0.0 {
            anyhow::bail!("game_length_min must be positive");
        }
        if self.min_entry_edge > self.max_entry_edge {
            anyhow::bail!("min_entry_edge must not exceed max_entry_edge");
        }
        if !(1..=99).contains(&self.min_entry_price) {
            anyhow::bail!("min_entry_price must be within 1-99 cents");
        }
        if !(1..=99).contains(&self.max_cost_cents) {
            anyhow::bail!("max_cost_cents must be within 1-99 cents");
        }
        if !(0.0..=1.0).contains(&self.max_exposure_fraction) {
            anyhow::bail!("max_exposure_fraction must be between 0.0 and 1.0");
        }
        if !(0.0..=100.0).contains(&self.target_bankroll_pct) {
            anyhow::bail!("target_bankroll_pct must be between 0.0 and 100.0");
        }
        if self.session_wake_hour > 23 || self.session_sleep_hour > 23 {
            anyhow::bail!("session hours must be within 0-23");
        }
        if self.max_contracts_per_trade == 0 {
            anyhow::bail!("max_contracts_per_trade must be at least 1");
        }
        Ok(())
    }
}
