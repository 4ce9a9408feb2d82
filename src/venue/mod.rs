//! Trading-venue interface: balance, positions, market data, orders, fills.
//!
//! The control loop only ever sees the `Venue` trait and the typed
//! `VenueError` kinds, so its skip/degrade policy is testable without
//! network access. All calls are synchronous from the loop's point of view
//! and carry their own bounded timeouts; a failed call is logged by the
//! caller and the cycle continues (no automatic retry).

pub mod kalshi;
pub mod scanner;

pub use kalshi::KalshiClient;
pub use scanner::{ContractView, MarketCatalog, ScanSummary};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::models::Side;

#[derive(Debug, thiserror::Error)]
pub enum VenueError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("authentication rejected")]
    Auth,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
}

impl VenueError {
    pub fn is_auth(&self) -> bool {
        matches!(self, VenueError::Auth)
    }
}

/// One market as the venue reports it (nested under an event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueMarket {
    pub ticker: String,
    pub event_ticker: String,
    pub series: String,
    pub subtitle: String,
    pub yes_bid: Option<i64>,
    pub yes_ask: Option<i64>,
    pub last_price: Option<i64>,
    pub volume: i64,
    pub open_interest: i64,
    pub status: String,
}

/// One event with its nested markets.
#[derive(Debug, Clone)]
pub struct VenueEvent {
    pub event_ticker: String,
    pub series: String,
    pub title: String,
    pub sub_title: String,
    pub markets: Vec<VenueMarket>,
}

/// A contract position the venue says we hold.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub ticker: String,
    pub position: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "buy",
            OrderAction::Sell => "sell",
        }
    }
}

/// A limit order. Price is for the contract side being traded, in cents.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub ticker: String,
    pub side: Side,
    pub action: OrderAction,
    pub count: u32,
    pub price_cents: i64,
}

#[derive(Debug, Clone)]
pub struct OrderConfirmation {
    pub order_id: String,
}

/// One fill as reported by the batched fills query.
#[derive(Debug, Clone)]
pub struct Fill {
    pub ticker: String,
    pub order_id: String,
    pub count: i64,
}

/// Everything the position controller and scanner need from the venue.
#[async_trait]
pub trait Venue: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Account balance in cents.
    async fn get_balance(&self) -> Result<i64, VenueError>;

    /// Currently held contract positions.
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError>;

    /// Open events (with nested markets) for one series.
    async fn get_events(&self, series_ticker: &str) -> Result<Vec<VenueEvent>, VenueError>;

    /// Fresh data for a single market.
    async fn get_market(&self, ticker: &str) -> Result<VenueMarket, VenueError>;

    async fn create_order(&self, order: &OrderRequest) -> Result<OrderConfirmation, VenueError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError>;

    /// Most recent fills, newest first.
    async fn get_fills(&self, limit: u32) -> Result<Vec<Fill>, VenueError>;
}

/// Parent event ticker for a market ticker:
/// `KXNCAAMBGAME-26FEB27MICHILL-MICH` → `KXNCAAMBGAME-26FEB27MICHILL`.
pub fn extract_event_ticker(ticker: &str) -> &str {
    match ticker.rsplit_once('-') {
        Some((event, _team)) => event,
        None => ticker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ticker_strips_team_segment() {
        assert_eq!(
            extract_event_ticker("KXNCAAMBGAME-26FEB27MICHILL-MICH"),
            "KXNCAAMBGAME-26FEB27MICHILL"
        );
        assert_eq!(extract_event_ticker("NODASH"), "NODASH");
    }
}
