//! Market catalog: periodic scan of the configured series plus game→contract
//! matching.
//!
//! The venue's moneyline tickers end with the team's abbreviation
//! (`KXNCAAMBGAME-26FEB27MICHILL-MICH` = "Michigan wins"), and the event
//! segment concatenates both abbreviations. Matching keys off that shape and
//! records whether each contract's YES side is the home team, so the model
//! can be oriented per contract. Spread/total markets are scanned for data
//! capture but never match (their final segment is a line, not a team).

use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, warn};

use super::{Venue, VenueError, VenueMarket};
use crate::store::models::{GameState, MarketQuote};

/// One tradable contract matched to a live game.
#[derive(Debug, Clone)]
pub struct ContractView {
    pub ticker: String,
    pub event_ticker: String,
    pub series: String,
    /// Whether this contract's YES pays when the home team wins.
    pub yes_is_home: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub events: usize,
    pub markets: usize,
    pub total_volume: i64,
}

/// In-memory cache of the venue's open markets, refreshed by full scans.
pub struct MarketCatalog {
    series: Vec<String>,
    /// ticker → latest market data.
    markets: HashMap<String, VenueMarket>,
}

impl MarketCatalog {
    pub fn new(series: Vec<String>) -> Self {
        MarketCatalog {
            series,
            markets: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Full scan of every configured series. Each series failure is logged
    /// and skipped; the scan is as complete as the venue allows.
    pub async fn refresh(&mut self, venue: &dyn Venue) -> Result<ScanSummary, VenueError> {
        let mut summary = ScanSummary::default();
        let mut auth_failure: Option<VenueError> = None;

        for series in &self.series {
            match venue.get_events(series).await {
                Ok(events) => {
                    summary.events += events.len();
                    for event in events {
                        for market in event.markets {
                            summary.markets += 1;
                            summary.total_volume += market.volume;
                            self.markets.insert(market.ticker.clone(), market);
                        }
                    }
                }
                Err(e) => {
                    warn!("Scan failed for series {}: {}", series, e);
                    if e.is_auth() {
                        auth_failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = auth_failure {
            return Err(e);
        }
        info!(
            "Catalog scan: {} events, {} markets, volume {}",
            summary.events, summary.markets, summary.total_volume
        );
        Ok(summary)
    }

    /// Update one cached market in place (e.g. after a single-market fetch).
    pub fn upsert(&mut self, market: VenueMarket) {
        self.markets.insert(market.ticker.clone(), market);
    }

    /// Active contracts matching a live game, oriented home/away.
    pub fn match_game(&self, game: &GameState) -> Vec<ContractView> {
        if game.home_abbr.is_empty() || game.away_abbr.is_empty() {
            return Vec::new();
        }
        let mut matched = Vec::new();
        for market in self.markets.values() {
            if market.status != "active" {
                continue;
            }
            let Some((event_part, team_part)) = market.ticker.rsplit_once('-') else {
                continue;
            };
            // Require the other team's abbreviation in the event segment so
            // a shared abbreviation in another game cannot cross-match.
            let yes_is_home = if team_part == game.home_abbr {
                if !event_part.contains(game.away_abbr.as_str()) {
                    continue;
                }
                true
            } else if team_part == game.away_abbr {
                if !event_part.contains(game.home_abbr.as_str()) {
                    continue;
                }
                false
            } else {
                continue;
            };
            matched.push(ContractView {
                ticker: market.ticker.clone(),
                event_ticker: market.event_ticker.clone(),
                series: market.series.clone(),
                yes_is_home,
            });
        }
        matched
    }

    /// Current quote for a cached market.
    pub fn quote(&self, ticker: &str) -> Option<MarketQuote> {
        let market = self.markets.get(ticker)?;
        Some(MarketQuote {
            ticker: market.ticker.clone(),
            event_ticker: market.event_ticker.clone(),
            series: market.series.clone(),
            yes_bid: market.yes_bid,
            yes_ask: market.yes_ask,
            last_price: market.last_price,
            volume: market.volume,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(ticker: &str, status: &str) -> VenueMarket {
        VenueMarket {
            ticker: ticker.into(),
            event_ticker: crate::venue::extract_event_ticker(ticker).into(),
            series: ticker.split('-').next().unwrap_or("").into(),
            subtitle: String::new(),
            yes_bid: Some(44),
            yes_ask: Some(48),
            last_price: Some(46),
            volume: 1000,
            open_interest: 100,
            status: status.into(),
        }
    }

    fn game() -> GameState {
        GameState {
            event_id: "401700123".into(),
            name: "Illinois @ Michigan".into(),
            home_team: "Michigan".into(),
            away_team: "Illinois".into(),
            home_abbr: "MICH".into(),
            away_abbr: "ILL".into(),
            home_score: 55,
            away_score: 50,
            period: 2,
            clock: "12:00".into(),
            minutes_remaining: 12.0,
            lead: 5,
            pregame_spread: 0.0,
            pregame_total: None,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn matches_both_team_contracts_with_orientation() {
        let mut catalog = MarketCatalog::new(vec!["KXNCAAMBGAME".into()]);
        catalog.upsert(market("KXNCAAMBGAME-26FEB27MICHILL-MICH", "active"));
        catalog.upsert(market("KXNCAAMBGAME-26FEB27MICHILL-ILL", "active"));
        catalog.upsert(market("KXNCAAMBGAME-26FEB27DUKEUNC-DUKE", "active"));

        let mut matched = catalog.match_game(&game());
        matched.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        assert_eq!(matched.len(), 2);
        assert!(!matched[0].yes_is_home); // -ILL
        assert!(matched[1].yes_is_home); // -MICH
    }

    #[test]
    fn ignores_inactive_and_non_team_markets() {
        let mut catalog = MarketCatalog::new(vec![]);
        catalog.upsert(market("KXNCAAMBGAME-26FEB27MICHILL-MICH", "closed"));
        // Total market: final segment is a line, not an abbreviation.
        catalog.upsert(market("KXNCAAMBTOTAL-26FEB27MICHILL-T145", "active"));
        assert!(catalog.match_game(&game()).is_empty());
    }

    #[test]
    fn requires_both_abbreviations_in_the_event_segment() {
        let mut catalog = MarketCatalog::new(vec![]);
        // Another game involving Illinois: must not match our game.
        catalog.upsert(market("KXNCAAMBGAME-26FEB27ILLPUR-ILL", "active"));
        assert!(catalog.match_game(&game()).is_empty());
    }

    #[test]
    fn quote_reflects_cached_market() {
        let mut catalog = MarketCatalog::new(vec![]);
        catalog.upsert(market("KXNCAAMBGAME-26FEB27MICHILL-MICH", "active"));
        let quote = catalog
            .quote("KXNCAAMBGAME-26FEB27MICHILL-MICH")
            .expect("cached");
        assert_eq!(quote.reference_price(), Some(46));
        assert_eq!(quote.spread(), Some(4));
        assert!(catalog.quote("UNKNOWN").is_none());
    }
}
