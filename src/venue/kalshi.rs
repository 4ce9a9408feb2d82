//! Kalshi REST client.
//!
//! Market-data endpoints are public; portfolio endpoints are signed with
//! `KALSHI-ACCESS-*` headers over `{timestamp_ms}{METHOD}{path}` (query
//! string excluded from the signed message). Auth rejections surface as
//! `VenueError::Auth` so the controller can degrade to observation-only.

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;
use url::Url;

use super::{
    Fill, OrderConfirmation, OrderRequest, Venue, VenueError, VenueEvent, VenueMarket,
    VenuePosition,
};
use crate::store::models::Side;

type HmacSha256 = Hmac<Sha256>;

const API_PREFIX: &str = "/trade-api/v2";

#[derive(Clone)]
pub struct KalshiClient {
    http: Client,
    host: String,
    key_id: Option<String>,
    api_secret: Option<String>,
}

impl KalshiClient {
    pub fn new(
        base_url: &str,
        key_id: Option<String>,
        api_secret: Option<String>,
    ) -> anyhow::Result<Self> {
        // Tolerate a base URL that already carries the API prefix.
        let host = base_url
            .split("/trade-api")
            .next()
            .unwrap_or(base_url)
            .trim_end_matches('/')
            .to_string();
        Url::parse(&host).context("Invalid Kalshi base URL")?;
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(KalshiClient {
            http,
            host,
            key_id,
            api_secret,
        })
    }

    /// Signature over `{timestamp_ms}{METHOD}{path}`, query string stripped.
    fn sign(&self, timestamp_ms: &str, method: &Method, full_path: &str) -> Option<String> {
        let secret = self.api_secret.as_deref()?;
        let path_only = full_path.split('?').next().unwrap_or(full_path);
        let message = format!("{}{}{}", timestamp_ms, method.as_str(), path_only);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(message.as_bytes());
        Some(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Issue one request. `path` is relative to the API prefix and may carry
    /// a query string.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, VenueError> {
        let full_path = format!("{}{}", API_PREFIX, path);
        let url = format!("{}{}", self.host, full_path);
        debug!("{} {}", method, url);

        let timestamp = Utc::now().timestamp_millis().to_string();
        let mut builder = self.http.request(method.clone(), &url);
        if let (Some(key_id), Some(signature)) = (
            self.key_id.as_deref(),
            self.sign(&timestamp, &method, &full_path),
        ) {
            builder = builder
                .header("KALSHI-ACCESS-KEY", key_id)
                .header("KALSHI-ACCESS-SIGNATURE", signature)
                .header("KALSHI-ACCESS-TIMESTAMP", &timestamp);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(VenueError::Auth);
        }
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(VenueError::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| VenueError::Malformed(e.to_string()))
    }
}

/// Series prefix of a ticker: everything before the first dash.
fn series_of(ticker: &str) -> &str {
    ticker.split('-').next().unwrap_or(ticker)
}

fn parse_market(value: &Value, event_ticker: &str, series: &str) -> Option<VenueMarket> {
    Some(VenueMarket {
        ticker: value["ticker"].as_str()?.to_string(),
        event_ticker: event_ticker.to_string(),
        series: series.to_string(),
        subtitle: value["subtitle"].as_str().unwrap_or("").to_string(),
        yes_bid: value["yes_bid"].as_i64().filter(|p| *p > 0),
        yes_ask: value["yes_ask"].as_i64().filter(|p| *p > 0),
        last_price: value["last_price"].as_i64().filter(|p| *p > 0),
        volume: value["volume"].as_i64().unwrap_or(0),
        open_interest: value["open_interest"].as_i64().unwrap_or(0),
        status: value["status"].as_str().unwrap_or("").to_string(),
    })
}

/// Order body per the venue's schema: the price field name depends on the
/// contract side being traded.
fn order_body(order: &OrderRequest) -> Value {
    let mut body = json!({
        "ticker": order.ticker,
        "action": order.action.as_str(),
        "side": order.side.as_str(),
        "type": "limit",
        "count": order.count,
    });
    let price_field = match order.side {
        Side::Yes => "yes_price",
        Side::No => "no_price",
    };
    body[price_field] = json!(order.price_cents);
    body
}

#[async_trait]
impl Venue for KalshiClient {
    fn name(&self) -> &str {
        "kalshi"
    }

    async fn get_balance(&self) -> Result<i64, VenueError> {
        let v = self
            .request(Method::GET, "/portfolio/balance", None)
            .await?;
        v["balance"]
            .as_i64()
            .ok_or_else(|| VenueError::Malformed("balance missing from response".into()))
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        let v = self
            .request(Method::GET, "/portfolio/positions", None)
            .await?;
        let positions = v["market_positions"]
            .as_array()
            .ok_or_else(|| VenueError::Malformed("market_positions missing".into()))?;
        Ok(positions
            .iter()
            .filter_map(|p| {
                Some(VenuePosition {
                    ticker: p["ticker"].as_str()?.to_string(),
                    position: p["position"].as_i64().unwrap_or(0),
                })
            })
            .collect())
    }

    async fn get_events(&self, series_ticker: &str) -> Result<Vec<VenueEvent>, VenueError> {
        let path = format!(
            "/events?series_ticker={}&status=open&with_nested_markets=true&limit=200",
            series_ticker
        );
        let v = self.request(Method::GET, &path, None).await?;
        let events = v["events"]
            .as_array()
            .ok_or_else(|| VenueError::Malformed("events missing".into()))?;

        Ok(events
            .iter()
            .filter_map(|e| {
                let event_ticker = e["event_ticker"].as_str()?.to_string();
                let markets = e["markets"]
                    .as_array()
                    .map(|ms| {
                        ms.iter()
                            .filter_map(|m| parse_market(m, &event_ticker, series_ticker))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(VenueEvent {
                    event_ticker,
                    series: series_ticker.to_string(),
                    title: e["title"].as_str().unwrap_or("").to_string(),
                    sub_title: e["sub_title"].as_str().unwrap_or("").to_string(),
                    markets,
                })
            })
            .collect())
    }

    async fn get_market(&self, ticker: &str) -> Result<VenueMarket, VenueError> {
        let v = self
            .request(Method::GET, &format!("/markets/{}", ticker), None)
            .await?;
        let market = if v["market"].is_object() {
            &v["market"]
        } else {
            &v
        };
        parse_market(
            market,
            super::extract_event_ticker(ticker),
            series_of(ticker),
        )
        .ok_or_else(|| VenueError::Malformed(format!("market {} missing fields", ticker)))
    }

    async fn create_order(&self, order: &OrderRequest) -> Result<OrderConfirmation, VenueError> {
        let v = self
            .request(Method::POST, "/portfolio/orders", Some(order_body(order)))
            .await?;
        let order_obj = if v["order"].is_object() { &v["order"] } else { &v };
        let order_id = order_obj["order_id"]
            .as_str()
            .ok_or_else(|| VenueError::Malformed("order_id missing from response".into()))?
            .to_string();
        Ok(OrderConfirmation { order_id })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        self.request(
            Method::DELETE,
            &format!("/portfolio/orders/{}", order_id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_fills(&self, limit: u32) -> Result<Vec<Fill>, VenueError> {
        let v = self
            .request(Method::GET, &format!("/portfolio/fills?limit={}", limit), None)
            .await?;
        let fills = v["fills"]
            .as_array()
            .ok_or_else(|| VenueError::Malformed("fills missing".into()))?;
        Ok(fills
            .iter()
            .filter_map(|f| {
                Some(Fill {
                    ticker: f["ticker"].as_str()?.to_string(),
                    order_id: f["order_id"].as_str().unwrap_or("").to_string(),
                    count: f["count"].as_i64().unwrap_or(0),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::OrderAction;

    #[test]
    fn order_body_uses_side_specific_price_field() {
        let yes = OrderRequest {
            ticker: "KXNCAAMBGAME-26FEB27MICHILL-MICH".into(),
            side: Side::Yes,
            action: OrderAction::Buy,
            count: 3,
            price_cents: 41,
        };
        let body = order_body(&yes);
        assert_eq!(body["yes_price"], 41);
        assert_eq!(body["type"], "limit");
        assert_eq!(body["action"], "buy");
        assert!(body.get("no_price").is_none());

        let no = OrderRequest {
            side: Side::No,
            action: OrderAction::Sell,
            price_cents: 1,
            ..yes
        };
        let body = order_body(&no);
        assert_eq!(body["no_price"], 1);
        assert_eq!(body["action"], "sell");
    }

    #[test]
    fn signature_covers_path_without_query() {
        let client = KalshiClient::new(
            "https://api.elections.kalshi.com",
            Some("key".into()),
            Some("secret".into()),
        )
        .unwrap();
        let with_query = client
            .sign("1700000000000", &Method::GET, "/trade-api/v2/portfolio/fills?limit=20")
            .unwrap();
        let without = client
            .sign("1700000000000", &Method::GET, "/trade-api/v2/portfolio/fills")
            .unwrap();
        assert_eq!(with_query, without);
    }

    #[test]
    fn unsigned_without_secret() {
        let client =
            KalshiClient::new("https://api.elections.kalshi.com", None, None).unwrap();
        assert!(client
            .sign("1700000000000", &Method::GET, "/trade-api/v2/markets")
            .is_none());
    }

    #[test]
    fn base_url_prefix_is_stripped() {
        let client = KalshiClient::new(
            "https://api.elections.kalshi.com/trade-api/v2",
            None,
            None,
        )
        .unwrap();
        assert_eq!(client.host, "https://api.elections.kalshi.com");
    }

    #[test]
    fn parses_market_fields_and_filters_zero_prices() {
        let value = serde_json::json!({
            "ticker": "KXNCAAMBGAME-26FEB27MICHILL-MICH",
            "subtitle": "Michigan wins",
            "yes_bid": 44,
            "yes_ask": 0,
            "last_price": 46,
            "volume": 1200,
            "open_interest": 300,
            "status": "active"
        });
        let market = parse_market(&value, "KXNCAAMBGAME-26FEB27MICHILL", "KXNCAAMBGAME").unwrap();
        assert_eq!(market.yes_bid, Some(44));
        assert_eq!(market.yes_ask, None);
        assert_eq!(market.last_price, Some(46));
        assert_eq!(market.series, "KXNCAAMBGAME");
    }
}
