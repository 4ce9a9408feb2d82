//! ESPN hidden scoreboard API client for live college basketball.
//!
//! The scoreboard endpoint (with `groups=50`) covers all of Division 1, not
//! just the featured slate, and carries DraftKings lines per competition:
//! the pre-game spread and total feed the fair-value model's drift and the
//! total-market variant.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{FeedError, GameFeed};
use crate::store::models::GameState;

pub struct EspnScoreboard {
    http: Client,
    scoreboard_url: String,
}

impl EspnScoreboard {
    pub fn new(scoreboard_url: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(EspnScoreboard {
            http,
            scoreboard_url: scoreboard_url.to_string(),
        })
    }
}

#[async_trait]
impl GameFeed for EspnScoreboard {
    async fn fetch_live_games(&self) -> Result<Vec<GameState>, FeedError> {
        let resp = self.http.get(&self.scoreboard_url).send().await?;
        if !resp.status().is_success() {
            return Err(FeedError::Malformed(format!(
                "scoreboard returned {}",
                resp.status()
            )));
        }
        let payload: Value = resp.json().await?;

        let events = payload["events"]
            .as_array()
            .ok_or_else(|| FeedError::Malformed("missing events array".into()))?;

        let mut games = Vec::new();
        for event in events {
            match parse_game(event) {
                Some(game) if game_is_live(event) => games.push(game),
                Some(_) => {}
                None => debug!("Skipping unparseable scoreboard event"),
            }
        }
        Ok(games)
    }

    fn name(&self) -> &str {
        "espn-scoreboard"
    }
}

fn game_is_live(event: &Value) -> bool {
    event["competitions"][0]["status"]["type"]["state"].as_str() == Some("in")
}

/// Parse one scoreboard event into a `GameState` snapshot. Returns `None`
/// for events missing the two-competitor shape rather than erroring the
/// whole poll.
pub fn parse_game(event: &Value) -> Option<GameState> {
    let competition = event["competitions"].as_array()?.first()?;
    let competitors = competition["competitors"].as_array()?;
    if competitors.len() != 2 {
        return None;
    }

    let mut home = None;
    let mut away = None;
    for c in competitors {
        let team = (
            c["team"]["displayName"].as_str().unwrap_or("").to_string(),
            c["team"]["abbreviation"]
                .as_str()
                .unwrap_or("")
                .to_uppercase(),
            parse_score(&c["score"]),
        );
        if c["homeAway"].as_str() == Some("home") {
            home = Some(team);
        } else {
            away = Some(team);
        }
    }
    let (home_team, home_abbr, home_score) = home?;
    let (away_team, away_abbr, away_score) = away?;

    let status = &competition["status"];
    let period = status["period"].as_i64().unwrap_or(1) as i32;
    let clock = status["displayClock"].as_str().unwrap_or("0:00").to_string();
    let minutes_remaining = minutes_remaining(&clock, period);

    let (pregame_spread, pregame_total) = parse_odds(competition);

    Some(GameState {
        event_id: event["id"].as_str().unwrap_or("").to_string(),
        name: format!("{} @ {}", away_team, home_team),
        home_team,
        away_team,
        home_abbr,
        away_abbr,
        home_score,
        away_score,
        period,
        clock,
        minutes_remaining,
        lead: home_score - away_score,
        pregame_spread,
        pregame_total,
        fetched_at: Utc::now(),
    })
}

fn parse_score(value: &Value) -> i32 {
    match value {
        Value::String(s) => s.parse().unwrap_or(0),
        Value::Number(n) => n.as_i64().unwrap_or(0) as i32,
        _ => 0,
    }
}

/// Minutes of game time remaining from the display clock and period.
/// Two 20-minute halves; overtime periods count only their own clock.
pub fn minutes_remaining(clock: &str, period: i32) -> f64 {
    let clock_minutes = match clock.split_once(':') {
        Some((m, s)) => {
            let mins: f64 = m.trim().parse().unwrap_or(0.0);
            let secs: f64 = s.trim().parse().unwrap_or(0.0);
            mins + secs / 60.0
        }
        None => 0.0,
    };
    if period == 1 {
        20.0 + clock_minutes
    } else {
        clock_minutes
    }
}

/// Extract the DraftKings pre-game lines. Returns the spread home-relative
/// (positive = home favored) and the over/under total.
fn parse_odds(competition: &Value) -> (f64, Option<f64>) {
    let Some(odds) = competition["odds"].as_array().and_then(|o| o.first()) else {
        return (0.0, None);
    };

    let pregame_total = odds["overUnder"].as_f64();

    // Preferred: the explicit home point-spread line (negative = favored).
    if let Some(line) = odds["pointSpread"]["home"]["close"]["line"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| odds["pointSpread"]["home"]["close"]["line"].as_f64())
    {
        return (-line, pregame_total);
    }

    // Fallback: the favorite-relative spread value plus the favorite flag.
    if let Some(spread) = odds["spread"].as_f64() {
        let away_favored = odds["awayTeamOdds"]["favorite"].as_bool().unwrap_or(false);
        let home_spread = if away_favored { spread } else { -spread };
        return (-home_spread, pregame_total);
    }

    (0.0, pregame_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn event(state: &str, period: i64, clock: &str, odds: Value) -> Value {
        json!({
            "id": "401700123",
            "competitions": [{
                "status": {
                    "type": { "state": state },
                    "period": period,
                    "displayClock": clock
                },
                "competitors": [
                    {
                        "homeAway": "home",
                        "score": "55",
                        "team": { "displayName": "Michigan Wolverines", "abbreviation": "MICH" }
                    },
                    {
                        "homeAway": "away",
                        "score": "50",
                        "team": { "displayName": "Illinois Fighting Illini", "abbreviation": "ILL" }
                    }
                ],
                "odds": odds
            }]
        })
    }

    #[test]
    fn parses_live_game_fields() {
        let ev = event("in", 2, "12:30", json!([]));
        let game = parse_game(&ev).expect("should parse");
        assert_eq!(game.event_id, "401700123");
        assert_eq!(game.name, "Illinois Fighting Illini @ Michigan Wolverines");
        assert_eq!(game.home_abbr, "MICH");
        assert_eq!(game.lead, 5);
        assert_relative_eq!(game.minutes_remaining, 12.5);
    }

    #[test]
    fn first_half_clock_adds_second_half() {
        assert_relative_eq!(minutes_remaining("15:00", 1), 35.0);
        assert_relative_eq!(minutes_remaining("0:45", 2), 0.75);
        // Overtime: only its own clock remains.
        assert_relative_eq!(minutes_remaining("3:00", 3), 3.0);
    }

    #[test]
    fn spread_is_home_relative() {
        // Home line -6.5 means home favored by 6.5.
        let ev = event(
            "in",
            2,
            "10:00",
            json!([{ "pointSpread": { "home": { "close": { "line": "-6.5" } } },
                     "overUnder": 145.5 }]),
        );
        let game = parse_game(&ev).unwrap();
        assert_relative_eq!(game.pregame_spread, 6.5);
        assert_eq!(game.pregame_total, Some(145.5));
    }

    #[test]
    fn fallback_spread_uses_favorite_flag() {
        let ev = event(
            "in",
            2,
            "10:00",
            json!([{ "spread": 4.0, "awayTeamOdds": { "favorite": true } }]),
        );
        let game = parse_game(&ev).unwrap();
        // Away favored by 4: home-relative expectation is -4.
        assert_relative_eq!(game.pregame_spread, -4.0);
    }

    #[test]
    fn missing_odds_defaults_to_pickem() {
        let ev = event("in", 1, "20:00", json!([]));
        let game = parse_game(&ev).unwrap();
        assert_relative_eq!(game.pregame_spread, 0.0);
        assert_eq!(game.pregame_total, None);
    }
}
