use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

mod config;
mod engine;
mod exec;
mod feed;
mod learner;
mod model;
mod runner;
mod status;
mod store;
mod venue;

use config::Config;
use feed::{EspnScoreboard, GameFeed};
use learner::AnalyzerParams;
use runner::Runner;
use store::Database;
use venue::{KalshiClient, Venue};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let store = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    // Offline mode: run the calibration pass for one past session and exit.
    if let Some(date_str) = &config.analyze {
        let date = date_str
            .parse()
            .context("--analyze expects a YYYY-MM-DD session date")?;
        let params = AnalyzerParams {
            paper_strength_floor: config.paper_strength_floor,
            paper_hold_secs: config.paper_hold_secs,
            game_length_min: config.game_length_min,
            current_sigma: config.model_sigma,
            current_min_edge: config.min_entry_edge,
        };
        match learner::run_session_analysis(&store, date, params)? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => info!("No session data for {}", date),
        }
        return Ok(());
    }

    if config.dry_run {
        info!("DRY RUN mode - no real orders will be placed");
    } else {
        info!("LIVE mode - real orders WILL be placed on Kalshi");
    }

    let venue: Arc<dyn Venue> = Arc::new(KalshiClient::new(
        &config.kalshi_base_url,
        config.kalshi_api_key_id.clone(),
        config.kalshi_api_secret.clone(),
    )?);
    let feed: Arc<dyn GameFeed> = Arc::new(EspnScoreboard::new(&config.espn_scoreboard_url)?);

    // Status API in its own task.
    let app = status::router(status::AppState {
        store: store.clone(),
        dry_run: config.dry_run,
        tz_offset_hours: config.session_tz_offset_hours,
        wake_hour: config.session_wake_hour,
        sleep_hour: config.session_sleep_hour,
    });
    let addr: SocketAddr = config.status_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status API listening on http://{}", addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Status server failed: {}", e);
        }
    });

    // Cooperative shutdown: checked once per control-loop iteration.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    Runner::new(config, store, feed, venue).run(shutdown_rx).await;
    info!("Shutdown complete");
    Ok(())
}
