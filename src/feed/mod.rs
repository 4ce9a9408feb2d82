pub mod espn;

pub use espn::EspnScoreboard;

use async_trait::async_trait;

use crate::store::models::GameState;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed feed payload: {0}")]
    Malformed(String),
}

/// Trait every live-state provider must implement. The control loop treats a
/// failure as "no new observations this cycle" and moves on.
#[async_trait]
pub trait GameFeed: Send + Sync {
    /// Snapshot of all currently in-progress games.
    async fn fetch_live_games(&self) -> Result<Vec<GameState>, FeedError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
