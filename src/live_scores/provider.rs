use async_trait::async_trait;

use crate::db::models::{Game, GameStats, Standing};

/// Upstream data the poll loop and the live feed depend on.
///
/// Every method resolves to `None` when the provider returned no data; the
/// caller decides whether stale data stands in.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    /// Full schedule of a season.
    async fn season_games(&self, season: &str) -> Option<Vec<Game>>;

    /// Current statistics snapshot of one game.
    async fn game_stats(&self, game_uuid: &str) -> Option<GameStats>;

    /// League table of a season.
    async fn standings(&self, season: &str) -> Option<Vec<Standing>>;

    /// Token used to authenticate the live feed connection.
    async fn feed_token(&self) -> Option<String>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
