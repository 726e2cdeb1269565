//! Last-known-good season schedules, refreshed by polling.
//!
//! A failed or empty fetch never replaces good data: readers keep getting the
//! previous successful result until the next refresh succeeds. The
//! `game_id → game_uuid` map used by the live feed is built once per season,
//! from the first successful, non-empty schedule.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::normalizer::GameReport;
use super::provider::StatsProvider;
use crate::db::models::{Game, Standing};
use crate::db::Database;

pub struct GameSnapshotStore {
    provider: Arc<dyn StatsProvider>,
    db: Database,
    inner: RwLock<SnapshotState>,
}

#[derive(Default)]
struct SnapshotState {
    /// season → last good schedule
    current: HashMap<String, Vec<Game>>,
    /// season → schedule before the last good one
    previous: HashMap<String, Vec<Game>>,
    /// feed game_id → game_uuid
    id_map: HashMap<i64, String>,
    mapped_seasons: HashSet<String>,
    standings: HashMap<String, Vec<Standing>>,
}

fn season_key(season: &str) -> String {
    format!("season/{}", season)
}

fn standings_key(season: &str) -> String {
    format!("standings/{}", season)
}

impl GameSnapshotStore {
    pub fn new(provider: Arc<dyn StatsProvider>, db: Database) -> Self {
        GameSnapshotStore {
            provider,
            db,
            inner: RwLock::new(SnapshotState::default()),
        }
    }

    /// Seed from the documents written by earlier runs, so stale reads work
    /// before the first successful refresh.
    pub async fn load_persisted(&self, season: &str) -> Result<()> {
        let games: Option<Vec<Game>> = self.db.read(&season_key(season))?;
        let standings: Option<Vec<Standing>> = self.db.read(&standings_key(season))?;

        let mut inner = self.inner.write().await;
        if let Some(games) = games.filter(|g| !g.is_empty()) {
            info!("Loaded {} persisted games for season {}", games.len(), season);
            inner.build_id_map(season, &games);
            inner.current.insert(season.to_string(), games);
        }
        if let Some(standings) = standings {
            inner.standings.insert(season.to_string(), standings);
        }
        Ok(())
    }

    /// Poll the season schedule. Returns the schedule now being served, which
    /// is the previous one when the fetch failed.
    pub async fn refresh(&self, season: &str) -> Vec<Game> {
        let fetched = self.provider.season_games(season).await;

        let mut inner = self.inner.write().await;
        let games = match fetched {
            Some(games) if !games.is_empty() => games,
            Some(_) => {
                warn!("Empty schedule for season {}, keeping previous", season);
                return inner.current.get(season).cloned().unwrap_or_default();
            }
            None => {
                warn!(
                    "No schedule from {} for season {}, serving last good data",
                    self.provider.name(),
                    season
                );
                return inner.current.get(season).cloned().unwrap_or_default();
            }
        };

        if let Err(e) = self.db.write(&season_key(season), &games) {
            warn!("Failed to persist season {}: {:#}", season, e);
        }
        if !inner.mapped_seasons.contains(season) {
            inner.build_id_map(season, &games);
        }
        if let Some(old) = inner.current.insert(season.to_string(), games.clone()) {
            inner.previous.insert(season.to_string(), old);
        }
        games
    }

    pub async fn current(&self, season: &str) -> Vec<Game> {
        self.inner
            .read()
            .await
            .current
            .get(season)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn previous(&self, season: &str) -> Vec<Game> {
        self.inner
            .read()
            .await
            .previous
            .get(season)
            .cloned()
            .unwrap_or_default()
    }

    /// Unplayed games whose start is at or before `now + lookahead`.
    pub async fn live_window(&self, lookahead: Duration, now: DateTime<Utc>) -> Vec<Game> {
        let inner = self.inner.read().await;
        inner
            .current
            .values()
            .flatten()
            .filter(|g| g.in_live_window(now, lookahead))
            .cloned()
            .collect()
    }

    pub async fn game_uuid(&self, game_id: i64) -> Option<String> {
        self.inner.read().await.id_map.get(&game_id).cloned()
    }

    pub async fn game(&self, game_uuid: &str) -> Option<Game> {
        let inner = self.inner.read().await;
        inner
            .current
            .values()
            .flatten()
            .find(|g| g.game_uuid == game_uuid)
            .cloned()
    }

    /// Fold a live-feed report into the matching game. Only scores change;
    /// the played flag belongs to polling.
    pub async fn apply_report(&self, report: &GameReport) -> bool {
        let mut inner = self.inner.write().await;
        let Some(uuid) = inner.id_map.get(&report.game_id).cloned() else {
            return false;
        };
        let Some(game) = inner
            .current
            .values_mut()
            .flatten()
            .find(|g| g.game_uuid == uuid)
        else {
            return false;
        };
        game.home_team_result = report.home_score;
        game.away_team_result = report.away_score;
        debug!(
            "Report applied to {}: {} {}-{} {}",
            uuid, game.home_team_code, game.home_team_result, game.away_team_result, game.away_team_code
        );
        true
    }

    /// Poll the league table; a failure keeps the previous table.
    pub async fn refresh_standings(&self, season: &str) -> Vec<Standing> {
        let fetched = self.provider.standings(season).await;
        let mut inner = self.inner.write().await;
        match fetched {
            Some(table) if !table.is_empty() => {
                if let Err(e) = self.db.write(&standings_key(season), &table) {
                    warn!("Failed to persist standings {}: {:#}", season, e);
                }
                inner.standings.insert(season.to_string(), table.clone());
                table
            }
            _ => inner.standings.get(season).cloned().unwrap_or_default(),
        }
    }

    pub async fn standings(&self, season: &str) -> Vec<Standing> {
        self.inner
            .read()
            .await
            .standings
            .get(season)
            .cloned()
            .unwrap_or_default()
    }
}

impl SnapshotState {
    fn build_id_map(&mut self, season: &str, games: &[Game]) {
        let mut mapped = 0;
        for game in games {
            if let Some(id) = game.game_id {
                self.id_map.insert(id, game.game_uuid.clone());
                mapped += 1;
            }
        }
        self.mapped_seasons.insert(season.to_string());
        info!("Built game id map for season {} ({} games)", season, mapped);
    }
}
