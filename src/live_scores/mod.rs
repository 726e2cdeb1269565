pub mod differ;
pub mod normalizer;
pub mod provider;
pub mod snapshots;
pub mod websocket;

pub use differ::diff;
pub use normalizer::FeedNormalizer;
pub use provider::StatsProvider;
pub use snapshots::GameSnapshotStore;
pub use websocket::{FeedContext, FeedControl, LiveFeed};

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::db::models::{GameState, GameStats};
use crate::events::EventPipeline;

/// Games currently followed by the loop: uuid → last statistics snapshot.
pub type TrackedGames = Arc<RwLock<HashMap<String, Option<GameStats>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Polling,
    Diffing,
    Dispatching,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopPhase::Idle => write!(f, "idle"),
            LoopPhase::Polling => write!(f, "polling"),
            LoopPhase::Diffing => write!(f, "diffing"),
            LoopPhase::Dispatching => write!(f, "dispatching"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub season: String,
    /// Delay between cycles while any game is tracked
    pub active_delay: Duration,
    /// Delay while nothing is tracked, and after a failed cycle
    pub idle_delay: Duration,
    pub lookahead: chrono::Duration,
}

/// Periodic poller: refreshes the schedule, follows games in the live window
/// through their statistics, and owns the feed connection's lifetime.
pub struct GameLoop {
    settings: LoopSettings,
    provider: Arc<dyn StatsProvider>,
    snapshots: Arc<GameSnapshotStore>,
    pipeline: Arc<EventPipeline>,
    feed: Arc<dyn FeedControl>,
    tracked: TrackedGames,
    /// Games already seen played; never tracked again
    finished: HashSet<String>,
    phase: LoopPhase,
}

impl GameLoop {
    pub fn new(
        settings: LoopSettings,
        provider: Arc<dyn StatsProvider>,
        snapshots: Arc<GameSnapshotStore>,
        pipeline: Arc<EventPipeline>,
        feed: Arc<dyn FeedControl>,
    ) -> Self {
        GameLoop {
            settings,
            provider,
            snapshots,
            pipeline,
            feed,
            tracked: Arc::new(RwLock::new(HashMap::new())),
            finished: HashSet::new(),
            phase: LoopPhase::Idle,
        }
    }

    pub fn tracked(&self) -> TrackedGames {
        Arc::clone(&self.tracked)
    }

    /// Run forever. A failed cycle is logged and followed by the idle delay.
    pub async fn run(mut self) {
        info!(
            "Game loop started (season={}, provider={}, active={:?}, idle={:?})",
            self.settings.season,
            self.provider.name(),
            self.settings.active_delay,
            self.settings.idle_delay
        );
        loop {
            let delay = match self.cycle(Utc::now()).await {
                Ok(delay) => delay,
                Err(e) => {
                    error!("Game loop cycle failed while {}: {:#}", self.phase, e);
                    self.phase = LoopPhase::Idle;
                    self.settings.idle_delay
                }
            };
            debug!("Next cycle in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// One poll cycle. Returns the delay before the next one.
    pub async fn cycle(&mut self, now: DateTime<Utc>) -> Result<Duration> {
        let season = self.settings.season.clone();

        self.phase = LoopPhase::Polling;
        self.snapshots.refresh(&season).await;
        self.snapshots.refresh_standings(&season).await;

        let live = self.snapshots.live_window(self.settings.lookahead, now).await;
        let mut new_ids = Vec::new();
        {
            let mut tracked = self.tracked.write().await;
            for game in live {
                if self.finished.contains(&game.game_uuid) || tracked.contains_key(&game.game_uuid) {
                    continue;
                }
                info!(
                    "Tracking {} {} - {} (start {})",
                    game.game_uuid, game.home_team_code, game.away_team_code, game.start_date_time
                );
                new_ids.extend(game.game_id);
                tracked.insert(game.game_uuid, None);
            }
        }

        let uuids = self.tracked_uuids().await;
        if !uuids.is_empty() {
            if !self.feed.is_open() {
                let mut ids = Vec::new();
                for uuid in &uuids {
                    if let Some(id) = self.snapshots.game(uuid).await.and_then(|g| g.game_id) {
                        ids.push(id);
                    }
                }
                self.feed.open(&ids);
            } else if !new_ids.is_empty() {
                self.feed.join(&new_ids);
            }
        }

        let mut left = Vec::new();
        for uuid in uuids {
            self.phase = LoopPhase::Diffing;
            let Some(stats) = self.provider.game_stats(&uuid).await else {
                warn!("No statistics for {}, keeping previous snapshot", uuid);
                continue;
            };
            let previous = self.tracked.read().await.get(&uuid).cloned().flatten();
            let events = diff(previous.as_ref(), &stats);

            self.phase = LoopPhase::Dispatching;
            for event in events {
                self.pipeline.publish(event).await?;
            }

            if stats.game_state == GameState::GameEnded && !stats.is_played() {
                debug!(
                    "Game {} reads ended at a tie {}-{}, still tracked",
                    uuid,
                    stats.home_score(),
                    stats.away_score()
                );
            }
            let scheduled = self.snapshots.game(&uuid).await;
            let played = stats.is_played() || scheduled.as_ref().is_some_and(|g| g.played);
            let mut tracked = self.tracked.write().await;
            if played {
                info!("Game {} is played, no longer tracked", uuid);
                tracked.remove(&uuid);
                self.finished.insert(uuid);
                left.extend(scheduled.and_then(|g| g.game_id));
            } else {
                tracked.insert(uuid, Some(stats));
            }
        }
        self.feed.leave(&left);

        self.phase = LoopPhase::Idle;
        if self.tracked.read().await.is_empty() {
            if self.feed.is_open() {
                info!("No tracked games left, closing live feed");
                self.feed.close();
            }
            Ok(self.settings.idle_delay)
        } else {
            Ok(self.settings.active_delay)
        }
    }

    async fn tracked_uuids(&self) -> Vec<String> {
        let mut uuids: Vec<String> = self.tracked.read().await.keys().cloned().collect();
        uuids.sort();
        uuids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::EventStore;
    use crate::live_scores::differ::tests::snapshot;
    use crate::live_scores::snapshots::tests::{game, ScriptedProvider};
    use crate::notify::dispatcher::tests::RecordingPush;
    use crate::notify::{EventDispatcher, SubscriberRegistry};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingFeed {
        open: Mutex<bool>,
        opened_with: Mutex<Vec<Vec<i64>>>,
        joined: Mutex<Vec<i64>>,
        left: Mutex<Vec<i64>>,
        closes: Mutex<usize>,
    }

    impl FeedControl for RecordingFeed {
        fn is_open(&self) -> bool {
            *self.open.lock().unwrap()
        }

        fn open(&self, game_ids: &[i64]) {
            *self.open.lock().unwrap() = true;
            self.opened_with.lock().unwrap().push(game_ids.to_vec());
        }

        fn join(&self, game_ids: &[i64]) {
            self.joined.lock().unwrap().extend_from_slice(game_ids);
        }

        fn leave(&self, game_ids: &[i64]) {
            self.left.lock().unwrap().extend_from_slice(game_ids);
        }

        fn close(&self) {
            *self.open.lock().unwrap() = false;
            *self.closes.lock().unwrap() += 1;
        }
    }

    struct Harness {
        game_loop: GameLoop,
        provider: Arc<ScriptedProvider>,
        feed: Arc<RecordingFeed>,
        push: Arc<RecordingPush>,
        pipeline: Arc<EventPipeline>,
    }

    fn harness() -> Harness {
        let db = Database::open(":memory:").unwrap();
        let provider = Arc::new(ScriptedProvider::default());
        let snapshots = Arc::new(GameSnapshotStore::new(provider.clone(), db.clone()));
        let registry = SubscriberRegistry::new(db.clone());
        registry.follow_teams("fan", vec!["LHF".into()]).unwrap();
        let push = Arc::new(RecordingPush::default());
        let dispatcher = Arc::new(EventDispatcher::new(push.clone(), registry));
        let pipeline = Arc::new(EventPipeline::new(EventStore::new(db), dispatcher));
        let feed = Arc::new(RecordingFeed::default());
        let settings = LoopSettings {
            season: "2024".into(),
            active_delay: Duration::from_secs(3),
            idle_delay: Duration::from_secs(60),
            lookahead: chrono::Duration::minutes(10),
        };
        Harness {
            game_loop: GameLoop::new(
                settings,
                provider.clone(),
                snapshots,
                pipeline.clone(),
                feed.clone(),
            ),
            provider,
            feed,
            push,
            pipeline,
        }
    }

    fn sent_titles(push: &RecordingPush) -> Vec<String> {
        push.sent.lock().unwrap().iter().map(|m| m.title.clone()).collect()
    }

    #[tokio::test]
    async fn idle_without_live_games() {
        let mut h = harness();
        let now = Utc::now();
        h.provider
            .push_season(Some(vec![game("g1", 1001, now + chrono::Duration::hours(3))]));

        let delay = h.game_loop.cycle(now).await.unwrap();
        assert_eq!(delay, Duration::from_secs(60));
        assert!(!h.feed.is_open());
        assert!(h.game_loop.tracked().read().await.is_empty());
    }

    #[tokio::test]
    async fn follows_a_game_from_start_to_end() {
        let mut h = harness();
        let now = Utc::now();
        h.provider
            .push_season(Some(vec![game("g1", 1001, now - chrono::Duration::minutes(1))]));
        h.provider.push_stats("g1", Some(snapshot(GameState::Ongoing, 0, 0)));
        h.provider.push_stats("g1", Some(snapshot(GameState::Ongoing, 1, 0)));
        h.provider.push_stats("g1", Some(snapshot(GameState::GameEnded, 2, 0)));

        assert_eq!(h.game_loop.cycle(now).await.unwrap(), Duration::from_secs(3));
        assert_eq!(*h.feed.opened_with.lock().unwrap(), vec![vec![1001]]);
        assert_eq!(sent_titles(&h.push), vec!["LHF - FBK"]);

        assert_eq!(h.game_loop.cycle(now).await.unwrap(), Duration::from_secs(3));
        assert_eq!(sent_titles(&h.push).len(), 2);

        // final cycle: goal and end, then the game is dropped and the feed closed
        assert_eq!(h.game_loop.cycle(now).await.unwrap(), Duration::from_secs(60));
        let titles = sent_titles(&h.push);
        assert_eq!(titles.len(), 4);
        assert_eq!(titles[3], "Final: LHF 2 - 0 FBK");
        assert!(h.game_loop.tracked().read().await.is_empty());
        assert_eq!(*h.feed.closes.lock().unwrap(), 1);

        // still unplayed in the schedule, but never tracked again
        assert_eq!(h.game_loop.cycle(now).await.unwrap(), Duration::from_secs(60));
        assert!(h.game_loop.tracked().read().await.is_empty());
        assert_eq!(h.feed.opened_with.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_statistics_keep_the_game_tracked() {
        let mut h = harness();
        let now = Utc::now();
        h.provider
            .push_season(Some(vec![game("g1", 1001, now - chrono::Duration::minutes(1))]));
        h.provider.push_stats("g1", Some(snapshot(GameState::Ongoing, 0, 0)));
        h.provider.push_stats("g1", None);
        h.provider.push_stats("g1", Some(snapshot(GameState::Ongoing, 1, 0)));

        h.game_loop.cycle(now).await.unwrap();
        assert_eq!(h.game_loop.cycle(now).await.unwrap(), Duration::from_secs(3));
        h.game_loop.cycle(now).await.unwrap();

        let history = h.pipeline.store().read("g1").unwrap();
        let ids: Vec<&str> = history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["game-start", "goal-home-1"]);
    }

    #[tokio::test]
    async fn game_entering_window_joins_open_feed() {
        let mut h = harness();
        let now = Utc::now();
        h.provider.push_season(Some(vec![
            game("g1", 1001, now - chrono::Duration::minutes(1)),
            game("g2", 1002, now + chrono::Duration::minutes(30)),
        ]));
        h.provider.push_stats("g1", Some(snapshot(GameState::Ongoing, 0, 0)));
        h.provider.push_stats("g1", Some(snapshot(GameState::Ongoing, 0, 0)));

        h.game_loop.cycle(now).await.unwrap();
        h.game_loop
            .cycle(now + chrono::Duration::minutes(25))
            .await
            .unwrap();

        assert_eq!(h.feed.opened_with.lock().unwrap().len(), 1);
        assert_eq!(*h.feed.joined.lock().unwrap(), vec![1002]);
        assert_eq!(h.game_loop.tracked().read().await.len(), 2);
    }

    #[tokio::test]
    async fn finished_game_leaves_the_feed_while_others_play_on() {
        let mut h = harness();
        let now = Utc::now();
        h.provider.push_season(Some(vec![
            game("g1", 1001, now - chrono::Duration::minutes(1)),
            game("g2", 1002, now - chrono::Duration::minutes(1)),
        ]));
        h.provider.push_stats("g1", Some(snapshot(GameState::Ongoing, 1, 0)));
        h.provider.push_stats("g1", Some(snapshot(GameState::GameEnded, 1, 0)));
        let mut other = snapshot(GameState::Ongoing, 0, 0);
        other.game_uuid = "g2".into();
        h.provider.push_stats("g2", Some(other.clone()));
        h.provider.push_stats("g2", Some(other));

        h.game_loop.cycle(now).await.unwrap();
        assert!(h.feed.left.lock().unwrap().is_empty());

        assert_eq!(h.game_loop.cycle(now).await.unwrap(), Duration::from_secs(3));
        assert_eq!(*h.feed.left.lock().unwrap(), vec![1001]);
        assert!(h.feed.is_open());
        assert_eq!(*h.feed.closes.lock().unwrap(), 0);
    }
}
