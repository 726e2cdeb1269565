//! Maps raw live-feed events onto canonical events.
//!
//! Feed events often lack context (team codes, the current score). That is
//! filled in from a short-lived per-game cache of the latest feed report and
//! from the schedule held by the `GameSnapshotStore`.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::snapshots::GameSnapshotStore;
use crate::db::models::{CanonicalEvent, EventInfo, EventKind, EventSource, PlayerRef};
use crate::error::FeedError;

/// One raw event as sent on a game channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFeedEvent {
    /// Unique per logical occurrence within a game
    #[serde(deserialize_with = "string_or_number")]
    pub event_id: String,
    /// Bumped when the provider corrects an event
    #[serde(default)]
    pub revision: i64,
    pub game_id: i64,
    #[serde(default)]
    pub period: i32,
    #[serde(default)]
    pub gametime: Option<String>,
    pub class: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub extra: Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoalExtra {
    /// "<jersey> <first> <last...>"
    pub scorer_long: String,
    /// Home score after the goal, first element
    pub home_forward: Vec<i32>,
    /// Away score after the goal, first element
    pub home_against: Vec<i32>,
    pub team_advantage: Option<String>,
    pub team: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PenaltyExtra {
    pub team: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeriodExtra {
    pub game_status: String,
}

/// Class-specific part of a raw event.
#[derive(Debug, Clone)]
pub enum FeedBody {
    Goal(GoalExtra),
    Penalty(PenaltyExtra),
    Period(PeriodExtra),
    Shot,
    ShotBlocked,
    ShotIron,
    ShotWide,
    Timeout,
    GoalkeeperEvent,
    ShootoutPenaltyShot,
}

impl RawFeedEvent {
    pub fn body(&self) -> Result<FeedBody, FeedError> {
        Ok(match self.class.as_str() {
            "Goal" => FeedBody::Goal(self.extra()?),
            "Penalty" => FeedBody::Penalty(self.extra()?),
            "Period" => FeedBody::Period(self.extra()?),
            "Shot" => FeedBody::Shot,
            "ShotBlocked" => FeedBody::ShotBlocked,
            "ShotIron" => FeedBody::ShotIron,
            "ShotWide" => FeedBody::ShotWide,
            "Timeout" => FeedBody::Timeout,
            "GoalkeeperEvent" => FeedBody::GoalkeeperEvent,
            "ShootoutPenaltyShot" => FeedBody::ShootoutPenaltyShot,
            other => return Err(FeedError::UnknownClass(other.to_string())),
        })
    }

    fn extra<T: serde::de::DeserializeOwned>(&self) -> Result<T, FeedError> {
        let extra = if self.extra.is_null() {
            Value::Object(Default::default())
        } else {
            self.extra.clone()
        };
        serde_json::from_value(extra).map_err(|source| FeedError::BadExtra {
            class: self.class.clone(),
            source,
        })
    }
}

/// Score/period/state summary of one game, sent in batched `GameReport`
/// envelopes (always the first frame of a new connection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameReport {
    pub game_id: i64,
    #[serde(default)]
    pub home_team_code: Option<String>,
    #[serde(default)]
    pub away_team_code: Option<String>,
    #[serde(default)]
    pub home_score: i32,
    #[serde(default)]
    pub away_score: i32,
    #[serde(default)]
    pub period: i32,
    #[serde(default)]
    pub game_state: Option<String>,
    #[serde(default)]
    pub gametime: Option<String>,
}

struct CachedReport {
    report: GameReport,
    received_at: Instant,
}

pub struct FeedNormalizer {
    snapshots: Arc<GameSnapshotStore>,
    reports: Mutex<HashMap<i64, CachedReport>>,
    report_ttl: Duration,
}

impl FeedNormalizer {
    pub fn new(snapshots: Arc<GameSnapshotStore>, report_ttl: Duration) -> Self {
        FeedNormalizer {
            snapshots,
            reports: Mutex::new(HashMap::new()),
            report_ttl,
        }
    }

    pub fn record_report(&self, report: GameReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.insert(
                report.game_id,
                CachedReport {
                    report,
                    received_at: Instant::now(),
                },
            );
        }
    }

    /// Latest report for `game_id`, if it is younger than the TTL.
    pub fn latest_report(&self, game_id: i64) -> Option<GameReport> {
        let mut reports = self.reports.lock().ok()?;
        match reports.get(&game_id) {
            Some(cached) if cached.received_at.elapsed() <= self.report_ttl => {
                Some(cached.report.clone())
            }
            Some(_) => {
                reports.remove(&game_id);
                None
            }
            None => None,
        }
    }

    /// Map one raw event. `None` means "not a canonical event": dropped class,
    /// unmapped game, or an unparseable payload (logged).
    pub async fn normalize(&self, game_id: i64, raw: &RawFeedEvent) -> Option<CanonicalEvent> {
        let Some(game_uuid) = self.snapshots.game_uuid(game_id).await else {
            warn!(
                "[LiveFeed] Event {} for unknown game id {} dropped",
                raw.event_id, game_id
            );
            return None;
        };

        let body = match raw.body() {
            Ok(body) => body,
            Err(e) => {
                warn!("[LiveFeed] Event {} dropped: {}", raw.event_id, e);
                return None;
            }
        };

        let mut info = self.context(game_id, &game_uuid).await;
        info.period = raw.period;
        info.game_time = raw.gametime.clone();

        let kind = match body {
            FeedBody::Goal(extra) => {
                if let Some(home) = extra.home_forward.first() {
                    info.home_result = *home;
                }
                if let Some(away) = extra.home_against.first() {
                    info.away_result = *away;
                }
                let team_advantage = extra.team_advantage.filter(|s| !s.is_empty());
                EventKind::Goal {
                    team_code: extra.team,
                    scorer: parse_player(&extra.scorer_long),
                    is_power_play: team_advantage
                        .as_deref()
                        .is_some_and(|adv| adv.starts_with("PP")),
                    team_advantage,
                }
            }
            FeedBody::Penalty(_) if raw.description == "Penalty shot" => return None,
            FeedBody::Penalty(extra) => match parse_penalty(&raw.description) {
                Some((player, duration, reason)) => EventKind::Penalty {
                    team_code: extra.team,
                    player: Some(player),
                    duration: Some(duration),
                    reason,
                },
                None => EventKind::Penalty {
                    team_code: extra.team,
                    player: None,
                    duration: None,
                    reason: raw.description.clone(),
                },
            },
            FeedBody::Period(extra) => {
                match (raw.period, extra.game_status.as_str()) {
                    (0, "Ongoing") => EventKind::GameStart,
                    (0, "GameEnded") => EventKind::GameEnd,
                    (p, "Playing") if p > 0 => EventKind::PeriodStart,
                    (p, "Finished") if p > 0 => EventKind::PeriodEnd,
                    (p, status) => {
                        debug!("[LiveFeed] Ignoring period {} status '{}'", p, status);
                        return None;
                    }
                }
            }
            FeedBody::Shot
            | FeedBody::ShotBlocked
            | FeedBody::ShotIron
            | FeedBody::ShotWide
            | FeedBody::Timeout
            | FeedBody::GoalkeeperEvent
            | FeedBody::ShootoutPenaltyShot => return None,
        };

        Some(CanonicalEvent {
            id: raw.event_id.clone(),
            revision: raw.revision,
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            source: EventSource::Feed,
            info,
            kind,
        })
    }

    /// Team codes and current score from the freshest source available.
    async fn context(&self, game_id: i64, game_uuid: &str) -> EventInfo {
        let game = self.snapshots.game(game_uuid).await;
        let report = self.latest_report(game_id);

        let (mut home_code, mut away_code, mut home, mut away) = match &game {
            Some(g) => (
                g.home_team_code.clone(),
                g.away_team_code.clone(),
                g.home_team_result,
                g.away_team_result,
            ),
            None => (String::new(), String::new(), 0, 0),
        };
        if let Some(r) = report {
            home_code = r.home_team_code.unwrap_or(home_code);
            away_code = r.away_team_code.unwrap_or(away_code);
            home = r.home_score;
            away = r.away_score;
        }

        EventInfo {
            game_uuid: game_uuid.to_string(),
            home_team_code: home_code,
            away_team_code: away_code,
            home_result: home,
            away_result: away,
            period: 0,
            game_time: None,
        }
    }
}

/// "<jersey> <first> <last...>" → player.
pub fn parse_player(text: &str) -> Option<PlayerRef> {
    let mut parts = text.split_whitespace();
    let jersey: u32 = parts.next()?.parse().ok()?;
    let first_name = parts.next()?.to_string();
    let last_name = parts.collect::<Vec<_>>().join(" ");
    if last_name.is_empty() {
        return None;
    }
    Some(PlayerRef {
        jersey: Some(jersey),
        first_name,
        last_name,
    })
}

/// "<jersey> <first> <last> utvisas <duration>, <reason>" → (player, duration, reason).
pub fn parse_penalty(description: &str) -> Option<(PlayerRef, String, String)> {
    let (who, rest) = description.split_once(" utvisas ")?;
    let player = parse_player(who)?;
    let (duration, reason) = rest.split_once(", ")?;
    let (duration, reason) = (duration.trim(), reason.trim());
    if duration.is_empty() || reason.is_empty() {
        return None;
    }
    Some((player, duration.to_string(), reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EventType;
    use crate::db::Database;
    use crate::live_scores::snapshots::tests::{game, ScriptedProvider};
    use serde_json::json;

    async fn normalizer() -> FeedNormalizer {
        let provider = Arc::new(ScriptedProvider::default());
        let mut g = game("g1", 100, Utc::now());
        g.home_team_result = 1;
        provider.push_season(Some(vec![g]));
        let snapshots = Arc::new(GameSnapshotStore::new(
            provider,
            Database::open(":memory:").unwrap(),
        ));
        snapshots.refresh("2024").await;
        FeedNormalizer::new(snapshots, Duration::from_secs(300))
    }

    fn raw(class: &str, period: i32, description: &str, extra: Value) -> RawFeedEvent {
        serde_json::from_value(json!({
            "eventId": 5,
            "revision": 1,
            "gameId": 100,
            "period": period,
            "gametime": "12:34",
            "class": class,
            "description": description,
            "extra": extra,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn goal_takes_scores_and_scorer_from_extra() {
        let n = normalizer().await;
        let ev = n
            .normalize(
                100,
                &raw(
                    "Goal",
                    2,
                    "",
                    json!({
                        "scorerLong": "21 Joel Lundqvist",
                        "homeForward": [2],
                        "homeAgainst": [0],
                        "teamAdvantage": "PP1",
                        "team": "LHF"
                    }),
                ),
            )
            .await
            .unwrap();

        assert_eq!(ev.id, "5");
        assert_eq!(ev.event_type(), EventType::Goal);
        assert_eq!((ev.info.home_result, ev.info.away_result), (2, 0));
        assert_eq!(ev.info.home_team_code, "LHF");
        assert_eq!(ev.info.period, 2);
        match ev.kind {
            EventKind::Goal {
                scorer,
                is_power_play,
                team_advantage,
                ..
            } => {
                let scorer = scorer.unwrap();
                assert_eq!(scorer.jersey, Some(21));
                assert_eq!(scorer.last_name, "Lundqvist");
                assert!(is_power_play);
                assert_eq!(team_advantage.as_deref(), Some("PP1"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test]
    async fn even_strength_goal_is_not_power_play() {
        let n = normalizer().await;
        let ev = n
            .normalize(
                100,
                &raw("Goal", 1, "", json!({"scorerLong": "7 Anna Berg", "teamAdvantage": "EQ"})),
            )
            .await
            .unwrap();
        assert!(matches!(ev.kind, EventKind::Goal { is_power_play: false, .. }));
        // no homeForward: score falls back to the schedule
        assert_eq!(ev.info.home_result, 1);
    }

    #[tokio::test]
    async fn penalty_shot_is_dropped() {
        let n = normalizer().await;
        assert!(n
            .normalize(100, &raw("Penalty", 1, "Penalty shot", Value::Null))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn penalty_description_is_parsed() {
        let n = normalizer().await;
        let ev = n
            .normalize(
                100,
                &raw("Penalty", 1, "12 Lars Johansson utvisas 2 min, Hooking", Value::Null),
            )
            .await
            .unwrap();
        match ev.kind {
            EventKind::Penalty {
                player,
                duration,
                reason,
                ..
            } => {
                assert_eq!(player.unwrap().first_name, "Lars");
                assert_eq!(duration.as_deref(), Some("2 min"));
                assert_eq!(reason, "Hooking");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test]
    async fn unmatched_penalty_keeps_raw_reason() {
        let n = normalizer().await;
        let ev = n
            .normalize(100, &raw("Penalty", 1, "Bench minor", Value::Null))
            .await
            .unwrap();
        assert!(matches!(
            ev.kind,
            EventKind::Penalty { player: None, ref reason, .. } if reason == "Bench minor"
        ));
    }

    #[tokio::test]
    async fn period_events_follow_the_mapping_table() {
        let n = normalizer().await;
        let cases = [
            (0, "Ongoing", Some(EventType::GameStart)),
            (0, "GameEnded", Some(EventType::GameEnd)),
            (2, "Playing", Some(EventType::PeriodStart)),
            (2, "Finished", Some(EventType::PeriodEnd)),
            (0, "Playing", None),
            (3, "Ongoing", None),
        ];
        for (period, status, expected) in cases {
            let ev = n
                .normalize(100, &raw("Period", period, "", json!({"gameStatus": status})))
                .await;
            assert_eq!(ev.map(|e| e.event_type()), expected, "{} {}", period, status);
        }
    }

    #[tokio::test]
    async fn shots_and_other_classes_are_dropped() {
        let n = normalizer().await;
        for class in [
            "Shot",
            "ShotBlocked",
            "ShotIron",
            "ShotWide",
            "Timeout",
            "GoalkeeperEvent",
            "ShootoutPenaltyShot",
            "SomethingNew",
        ] {
            assert!(n.normalize(100, &raw(class, 1, "", json!({}))).await.is_none());
        }
    }

    #[tokio::test]
    async fn unmapped_game_id_is_dropped() {
        let n = normalizer().await;
        let ev = n
            .normalize(999, &raw("Period", 0, "", json!({"gameStatus": "Ongoing"})))
            .await;
        assert!(ev.is_none());
    }

    #[tokio::test]
    async fn fresh_report_supplies_context() {
        let n = normalizer().await;
        n.record_report(GameReport {
            game_id: 100,
            home_team_code: Some("LHF".into()),
            away_team_code: Some("FBK".into()),
            home_score: 3,
            away_score: 2,
            period: 3,
            game_state: Some("Ongoing".into()),
            gametime: None,
        });
        let ev = n
            .normalize(100, &raw("Penalty", 3, "Too many men", Value::Null))
            .await
            .unwrap();
        assert_eq!((ev.info.home_result, ev.info.away_result), (3, 2));
    }

    #[tokio::test]
    async fn stale_report_is_ignored() {
        let mut n = normalizer().await;
        n.report_ttl = Duration::ZERO;
        n.record_report(GameReport {
            game_id: 100,
            home_team_code: None,
            away_team_code: None,
            home_score: 9,
            away_score: 9,
            period: 3,
            game_state: None,
            gametime: None,
        });
        std::thread::sleep(Duration::from_millis(5));
        assert!(n.latest_report(100).is_none());
    }

    #[test]
    fn parse_player_needs_jersey_and_two_names() {
        let p = parse_player("9 Jan Erik Larsson").unwrap();
        assert_eq!(p.first_name, "Jan");
        assert_eq!(p.last_name, "Erik Larsson");
        assert!(parse_player("Jan Larsson").is_none());
        assert!(parse_player("9 Jan").is_none());
    }
}
