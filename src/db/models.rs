use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A game as listed in the season schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    /// Stable identifier used by the REST API
    pub game_uuid: String,
    /// Numeric identifier used by the live feed
    #[serde(default)]
    pub game_id: Option<i64>,
    #[serde(default)]
    pub season: String,
    pub home_team_code: String,
    pub away_team_code: String,
    #[serde(default)]
    pub home_team_result: i32,
    #[serde(default)]
    pub away_team_result: i32,
    pub start_date_time: DateTime<Utc>,
    /// Set once the game is final; games are never removed from a season
    #[serde(default)]
    pub played: bool,
}

impl Game {
    /// Not played yet and scheduled to start no later than `now + lookahead`.
    pub fn in_live_window(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        !self.played && self.start_date_time <= now + lookahead
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GameState {
    #[default]
    NotStarted,
    Ongoing,
    Intermission,
    OverTime,
    ShootOut,
    GameEnded,
}

impl GameState {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "NotStarted" => Some(GameState::NotStarted),
            "Ongoing" => Some(GameState::Ongoing),
            "Intermission" => Some(GameState::Intermission),
            "OverTime" => Some(GameState::OverTime),
            "ShootOut" => Some(GameState::ShootOut),
            "GameEnded" => Some(GameState::GameEnded),
            _ => None,
        }
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Aggregated counters for one period or for the whole game.
/// Absent fields are zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeriodRecap {
    pub home_g: i32,
    pub away_g: i32,
    /// Penalty minutes
    pub home_pim: i32,
    pub away_pim: i32,
    /// Power-play goals
    pub home_ppg: i32,
    pub away_ppg: i32,
    /// Shots on goal
    pub home_sog: i32,
    pub away_sog: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameRecaps {
    pub game_recap: Option<PeriodRecap>,
    #[serde(rename = "0")]
    pub period0: Option<PeriodRecap>,
    #[serde(rename = "1")]
    pub period1: Option<PeriodRecap>,
    #[serde(rename = "2")]
    pub period2: Option<PeriodRecap>,
    #[serde(rename = "3")]
    pub period3: Option<PeriodRecap>,
    #[serde(rename = "4")]
    pub period4: Option<PeriodRecap>,
}

impl GameRecaps {
    /// The most advanced period that has a recap, checking 4 down to 0.
    pub fn current_period(&self) -> Option<i32> {
        [
            (4, &self.period4),
            (3, &self.period3),
            (2, &self.period2),
            (1, &self.period1),
            (0, &self.period0),
        ]
        .into_iter()
        .find(|(_, recap)| recap.is_some())
        .map(|(n, _)| n)
    }

    fn game(&self) -> PeriodRecap {
        self.game_recap.clone().unwrap_or_default()
    }
}

/// Cumulative per-game statistics for one rostered player.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    #[serde(default)]
    pub player_id: i64,
    #[serde(default)]
    pub jersey: Option<u32>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// Goals
    #[serde(default)]
    pub g: i32,
    /// Assists
    #[serde(default)]
    pub a: i32,
}

impl PlayerStats {
    pub fn to_player_ref(&self) -> PlayerRef {
        PlayerRef {
            jersey: self.jersey,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

/// Full polled state of one game (the snapshot compared between cycles).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStats {
    pub game_uuid: String,
    pub home_team_code: String,
    pub away_team_code: String,
    #[serde(default)]
    pub game_state: GameState,
    #[serde(default)]
    pub recaps: GameRecaps,
    #[serde(default)]
    pub home_players: Vec<PlayerStats>,
    #[serde(default)]
    pub away_players: Vec<PlayerStats>,
}

impl GameStats {
    pub fn home_score(&self) -> i32 {
        self.recaps.game().home_g
    }

    pub fn away_score(&self) -> i32 {
        self.recaps.game().away_g
    }

    pub fn home_power_play_goals(&self) -> i32 {
        self.recaps.game().home_ppg
    }

    pub fn away_power_play_goals(&self) -> i32 {
        self.recaps.game().away_ppg
    }

    pub fn current_period(&self) -> Option<i32> {
        self.recaps.current_period()
    }

    /// Final only when the game has ended with a decided score.
    ///
    /// A tie at `GameEnded` is read as a transient report and the game stays
    /// unplayed. A genuine tied final cannot be told apart from that case.
    pub fn is_played(&self) -> bool {
        self.game_state == GameState::GameEnded && self.home_score() != self.away_score()
    }

    pub fn is_live(&self) -> bool {
        self.game_state != GameState::NotStarted && !self.is_played()
    }
}

/// One row of the league table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub team_code: String,
    #[serde(default)]
    pub rank: i32,
    #[serde(default)]
    pub games_played: i32,
    #[serde(default)]
    pub points: i32,
}

// ── Canonical events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    GameStart,
    GameEnd,
    Goal,
    Penalty,
    PeriodStart,
    PeriodEnd,
}

impl EventType {
    /// Types pushed as alerts. The rest only refresh live-session content.
    pub fn is_notify_worthy(self) -> bool {
        matches!(self, EventType::GameStart | EventType::GameEnd | EventType::Goal)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub jersey: Option<u32>,
    pub first_name: String,
    pub last_name: String,
}

impl fmt::Display for PlayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.jersey {
            Some(n) => write!(f, "#{} {} {}", n, self.first_name, self.last_name),
            None => write!(f, "{} {}", self.first_name, self.last_name),
        }
    }
}

/// Context carried by every canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInfo {
    pub game_uuid: String,
    pub home_team_code: String,
    pub away_team_code: String,
    pub home_result: i32,
    pub away_result: i32,
    pub period: i32,
    #[serde(default)]
    pub game_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    GameStart,
    GameEnd,
    PeriodStart,
    PeriodEnd,
    Goal {
        team_code: Option<String>,
        scorer: Option<PlayerRef>,
        is_power_play: bool,
        team_advantage: Option<String>,
    },
    Penalty {
        team_code: Option<String>,
        player: Option<PlayerRef>,
        duration: Option<String>,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Feed,
    Snapshot,
}

/// A deduplicated, typed game occurrence. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    /// Feed `eventId`, or a deterministic key for snapshot-derived events
    pub id: String,
    pub revision: i64,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub info: EventInfo,
    pub kind: EventKind,
}

impl CanonicalEvent {
    pub fn event_type(&self) -> EventType {
        match self.kind {
            EventKind::GameStart => EventType::GameStart,
            EventKind::GameEnd => EventType::GameEnd,
            EventKind::PeriodStart => EventType::PeriodStart,
            EventKind::PeriodEnd => EventType::PeriodEnd,
            EventKind::Goal { .. } => EventType::Goal,
            EventKind::Penalty { .. } => EventType::Penalty,
        }
    }

    pub fn game_uuid(&self) -> &str {
        &self.info.game_uuid
    }

    /// Key under which the feed and snapshot diffing describe the same
    /// occurrence. Penalties only come from the feed and have none.
    ///
    /// A goal is keyed by the scoring side and that side's new tally, so two
    /// goals seen in one poll interval stay distinct whatever order the feed
    /// reported them in. Without a recognised team code it falls back to the
    /// full score.
    pub fn equivalence_key(&self) -> Option<String> {
        let info = &self.info;
        match &self.kind {
            EventKind::GameStart => Some("start".to_string()),
            EventKind::GameEnd => Some("end".to_string()),
            EventKind::PeriodStart => Some(format!("period-start:{}", info.period)),
            EventKind::PeriodEnd => Some(format!("period-end:{}", info.period)),
            EventKind::Goal { team_code, .. } => Some(match team_code.as_deref() {
                Some(team) if team == info.home_team_code => {
                    format!("goal:home:{}", info.home_result)
                }
                Some(team) if team == info.away_team_code => {
                    format!("goal:away:{}", info.away_result)
                }
                _ => format!("goal:{}-{}", info.home_result, info.away_result),
            }),
            EventKind::Penalty { .. } => None,
        }
    }
}

// ── Subscribers ───────────────────────────────────────────────────────────────

/// Notification target following one or more teams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamSubscriber {
    pub token: String,
    pub teams: Vec<String>,
}

/// Per-game live session. Ending one removes it from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSession {
    pub token: String,
    pub game_uuid: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subscriber {
    Team(TeamSubscriber),
    LiveSession(LiveSession),
}

impl Subscriber {
    pub fn token(&self) -> &str {
        match self {
            Subscriber::Team(t) => &t.token,
            Subscriber::LiveSession(s) => &s.token,
        }
    }

    /// Whether this subscriber should hear about `event` at all.
    pub fn wants(&self, event: &CanonicalEvent) -> bool {
        match self {
            Subscriber::Team(t) => {
                event.event_type().is_notify_worthy()
                    && t.teams.iter().any(|team| {
                        team == &event.info.home_team_code || team == &event.info.away_team_code
                    })
            }
            Subscriber::LiveSession(s) => s.game_uuid == event.info.game_uuid,
        }
    }
}
