use chrono::Utc;

use crate::db::models::{
    CanonicalEvent, EventInfo, EventKind, EventSource, GameStats, PlayerRef, PlayerStats,
};

/// Compare two statistics snapshots of the same game and return the events
/// that happened in between. Pure; the rules are independent and several can
/// fire in one call.
///
/// With no previous snapshot only the game-start rule is evaluated.
///
/// A goal scored right around a state transition can be missed here (the
/// game may already read as ended). The live feed covers that gap.
pub fn diff(old: Option<&GameStats>, updated: &GameStats) -> Vec<CanonicalEvent> {
    let mut events = Vec::new();

    let was_live = old.is_some_and(|o| o.is_live());
    if !was_live && updated.is_live() {
        events.push(event(updated, "game-start".to_string(), EventKind::GameStart));
    }

    let Some(old) = old else {
        return events;
    };

    if updated.home_score() > old.home_score() {
        events.push(goal(
            updated,
            "home",
            updated.home_score(),
            &updated.home_team_code,
            scorer(&old.home_players, &updated.home_players),
            updated.home_power_play_goals() > old.home_power_play_goals(),
        ));
    }
    if updated.away_score() > old.away_score() {
        events.push(goal(
            updated,
            "away",
            updated.away_score(),
            &updated.away_team_code,
            scorer(&old.away_players, &updated.away_players),
            updated.away_power_play_goals() > old.away_power_play_goals(),
        ));
    }

    if updated.current_period() != old.current_period() {
        if let Some(period) = updated.current_period() {
            events.push(event(
                updated,
                format!("period-start-{}", period),
                EventKind::PeriodStart,
            ));
        }
    }

    if !old.is_played() && updated.is_played() {
        events.push(event(updated, "game-end".to_string(), EventKind::GameEnd));
    }

    events
}

/// Goal ids name the side and its new tally, so a home and an away goal
/// in the same interval never collide.
fn goal(
    updated: &GameStats,
    side: &str,
    tally: i32,
    team_code: &str,
    scorer: Option<PlayerRef>,
    is_power_play: bool,
) -> CanonicalEvent {
    let id = format!("goal-{}-{}", side, tally);
    event(
        updated,
        id,
        EventKind::Goal {
            team_code: Some(team_code.to_string()),
            scorer,
            is_power_play,
            team_advantage: None,
        },
    )
}

fn event(updated: &GameStats, id: String, kind: EventKind) -> CanonicalEvent {
    CanonicalEvent {
        id,
        revision: 0,
        timestamp: Utc::now(),
        source: EventSource::Snapshot,
        info: EventInfo {
            game_uuid: updated.game_uuid.clone(),
            home_team_code: updated.home_team_code.clone(),
            away_team_code: updated.away_team_code.clone(),
            home_result: updated.home_score(),
            away_result: updated.away_score(),
            period: updated.current_period().unwrap_or(0),
            game_time: None,
        },
        kind,
    }
}

/// First player whose goal count went up since `old`.
fn scorer(old: &[PlayerStats], updated: &[PlayerStats]) -> Option<PlayerRef> {
    updated
        .iter()
        .find(|p| {
            let before = old
                .iter()
                .find(|o| same_player(o, p))
                .map(|o| o.g)
                .unwrap_or(0);
            p.g > before
        })
        .map(PlayerStats::to_player_ref)
}

fn same_player(a: &PlayerStats, b: &PlayerStats) -> bool {
    if a.player_id != 0 || b.player_id != 0 {
        a.player_id == b.player_id
    } else {
        a.jersey == b.jersey && a.last_name == b.last_name
    }
}
