use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::db::models::{Game, GameStats};
use crate::events::EventStore;
use crate::live_scores::{GameSnapshotStore, TrackedGames};
use crate::notify::SubscriberRegistry;

#[derive(Clone)]
pub struct AppState {
    pub season: String,
    pub snapshots: Arc<GameSnapshotStore>,
    pub events: EventStore,
    pub registry: SubscriberRegistry,
    pub tracked: TrackedGames,
}

/// Build the status and subscription router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/live", get(live_handler))
        .route("/api/games", get(games_handler))
        .route("/api/games/previous", get(previous_games_handler))
        .route("/api/games/:uuid/events", get(game_events_handler))
        .route("/api/standings", get(standings_handler))
        .route("/api/subscriptions", post(follow_teams_handler))
        .route("/api/subscriptions/:token", delete(unsubscribe_handler))
        .route("/api/live-sessions", post(live_session_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

type ApiError = (StatusCode, String);

fn internal(e: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveGameView {
    pub game_uuid: String,
    pub game: Option<Game>,
    pub stats: Option<GameStats>,
}

/// GET /api/live
async fn live_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tracked = state.tracked.read().await.clone();
    let mut views = Vec::with_capacity(tracked.len());
    for (game_uuid, stats) in tracked {
        let game = state.snapshots.game(&game_uuid).await;
        views.push(LiveGameView {
            game_uuid,
            game,
            stats,
        });
    }
    views.sort_by(|a, b| a.game_uuid.cmp(&b.game_uuid));
    Json(views)
}

/// GET /api/games (current season schedule, last known good)
async fn games_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshots.current(&state.season).await)
}

/// GET /api/games/previous (the schedule replaced by the last refresh)
async fn previous_games_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshots.previous(&state.season).await)
}

/// GET /api/games/:uuid/events
async fn game_events_handler(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.events.read(&uuid).map(Json).map_err(internal)
}

/// GET /api/standings
async fn standings_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshots.standings(&state.season).await)
}

#[derive(Debug, Deserialize)]
pub struct FollowTeams {
    pub token: String,
    pub teams: Vec<String>,
}

/// POST /api/subscriptions
async fn follow_teams_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FollowTeams>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .registry
        .follow_teams(&body.token, body.teams)
        .map(|_| StatusCode::CREATED)
        .map_err(internal)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLiveSession {
    pub token: String,
    pub game_uuid: String,
}

/// POST /api/live-sessions
async fn live_session_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartLiveSession>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .registry
        .start_live_session(&body.token, &body.game_uuid)
        .map(|_| StatusCode::CREATED)
        .map_err(internal)
}

/// DELETE /api/subscriptions/:token
async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.registry.remove_token(&token) {
        Ok(0) => Ok(StatusCode::NOT_FOUND),
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(internal(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{GameState, Subscriber};
    use crate::db::Database;
    use crate::events::store::tests::goal_event;
    use crate::live_scores::differ::tests::snapshot;
    use crate::live_scores::snapshots::tests::{game, ScriptedProvider};
    use axum::response::Response;
    use chrono::Utc;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    fn state() -> Arc<AppState> {
        let db = Database::open(":memory:").unwrap();
        let provider = Arc::new(ScriptedProvider::default());
        provider.push_season(Some(vec![game("g1", 1001, Utc::now())]));
        provider.push_season(Some(vec![game("g1", 1001, Utc::now())]));
        Arc::new(AppState {
            season: "2024".into(),
            snapshots: Arc::new(GameSnapshotStore::new(provider, db.clone())),
            events: EventStore::new(db.clone()),
            registry: SubscriberRegistry::new(db),
            tracked: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn live_lists_tracked_games_with_schedule() {
        let s = state();
        s.snapshots.refresh("2024").await;
        s.tracked
            .write()
            .await
            .insert("g1".into(), Some(snapshot(GameState::Ongoing, 1, 0)));

        let resp = live_handler(State(s)).await.into_response();
        let json = body_json(resp).await;
        assert_eq!(json[0]["gameUuid"], "g1");
        assert_eq!(json[0]["game"]["homeTeamCode"], "LHF");
        assert_eq!(json[0]["stats"]["gameState"], "Ongoing");
    }

    #[tokio::test]
    async fn previous_schedule_is_served_after_a_second_refresh() {
        let s = state();
        let resp = previous_games_handler(State(s.clone())).await.into_response();
        assert_eq!(body_json(resp).await, serde_json::json!([]));

        s.snapshots.refresh("2024").await;
        s.snapshots.refresh("2024").await;
        let resp = previous_games_handler(State(s)).await.into_response();
        assert_eq!(body_json(resp).await[0]["gameUuid"], "g1");
    }

    #[tokio::test]
    async fn events_are_listed_in_insertion_order() {
        let s = state();
        s.events.store(goal_event("2", 1, 1, 0)).unwrap();
        s.events.store(goal_event("1", 1, 2, 0)).unwrap();

        let resp = game_events_handler(State(s), Path("g1".into()))
            .await
            .unwrap()
            .into_response();
        let json = body_json(resp).await;
        assert_eq!(json[0]["id"], "2");
        assert_eq!(json[1]["id"], "1");
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe() {
        let s = state();
        let follow = FollowTeams {
            token: "tok".into(),
            teams: vec!["LHF".into()],
        };
        let resp = follow_teams_handler(State(s.clone()), Json(follow))
            .await
            .unwrap()
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let session = StartLiveSession {
            token: "tok".into(),
            game_uuid: "g1".into(),
        };
        live_session_handler(State(s.clone()), Json(session))
            .await
            .unwrap();
        let subs = s.registry.list().unwrap();
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().any(|sub| matches!(sub, Subscriber::LiveSession(_))));

        let resp = unsubscribe_handler(State(s.clone()), Path("tok".into()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = unsubscribe_handler(State(s), Path("tok".into()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
