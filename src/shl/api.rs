use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::client::{ApiRequest, RateLimitedClient};
use super::token::TokenCache;
use crate::db::models::{Game, GameStats, Standing};
use crate::live_scores::StatsProvider;

/// `StatsProvider` backed by the league's REST API.
///
/// All calls, token refreshes included, go through the same
/// `RateLimitedClient`.
pub struct ShlClient {
    client: Arc<RateLimitedClient>,
    tokens: TokenCache,
}

impl ShlClient {
    pub fn new(client: Arc<RateLimitedClient>, credentials: Option<(String, String)>) -> Self {
        let tokens = TokenCache::new(Arc::clone(&client), credentials);
        ShlClient { client, tokens }
    }

    async fn authed(&self, path: String) -> ApiRequest {
        ApiRequest::get(path).bearer(self.tokens.bearer().await)
    }
}

#[async_trait]
impl StatsProvider for ShlClient {
    fn name(&self) -> &str {
        "SHL"
    }

    async fn season_games(&self, season: &str) -> Option<Vec<Game>> {
        let request = self
            .authed(format!("/seasons/{}/games", season))
            .await;
        let raw = self.client.call(request).await?;
        let mut games: Vec<Game> = parse_list(&raw, "games");
        for game in &mut games {
            if game.season.is_empty() {
                game.season = season.to_string();
            }
        }
        debug!("Fetched {} games for season {}", games.len(), season);
        Some(games)
    }

    async fn game_stats(&self, game_uuid: &str) -> Option<GameStats> {
        let request = self.authed(format!("/games/{}/stats", game_uuid)).await;
        self.client.call_as(request).await
    }

    async fn standings(&self, season: &str) -> Option<Vec<Standing>> {
        let request = self
            .authed(format!("/seasons/{}/standings", season))
            .await;
        let raw = self.client.call(request).await?;
        Some(parse_list(&raw, "standings"))
    }

    async fn feed_token(&self) -> Option<String> {
        self.tokens.bearer().await
    }
}

/// Accepts either a bare array or `{ "<field>": [...] }`. Entries that do
/// not match `T` are skipped.
fn parse_list<T: DeserializeOwned>(raw: &Value, field: &str) -> Vec<T> {
    let items = match raw.as_array() {
        Some(a) => a,
        None => match raw.get(field).and_then(|v| v.as_array()) {
            Some(a) => a,
            None => return vec![],
        },
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Skipping malformed {} entry: {}", field, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shl::client::tests::RecordingTransport;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn parse_list_accepts_wrapped_and_bare_arrays() {
        let game = json!({
            "gameUuid": "g1",
            "gameId": 42,
            "homeTeamCode": "LHF",
            "awayTeamCode": "FBK",
            "startDateTime": "2024-10-01T17:00:00Z"
        });
        let wrapped: Vec<Game> = parse_list(&json!({ "games": [game.clone()] }), "games");
        let bare: Vec<Game> = parse_list(&json!([game, { "broken": true }]), "games");
        assert_eq!(wrapped.len(), 1);
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].game_id, Some(42));
    }

    #[tokio::test]
    async fn season_games_fills_in_season() {
        let transport = Arc::new(RecordingTransport::default());
        transport.responses.lock().unwrap().push_back(Ok(json!([{
            "gameUuid": "g1",
            "homeTeamCode": "LHF",
            "awayTeamCode": "FBK",
            "startDateTime": "2024-10-01T17:00:00Z"
        }])));
        let client = Arc::new(RateLimitedClient::new(transport.clone(), Duration::ZERO));
        let shl = ShlClient::new(client, None);

        let games = shl.season_games("2024").await.unwrap();
        assert_eq!(games[0].season, "2024");
        assert_eq!(transport.calls.lock().unwrap()[0].0, "/seasons/2024/games");
    }

    #[tokio::test]
    async fn failed_fetch_is_none() {
        let transport = Arc::new(RecordingTransport::default());
        transport
            .responses
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!("timeout")));
        let client = Arc::new(RateLimitedClient::new(transport, Duration::ZERO));
        let shl = ShlClient::new(client, None);
        assert!(shl.game_stats("g1").await.is_none());
    }
}
