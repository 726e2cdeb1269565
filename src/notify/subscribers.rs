use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::db::models::{LiveSession, Subscriber, TeamSubscriber};
use crate::db::Database;

const SUBSCRIBERS_KEY: &str = "subscribers";

/// Persisted list of notification targets. Changed by user action and by
/// dispatch cleanup only.
#[derive(Clone)]
pub struct SubscriberRegistry {
    db: Database,
}

impl SubscriberRegistry {
    pub fn new(db: Database) -> Self {
        SubscriberRegistry { db }
    }

    pub fn list(&self) -> Result<Vec<Subscriber>> {
        Ok(self.db.read(SUBSCRIBERS_KEY)?.unwrap_or_default())
    }

    /// Follow `teams` with `token`, replacing the token's previous team list.
    pub fn follow_teams(&self, token: &str, teams: Vec<String>) -> Result<()> {
        self.db.update(SUBSCRIBERS_KEY, |subs: &mut Vec<Subscriber>| {
            subs.retain(|s| !matches!(s, Subscriber::Team(t) if t.token == token));
            subs.push(Subscriber::Team(TeamSubscriber {
                token: token.to_string(),
                teams,
            }));
        })
    }

    pub fn start_live_session(&self, token: &str, game_uuid: &str) -> Result<()> {
        self.db.update(SUBSCRIBERS_KEY, |subs: &mut Vec<Subscriber>| {
            subs.retain(|s| {
                !matches!(s, Subscriber::LiveSession(l) if l.token == token && l.game_uuid == game_uuid)
            });
            subs.push(Subscriber::LiveSession(LiveSession {
                token: token.to_string(),
                game_uuid: game_uuid.to_string(),
                started_at: Utc::now(),
            }));
        })
    }

    /// Remove every live session of a game. Returns how many were removed.
    pub fn end_live_sessions(&self, game_uuid: &str) -> Result<usize> {
        let removed = self.db.update(SUBSCRIBERS_KEY, |subs: &mut Vec<Subscriber>| {
            let before = subs.len();
            subs.retain(|s| !matches!(s, Subscriber::LiveSession(l) if l.game_uuid == game_uuid));
            before - subs.len()
        })?;
        if removed > 0 {
            info!("Ended {} live session(s) for game {}", removed, game_uuid);
        }
        Ok(removed)
    }

    /// Remove every subscription held by `token`.
    pub fn remove_token(&self, token: &str) -> Result<usize> {
        self.db.update(SUBSCRIBERS_KEY, |subs: &mut Vec<Subscriber>| {
            let before = subs.len();
            subs.retain(|s| s.token() != token);
            before - subs.len()
        })
    }
}
