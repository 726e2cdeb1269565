//! Durable per-game event history; the authority on "already delivered".
//!
//! Each game's history is one document, kept in first-insertion order. For a
//! given `(game_uuid, id)` only the highest revision is retained, replaced in
//! place so the position never moves.

use anyhow::Result;
use tracing::debug;

use crate::db::models::CanonicalEvent;
use crate::db::Database;

/// What `record` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    /// Appended as a new occurrence
    pub is_new: bool,
    /// Another stored event (different id) already describes the same occurrence
    pub covered: bool,
}

#[derive(Clone)]
pub struct EventStore {
    db: Database,
}

fn history_key(game_uuid: &str) -> String {
    format!("events/{}", game_uuid)
}

impl EventStore {
    pub fn new(db: Database) -> Self {
        EventStore { db }
    }

    /// Store `event`, returning whether it is a new occurrence.
    ///
    /// A higher revision of a known id replaces the stored one but is not
    /// new; an equal or lower revision is ignored.
    #[cfg(test)]
    pub fn store(&self, event: CanonicalEvent) -> Result<bool> {
        self.record(event).map(|r| r.is_new)
    }

    /// `store` plus a cross-source equivalence check, as one atomic step.
    pub fn record(&self, event: CanonicalEvent) -> Result<Recorded> {
        let key = history_key(event.game_uuid());
        self.db.update(&key, |history: &mut Vec<CanonicalEvent>| {
            let covered = event.equivalence_key().is_some_and(|k| {
                history
                    .iter()
                    .any(|e| e.id != event.id && e.equivalence_key().as_deref() == Some(k.as_str()))
            });

            match history.iter_mut().find(|e| e.id == event.id) {
                None => {
                    history.push(event);
                    Recorded {
                        is_new: true,
                        covered,
                    }
                }
                Some(existing) if event.revision > existing.revision => {
                    debug!(
                        "Event {} of {} revised {} -> {}",
                        event.id,
                        event.info.game_uuid,
                        existing.revision,
                        event.revision
                    );
                    *existing = event;
                    Recorded {
                        is_new: false,
                        covered,
                    }
                }
                Some(_) => Recorded {
                    is_new: false,
                    covered,
                },
            }
        })
    }

    /// History of one game in first-insertion order.
    pub fn read(&self, game_uuid: &str) -> Result<Vec<CanonicalEvent>> {
        Ok(self.db.read(&history_key(game_uuid))?.unwrap_or_default())
    }
}
