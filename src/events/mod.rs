pub mod store;

pub use store::EventStore;

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::models::CanonicalEvent;
use crate::notify::EventDispatcher;

/// The gate every canonical event passes on its way to subscribers,
/// whichever source produced it.
pub struct EventPipeline {
    store: EventStore,
    dispatcher: Arc<EventDispatcher>,
}

impl EventPipeline {
    pub fn new(store: EventStore, dispatcher: Arc<EventDispatcher>) -> Self {
        EventPipeline { store, dispatcher }
    }

    #[cfg(test)]
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Record `event` and dispatch it if it is a new occurrence that no other
    /// source has already delivered. Returns whether it was dispatched.
    pub async fn publish(&self, event: CanonicalEvent) -> Result<bool> {
        let recorded = self.store.record(event.clone())?;
        if !recorded.is_new {
            debug!("Event {} of {} already stored", event.id, event.info.game_uuid);
            return Ok(false);
        }
        if recorded.covered {
            info!(
                "{} {} of {} already delivered from another source",
                event.event_type(),
                event.id,
                event.info.game_uuid
            );
            return Ok(false);
        }
        self.dispatcher.dispatch(&event).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EventSource, GameState};
    use crate::db::Database;
    use crate::events::store::tests::{away_goal_event, goal_event};
    use crate::live_scores::diff;
    use crate::live_scores::differ::tests::snapshot;
    use crate::notify::dispatcher::tests::RecordingPush;
    use crate::notify::SubscriberRegistry;

    fn pipeline() -> (EventPipeline, Arc<RecordingPush>) {
        let db = Database::open(":memory:").unwrap();
        let registry = SubscriberRegistry::new(db.clone());
        registry.follow_teams("fan", vec!["LHF".into()]).unwrap();
        let push = Arc::new(RecordingPush::default());
        let dispatcher = Arc::new(EventDispatcher::new(push.clone(), registry));
        (EventPipeline::new(EventStore::new(db), dispatcher), push)
    }

    #[tokio::test]
    async fn corrected_revision_is_stored_but_not_redelivered() {
        let (p, push) = pipeline();
        assert!(p.publish(goal_event("5", 1, 1, 0)).await.unwrap());
        assert!(!p.publish(goal_event("5", 2, 1, 0)).await.unwrap());

        assert_eq!(push.sent.lock().unwrap().len(), 1);
        let history = p.store().read("g1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].revision, 2);
    }

    #[tokio::test]
    async fn snapshot_goal_after_feed_goal_is_delivered_once() {
        let (p, push) = pipeline();
        assert!(p.publish(goal_event("5", 1, 1, 0)).await.unwrap());

        let mut from_snapshot = goal_event("goal-home-1", 0, 1, 0);
        from_snapshot.source = EventSource::Snapshot;
        assert!(!p.publish(from_snapshot).await.unwrap());

        assert_eq!(push.sent.lock().unwrap().len(), 1);
        assert_eq!(p.store().read("g1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn feed_goal_after_snapshot_goal_is_delivered_once() {
        let (p, push) = pipeline();
        let mut from_snapshot = goal_event("goal-home-1", 0, 1, 0);
        from_snapshot.source = EventSource::Snapshot;
        assert!(p.publish(from_snapshot).await.unwrap());
        assert!(!p.publish(goal_event("5", 1, 1, 0)).await.unwrap());
        assert_eq!(push.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn home_and_away_goals_in_one_interval_are_both_delivered() {
        let (p, push) = pipeline();
        let old = snapshot(GameState::Ongoing, 1, 0);
        let updated = snapshot(GameState::Ongoing, 2, 1);
        for event in diff(Some(&old), &updated) {
            assert!(p.publish(event).await.unwrap());
        }

        assert_eq!(p.store().read("g1").unwrap().len(), 2);
        assert_eq!(push.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn feed_goals_cover_both_goals_of_one_interval() {
        let (p, push) = pipeline();
        assert!(p.publish(goal_event("7", 1, 2, 0)).await.unwrap());
        assert!(p.publish(away_goal_event("8", 1, 2, 1)).await.unwrap());

        let old = snapshot(GameState::Ongoing, 1, 0);
        let updated = snapshot(GameState::Ongoing, 2, 1);
        for event in diff(Some(&old), &updated) {
            assert!(!p.publish(event).await.unwrap());
        }
        assert_eq!(push.sent.lock().unwrap().len(), 2);
        assert_eq!(p.store().read("g1").unwrap().len(), 4);
    }
}
