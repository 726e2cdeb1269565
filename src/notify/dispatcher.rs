use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::push::{PushKind, PushMessage, PushTransport};
use super::subscribers::SubscriberRegistry;
use crate::db::models::{CanonicalEvent, EventKind, EventType, Subscriber};
use crate::error::DeliveryError;

/// Aggregate outcome of one fan-out.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<(String, DeliveryError)>,
}

/// Fans canonical events out to the subscribers that want them.
pub struct EventDispatcher {
    transport: Arc<dyn PushTransport>,
    registry: SubscriberRegistry,
}

impl EventDispatcher {
    pub fn new(transport: Arc<dyn PushTransport>, registry: SubscriberRegistry) -> Self {
        EventDispatcher {
            transport,
            registry,
        }
    }

    /// Deliver `event` to every interested subscriber in `subscribers`.
    ///
    /// Each delivery is independent: a failure for one recipient never stops
    /// the others. Failures are collected and reported after all attempts.
    pub async fn notify(&self, event: &CanonicalEvent, subscribers: &[Subscriber]) -> DispatchReport {
        let messages: Vec<PushMessage> = subscribers
            .iter()
            .filter(|s| s.wants(event))
            .map(|s| message_for(event, s))
            .collect();
        if messages.is_empty() {
            return DispatchReport::default();
        }

        let outcomes = self.transport.deliver_batch(&messages).await;
        let mut report = DispatchReport {
            attempted: messages.len(),
            ..Default::default()
        };
        for (token, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => report.failures.push((token, e)),
            }
        }

        if report.failures.is_empty() {
            info!(
                "Dispatched {} {} for {} to {} recipient(s) via {}",
                event.event_type(),
                event.id,
                event.info.game_uuid,
                report.delivered,
                self.transport.name()
            );
        } else {
            warn!(
                "Dispatched {} {} for {}: {}/{} delivered, failures: {:?}",
                event.event_type(),
                event.id,
                event.info.game_uuid,
                report.delivered,
                report.attempted,
                report.failures
            );
        }
        report
    }

    /// Notify the registered subscribers, then clean up: tokens with a
    /// permanent failure are removed, and a game end closes its live sessions.
    pub async fn dispatch(&self, event: &CanonicalEvent) -> Result<DispatchReport> {
        let subscribers = self.registry.list()?;
        let report = self.notify(event, &subscribers).await;

        for (token, err) in &report.failures {
            if err.is_permanent() {
                let removed = self.registry.remove_token(token)?;
                info!("Removed {} subscription(s) for dead token {} ({})", removed, token, err);
            }
        }
        if event.event_type() == EventType::GameEnd {
            self.registry.end_live_sessions(&event.info.game_uuid)?;
        }
        Ok(report)
    }
}

fn message_for(event: &CanonicalEvent, subscriber: &Subscriber) -> PushMessage {
    let (title, body) = render(event);
    let kind = match subscriber {
        Subscriber::Team(_) => PushKind::Alert,
        Subscriber::LiveSession(_) if event.event_type() == EventType::GameEnd => {
            PushKind::LiveActivityEnd
        }
        Subscriber::LiveSession(_) => PushKind::LiveActivityUpdate,
    };
    let info = &event.info;
    PushMessage {
        token: subscriber.token().to_string(),
        kind,
        title,
        body,
        payload: json!({
            "gameUuid": info.game_uuid,
            "eventId": event.id,
            "eventType": event.event_type(),
            "homeTeamCode": info.home_team_code,
            "awayTeamCode": info.away_team_code,
            "homeResult": info.home_result,
            "awayResult": info.away_result,
            "period": info.period,
            "gameTime": info.game_time,
        }),
    }
}

fn render(event: &CanonicalEvent) -> (String, String) {
    let i = &event.info;
    let score = format!(
        "{} {} - {} {}",
        i.home_team_code, i.home_result, i.away_result, i.away_team_code
    );
    match &event.kind {
        EventKind::GameStart => (
            format!("{} - {}", i.home_team_code, i.away_team_code),
            "The game has started".to_string(),
        ),
        EventKind::GameEnd => (format!("Final: {}", score), "The game is over".to_string()),
        EventKind::Goal {
            team_code,
            scorer,
            is_power_play,
            ..
        } => {
            let title = match team_code {
                Some(team) => format!("GOAL for {}!", team),
                None => "GOAL!".to_string(),
            };
            let mut body = score;
            if let Some(p) = scorer {
                body.push_str(&format!(" · {}", p));
            }
            if *is_power_play {
                body.push_str(" (PP)");
            }
            (title, body)
        }
        EventKind::Penalty {
            team_code,
            player,
            duration,
            reason,
        } => {
            let who = player
                .as_ref()
                .map(|p| p.to_string())
                .or_else(|| team_code.clone())
                .unwrap_or_default();
            let mut body = reason.clone();
            if let Some(d) = duration {
                body = format!("{}, {}", d, body);
            }
            (format!("Penalty {}", who).trim_end().to_string(), body)
        }
        EventKind::PeriodStart => (format!("Period {} started", i.period), score),
        EventKind::PeriodEnd => (format!("Period {} ended", i.period), score),
    }
}
