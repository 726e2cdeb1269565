use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use crate::error::DeliveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    /// Visible alert to a team follower
    Alert,
    /// Silent content refresh of a live session
    LiveActivityUpdate,
    /// Final content of a live session
    LiveActivityEnd,
}

/// One message to one recipient token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub token: String,
    pub kind: PushKind,
    pub title: String,
    pub body: String,
    pub payload: Value,
}

/// Delivery side of the push provider.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(&self, message: &PushMessage) -> Result<(), DeliveryError>;

    /// Deliver a batch, reporting the outcome per token. Every message is
    /// attempted regardless of earlier failures.
    async fn deliver_batch(
        &self,
        messages: &[PushMessage],
    ) -> Vec<(String, Result<(), DeliveryError>)> {
        let attempts = messages.iter().map(|m| async move {
            (m.token.clone(), self.deliver(m).await)
        });
        futures_util::future::join_all(attempts).await
    }

    fn name(&self) -> &str;
}

/// Posts each message as JSON to an HTTP push relay.
pub struct HttpPushGateway {
    http: Client,
    url: String,
}

impl HttpPushGateway {
    pub fn new(url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build push HTTP client")?;
        Ok(HttpPushGateway {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl PushTransport for HttpPushGateway {
    fn name(&self) -> &str {
        "http-push"
    }

    async fn deliver(&self, message: &PushMessage) -> Result<(), DeliveryError> {
        let resp = self
            .http
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 410 || body.contains("BadDeviceToken") || body.contains("Unregistered") {
            return Err(DeliveryError::InvalidToken);
        }
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
        })
    }
}

/// Used when no push relay is configured: deliveries are only logged.
pub struct LogPush;

#[async_trait]
impl PushTransport for LogPush {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, message: &PushMessage) -> Result<(), DeliveryError> {
        info!(
            "[push:{:?}] {} → {}: {}",
            message.kind, message.token, message.title, message.body
        );
        Ok(())
    }
}
