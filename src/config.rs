use clap::Parser;
use std::time::Duration;

/// Live hockey event detection and notification service
#[derive(Parser, Debug, Clone)]
#[command(name = "shl-live", version, about)]
pub struct Config {
    /// Upstream REST base URL
    #[arg(long, env = "SHL_API_URL", default_value = "https://openapi.shl.se")]
    pub api_url: String,

    /// Live feed websocket URL
    #[arg(long, env = "SHL_FEED_URL", default_value = "wss://live.shl.se/socket")]
    pub feed_url: String,

    /// OAuth client id (token requests are skipped when absent)
    #[arg(long, env = "SHL_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "SHL_CLIENT_SECRET")]
    pub client_secret: Option<String>,

    /// Season code to track
    #[arg(long, env = "SHL_SEASON", default_value = "2024")]
    pub season: String,

    /// Minimum spacing between upstream calls, end of one to start of the next
    #[arg(long, env = "MIN_CALL_SPACING_MS", default_value = "3000")]
    pub min_call_spacing_ms: u64,

    /// Cycle delay while games are tracked
    #[arg(long, env = "ACTIVE_POLL_SECS", default_value = "3")]
    pub active_poll_secs: u64,

    /// Cycle delay with nothing tracked, and after a failed cycle
    #[arg(long, env = "IDLE_POLL_SECS", default_value = "60")]
    pub idle_poll_secs: u64,

    /// How far ahead of its start a game enters the live window
    #[arg(long, env = "LOOKAHEAD_MINUTES", default_value = "10")]
    pub lookahead_minutes: i64,

    /// Lifetime of a cached feed report
    #[arg(long, env = "REPORT_TTL_SECS", default_value = "300")]
    pub report_ttl_secs: u64,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "shl-live.db")]
    pub database_path: String,

    /// Status router listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    /// HTTP push relay; deliveries are only logged when absent
    #[arg(long, env = "PUSH_GATEWAY_URL")]
    pub push_gateway_url: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_call_spacing_ms == 0 {
            anyhow::bail!("min_call_spacing_ms must be positive");
        }
        if self.active_poll_secs > self.idle_poll_secs {
            anyhow::bail!("active_poll_secs must not exceed idle_poll_secs");
        }
        if self.client_id.is_some() && self.client_secret.is_none() {
            anyhow::bail!("SHL_CLIENT_SECRET is required when SHL_CLIENT_ID is set");
        }
        if !(self.feed_url.starts_with("ws://") || self.feed_url.starts_with("wss://")) {
            anyhow::bail!("feed_url must be a ws:// or wss:// URL");
        }
        if self.lookahead_minutes < 0 {
            anyhow::bail!("lookahead_minutes must not be negative");
        }
        Ok(())
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        self.client_id.clone().zip(self.client_secret.clone())
    }

    pub fn call_spacing(&self) -> Duration {
        Duration::from_millis(self.min_call_spacing_ms)
    }
}
