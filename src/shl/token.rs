//! Bearer token cache.
//!
//! The token is fetched with one rate-limited call and reused until shortly
//! before it expires. Token refreshes therefore queue behind (and never
//! overlap with) data calls from the poll loop.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::client::{ApiRequest, RateLimitedClient};

const TOKEN_PATH: &str = "/oauth/v1/public/token";

/// Refresh this long before the provider-reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct TokenCache {
    client: Arc<RateLimitedClient>,
    /// (client_id, client_secret); without them requests go unauthenticated
    credentials: Option<(String, String)>,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(client: Arc<RateLimitedClient>, credentials: Option<(String, String)>) -> Self {
        TokenCache {
            client,
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, refreshing it if it is missing or about to expire.
    pub async fn bearer(&self) -> Option<String> {
        let (client_id, client_secret) = self.credentials.as_ref()?;

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + EXPIRY_MARGIN < token.expires_at {
                return Some(token.value.clone());
            }
            debug!("Bearer token expired, refreshing");
        }

        let request = ApiRequest::post_form(
            TOKEN_PATH,
            vec![
                ("grant_type".to_string(), "client_credentials".to_string()),
                ("client_id".to_string(), client_id.clone()),
                ("client_secret".to_string(), client_secret.clone()),
            ],
        );
        let resp: TokenResponse = self.client.call_as(request).await?;
        info!("Obtained bearer token (expires in {}s)", resp.expires_in);

        let value = resp.access_token.clone();
        *cached = Some(CachedToken {
            value: resp.access_token,
            expires_at: Instant::now() + Duration::from_secs(resp.expires_in),
        });
        Some(value)
    }
}
