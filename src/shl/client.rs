use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outbound call to the upstream provider.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
    pub bearer: Option<String>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        ApiRequest {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            form: None,
            bearer: None,
        }
    }

    pub fn post_form(path: impl Into<String>, form: Vec<(String, String)>) -> Self {
        ApiRequest {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            form: Some(form),
            bearer: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

/// Whatever actually carries a request to the provider.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<Value>;
}

/// reqwest-backed transport against the provider's REST base URL.
pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpTransport {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<Value> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        let resp = builder
            .send()
            .await
            .with_context(|| format!("Request to {} failed", request.path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Provider error {} on {}: {}", status, request.path, body);
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", request.path))
    }
}

/// Serialises and throttles every call to the upstream provider.
///
/// At most one request is in flight, and each call starts no earlier than
/// `min_spacing` after the previous one finished. Early calls wait rather
/// than fail. There is no retry here; the poll loop's next cycle is the retry.
pub struct RateLimitedClient {
    transport: Arc<dyn Transport>,
    min_spacing: Duration,
    /// End of the previous call; the lock itself is the in-flight guard
    last_call_end: Mutex<Option<Instant>>,
}

impl RateLimitedClient {
    pub fn new(transport: Arc<dyn Transport>, min_spacing: Duration) -> Self {
        RateLimitedClient {
            transport,
            min_spacing,
            last_call_end: Mutex::new(None),
        }
    }

    /// Issue `request`, resolving to `None` on transport or non-2xx failure.
    pub async fn call(&self, request: ApiRequest) -> Option<Value> {
        let mut last_end = self.last_call_end.lock().await;
        if let Some(end) = *last_end {
            let ready_at = end + self.min_spacing;
            if Instant::now() < ready_at {
                debug!(
                    "Rate limiter delaying {} by {:?}",
                    request.path,
                    ready_at - Instant::now()
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let result = self.transport.execute(&request).await;
        *last_end = Some(Instant::now());
        drop(last_end);

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Upstream call {} returned no data: {:#}", request.path, e);
                None
            }
        }
    }

    /// `call` followed by deserialisation into `T`; a shape mismatch is also
    /// "no data".
    pub async fn call_as<T: DeserializeOwned>(&self, request: ApiRequest) -> Option<T> {
        let path = request.path.clone();
        let value = self.call(request).await?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Unexpected response shape from {}: {}", path, e);
                None
            }
        }
    }
}
